//! Named tool set given to one loop run.

use std::sync::Arc;

use super::tool::Tool;
use super::types::ToolDescriptor;
use crate::error::ConductorError;

/// Registration-ordered set of tools, unique by name.
///
/// A registry is never mutated once handed to a loop; the consuming builders
/// and the narrowing helpers all return a new registry.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Arc<Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry, rejecting duplicate names.
    pub fn from_tools(tools: Vec<Arc<dyn Tool>>) -> Result<Self, ConductorError> {
        tools
            .into_iter()
            .try_fold(Self::new(), |registry, tool| registry.with_tool(tool))
    }

    /// Add a tool.
    pub fn with_tool(self, tool: Arc<dyn Tool>) -> Result<Self, ConductorError> {
        if self.contains(tool.name()) {
            return Err(ConductorError::Configuration(format!(
                "tool '{}' registered twice",
                tool.name()
            )));
        }
        let mut tools = Arc::try_unwrap(self.tools).unwrap_or_else(|shared| (*shared).clone());
        tools.push(tool);
        Ok(Self {
            tools: Arc::new(tools),
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|tool| tool.name() == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.get(name)
            .is_some_and(|tool| tool.sensitivity().is_some())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|tool| tool.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors advertised to the gateway, in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .iter()
            .map(|tool| ToolDescriptor {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters().schema.clone(),
                sensitive: tool.sensitivity().is_some(),
            })
            .collect()
    }

    /// Keep only the named tools. Unknown names are ignored.
    pub fn narrowed<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let keep = |tool: &&Arc<dyn Tool>| names.iter().any(|n| n.as_ref() == tool.name());
        Self {
            tools: Arc::new(self.tools.iter().filter(keep).cloned().collect()),
        }
    }

    /// Drop one tool by name.
    pub fn without(&self, name: &str) -> Self {
        Self {
            tools: Arc::new(
                self.tools
                    .iter()
                    .filter(|tool| tool.name() != name)
                    .cloned()
                    .collect(),
            ),
        }
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{AgentTool, ToolParameters};
    use crate::types::RiskLevel;
    use serde_json::json;

    fn tool(name: &str) -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            name,
            format!("{name} tool"),
            ToolParameters::empty(),
            |_args, _ctx| async move { Ok(json!(null)) },
        ))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = ToolRegistry::from_tools(vec![tool("echo"), tool("echo")]).unwrap_err();
        assert!(matches!(err, ConductorError::Configuration(_)));
    }

    #[test]
    fn descriptors_follow_registration_order_and_flag_sensitive_tools() {
        let publish: Arc<dyn Tool> = Arc::new(
            AgentTool::new("publish", "Publish", ToolParameters::empty(), |_a, _c| async move {
                Ok(json!(null))
            })
            .sensitive(RiskLevel::High, false),
        );
        let registry = ToolRegistry::from_tools(vec![tool("search"), publish]).unwrap();

        let descriptors = registry.descriptors();
        assert_eq!(descriptors[0].name, "search");
        assert!(!descriptors[0].sensitive);
        assert_eq!(descriptors[1].name, "publish");
        assert!(descriptors[1].sensitive);
        assert!(registry.is_sensitive("publish"));
    }

    #[test]
    fn narrowing_leaves_the_source_untouched() {
        let registry =
            ToolRegistry::from_tools(vec![tool("search"), tool("write"), tool("delegate_task")])
                .unwrap();

        let narrowed = registry.narrowed(&["write", "missing"]);
        assert_eq!(narrowed.names(), vec!["write"]);

        let without = registry.without("delegate_task");
        assert_eq!(without.names(), vec!["search", "write"]);
        assert_eq!(registry.len(), 3);
    }
}
