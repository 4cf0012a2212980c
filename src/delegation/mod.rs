//! Sub-agent delegation: run a bounded nested loop and fold its outcome into
//! one tool result.
//!
//! Depth is carried explicitly on [`AgentTask`] and checked before any nested
//! loop is built, so a depth violation never reaches the gateway.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::events::{LoopEventEmitter, LoopEventPayload};
use crate::agent_loop::types::{Outcome, OutcomeStatus};
use crate::agent_loop::AgentLoop;
use crate::approval::DecisionProvider;
use crate::budget::Budget;
use crate::config::LoopConfig;
use crate::conversation::ConversationState;
use crate::error::ConductorError;
use crate::gateway::ModelGateway;
use crate::streaming::FragmentSink;
use crate::tools::{Tool, ToolArguments, ToolExecutionContext, ToolParameters, ToolRegistry};
use crate::types::{ToolErrorKind, ToolResult};

/// Name under which the delegation tool is registered.
pub const DELEGATE_TOOL_NAME: &str = "delegate_task";

/// A sub-task handed to the delegation manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct AgentTask {
    #[builder(into)]
    pub description: String,
    #[builder(into)]
    pub role: String,
    /// References resolved through the [`InputResolver`] and appended to the
    /// sub-agent's first turn.
    #[builder(default)]
    #[serde(default)]
    pub input_refs: Vec<String>,
    #[builder(into)]
    pub output_target: Option<String>,
    /// Requested budget; always capped by the delegating loop's remainder.
    pub budget: Option<Budget>,
    /// Depth of the delegating loop (0 for the root).
    #[builder(default)]
    #[serde(default)]
    pub depth: usize,
}

impl AgentTask {
    /// Instructions given to the sub-agent.
    pub fn system_prompt(&self) -> String {
        match &self.output_target {
            Some(target) => format!(
                "You are a {}. Complete your task and write your output to {target} using the available tools.",
                self.role
            ),
            None => format!("You are a {}. Complete your task using the available tools.", self.role),
        }
    }
}

/// Resolves an input reference (a path, key or URL) to text.
#[async_trait]
pub trait InputResolver: Send + Sync {
    async fn resolve(&self, reference: &str) -> Result<String, ConductorError>;
}

/// In-memory references.
#[derive(Debug, Clone, Default)]
pub struct StaticInputResolver {
    entries: HashMap<String, String>,
}

impl StaticInputResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, reference: impl Into<String>, content: impl Into<String>) -> Self {
        self.entries.insert(reference.into(), content.into());
        self
    }
}

#[async_trait]
impl InputResolver for StaticInputResolver {
    async fn resolve(&self, reference: &str) -> Result<String, ConductorError> {
        self.entries
            .get(reference)
            .cloned()
            .ok_or_else(|| ConductorError::InvalidArgument(format!("unknown reference '{reference}'")))
    }
}

/// Reads references as files relative to a workspace root.
#[derive(Debug, Clone)]
pub struct FileInputResolver {
    root: PathBuf,
}

impl FileInputResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl InputResolver for FileInputResolver {
    async fn resolve(&self, reference: &str) -> Result<String, ConductorError> {
        let relative = Path::new(reference);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(ConductorError::InvalidArgument(format!(
                "reference '{reference}' escapes the workspace"
            )));
        }
        Ok(tokio::fs::read_to_string(self.root.join(relative)).await?)
    }
}

/// Spawns nested, independently budgeted loops for delegated tasks.
#[derive(Clone, Builder)]
pub struct DelegationManager {
    gateway: Arc<dyn ModelGateway>,
    /// Base configuration for sub-agents; the model's system prompt is
    /// replaced per task.
    #[builder(default)]
    config: LoopConfig,
    /// Tools available to sub-agents. `delegate_task` is stripped and only
    /// re-added when nested delegation is allowed.
    #[builder(default)]
    registry: ToolRegistry,
    decision_provider: Option<Arc<dyn DecisionProvider>>,
    resolver: Option<Arc<dyn InputResolver>>,
    fragment_sink: Option<FragmentSink>,
}

impl DelegationManager {
    /// The `delegate_task` tool backed by this manager.
    pub fn tool(&self) -> Arc<dyn Tool> {
        Arc::new(DelegateTaskTool::new(self.clone()))
    }

    /// Run `task` and fold the outcome into a result for `call_id`.
    pub async fn delegate(
        &self,
        call_id: &str,
        task: AgentTask,
        parent_remaining: Option<Budget>,
        cancel: CancellationToken,
    ) -> ToolResult {
        let role = task.role.clone();
        let output_target = task.output_target.clone();
        match self.run_task(task, parent_remaining, cancel, None, call_id).await {
            Ok(outcome) => match outcome_output(&role, output_target.as_deref(), &outcome) {
                Ok(output) => ToolResult::success(call_id, output),
                Err(ConductorError::DelegationIncomplete { output, .. }) => {
                    ToolResult::error_with_output(call_id, ToolErrorKind::DelegationIncomplete, output)
                }
                Err(err) => ToolResult::error(call_id, ToolErrorKind::Handler, err.to_string()),
            },
            Err(err @ ConductorError::DelegationDepthExceeded { .. }) => {
                ToolResult::error(call_id, ToolErrorKind::DelegationDepthExceeded, err.to_string())
            }
            Err(err) => ToolResult::error(call_id, ToolErrorKind::Handler, err.to_string()),
        }
    }

    /// Validate depth, build the nested loop and run it to a terminal outcome.
    pub async fn run_task(
        &self,
        task: AgentTask,
        parent_remaining: Option<Budget>,
        cancel: CancellationToken,
        events: Option<LoopEventEmitter>,
        call_id: &str,
    ) -> Result<Outcome, ConductorError> {
        let max_depth = self.config.delegation.max_depth;
        if task.depth >= max_depth {
            tracing::warn!(
                depth = task.depth,
                max_depth,
                role = %task.role,
                "delegation refused: depth limit reached"
            );
            return Err(ConductorError::DelegationDepthExceeded {
                depth: task.depth,
                max_depth,
            });
        }

        let child_depth = task.depth + 1;
        let budget = self.sub_budget(&task, parent_remaining.as_ref());
        let registry = self.sub_registry()?;
        let mut config = self.config.clone();
        config.model.system = Some(task.system_prompt());
        let seed = self.seed_text(&task).await;

        tracing::info!(
            role = %task.role,
            child_depth,
            max_iterations = budget.max_iterations,
            tools = ?registry.names(),
            "delegating task"
        );
        if let Some(events) = &events {
            events.emit(LoopEventPayload::DelegationStarted {
                call_id: call_id.to_string(),
                role: task.role.clone(),
                child_depth,
            });
        }

        let sub_loop = AgentLoop::builder()
            .gateway(self.gateway.clone())
            .registry(registry)
            .config(config)
            .maybe_decision_provider(self.decision_provider.clone())
            .depth(child_depth)
            .maybe_event_sink(events.as_ref().and_then(LoopEventEmitter::sink))
            .maybe_fragment_sink(self.fragment_sink.clone())
            .build();
        let outcome =
            Box::pin(sub_loop.run_conversation(ConversationState::seeded(seed), budget, cancel)).await;

        if let Some(events) = &events {
            events.emit(LoopEventPayload::DelegationFinished {
                call_id: call_id.to_string(),
                role: task.role.clone(),
                status: outcome.status,
            });
        }
        Ok(outcome)
    }

    fn sub_budget(&self, task: &AgentTask, parent_remaining: Option<&Budget>) -> Budget {
        let requested = task.budget.unwrap_or_else(|| {
            let mut budget = self.config.budget.to_budget();
            budget.max_iterations = self.config.delegation.sub_agent_max_iterations;
            budget
        });
        match parent_remaining {
            Some(parent) => requested.capped_by(parent),
            None => requested.capped_by(&requested),
        }
    }

    fn sub_registry(&self) -> Result<ToolRegistry, ConductorError> {
        let registry = self.registry.without(DELEGATE_TOOL_NAME);
        if self.config.delegation.allow_nested {
            registry.with_tool(self.tool())
        } else {
            Ok(registry)
        }
    }

    async fn seed_text(&self, task: &AgentTask) -> String {
        let Some(resolver) = &self.resolver else {
            if !task.input_refs.is_empty() {
                tracing::warn!(refs = ?task.input_refs, "no input resolver; references skipped");
            }
            return task.description.clone();
        };

        let mut materials = String::new();
        for reference in &task.input_refs {
            match resolver.resolve(reference).await {
                Ok(content) => {
                    materials.push_str(&format!("--- {reference} ---\n{content}\n--- End ---\n\n"));
                }
                Err(err) => {
                    tracing::warn!(reference = %reference, error = %err, "skipping unresolved reference");
                }
            }
        }
        if materials.is_empty() {
            task.description.clone()
        } else {
            format!("{}\n\nReference materials:\n{materials}", task.description)
        }
    }
}

impl std::fmt::Debug for DelegationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationManager")
            .field("delegation", &self.config.delegation)
            .field("registry", &self.registry)
            .field("has_resolver", &self.resolver.is_some())
            .finish()
    }
}

/// Output of a delegation, or `DelegationIncomplete` carrying it.
fn outcome_output(
    role: &str,
    output_target: Option<&str>,
    outcome: &Outcome,
) -> Result<serde_json::Value, ConductorError> {
    let content = outcome.content.clone().or_else(|| {
        (outcome.status == OutcomeStatus::Completed)
            .then(|| output_target.map(|target| format!("Output written to {target}")))
            .flatten()
    });
    let mut output = json!({
        "status": outcome.status,
        "role": role,
        "content": content,
        "iterations": outcome.iterations(),
        "usage": outcome.usage,
    });
    if outcome.status == OutcomeStatus::Completed {
        return Ok(output);
    }

    let message = match &outcome.error {
        Some(reason) => format!("Delegated task ended {}: {reason}", outcome.status),
        None => format!("Delegated task ended {}", outcome.status),
    };
    output["error"] = json!(message);
    output["kind"] = json!(ToolErrorKind::DelegationIncomplete);
    Err(ConductorError::DelegationIncomplete {
        status: outcome.status.to_string(),
        output,
    })
}

/// The `delegate_task` tool.
pub struct DelegateTaskTool {
    manager: DelegationManager,
    parameters: ToolParameters,
}

impl DelegateTaskTool {
    pub fn new(manager: DelegationManager) -> Self {
        Self {
            manager,
            parameters: ToolParameters::object()
                .string("description", "What the sub-agent must accomplish", true)
                .string("role", "Role the sub-agent plays, e.g. 'technical writer'", true)
                .string_array("input_refs", "References to include as reference material", false)
                .string("output_target", "Where the sub-agent writes its output", false)
                .integer("max_iterations", "Iteration budget for the sub-agent", false)
                .build(),
        }
    }
}

#[async_trait]
impl Tool for DelegateTaskTool {
    fn name(&self) -> &str {
        DELEGATE_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Delegate a focused sub-task to a sub-agent with its own budget and tools"
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value, ConductorError> {
        let budget = match args.get_i64("max_iterations") {
            Ok(max) if max > 0 => Some(Budget::new(max.min(u32::MAX as i64) as u32)),
            _ => None,
        };
        let task = AgentTask::builder()
            .description(args.get_str("description")?)
            .role(args.get_str("role")?)
            .input_refs(args.get_str_list("input_refs"))
            .maybe_output_target(args.get_str_opt("output_target"))
            .maybe_budget(budget)
            .depth(ctx.depth)
            .build();
        let role = task.role.clone();
        let output_target = task.output_target.clone();

        let outcome = self
            .manager
            .run_task(
                task,
                ctx.remaining_budget,
                ctx.cancel.clone(),
                ctx.events.clone(),
                &ctx.call_id,
            )
            .await?;
        outcome_output(&role, output_target.as_deref(), &outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayResponse, ScriptedGateway};
    use crate::types::ContentBlock;

    fn manager(gateway: Arc<ScriptedGateway>) -> DelegationManager {
        DelegationManager::builder().gateway(gateway).build()
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn delegation_futures_are_send() {
        let manager = manager(Arc::new(ScriptedGateway::new([GatewayResponse::final_text("ok")])));
        let task = AgentTask::builder().description("summarize").role("editor").build();
        assert_send(&manager.run_task(task, None, CancellationToken::new(), None, "d1"));

        let tool = DelegateTaskTool::new(manager.clone());
        let args = ToolArguments::new(json!({ "description": "summarize", "role": "editor" }));
        let ctx = ToolExecutionContext::default();
        assert_send(&tool.execute(&args, &ctx));
    }

    #[tokio::test]
    async fn depth_limit_is_checked_before_any_gateway_call() {
        let gateway = Arc::new(ScriptedGateway::new([GatewayResponse::final_text("never")]));
        let task = AgentTask::builder()
            .description("write the intro")
            .role("writer")
            .depth(1)
            .build();

        let result = manager(gateway.clone())
            .delegate("d1", task, None, CancellationToken::new())
            .await;

        assert_eq!(result.error_kind, Some(ToolErrorKind::DelegationDepthExceeded));
        assert_eq!(gateway.invocations(), 0);
    }

    #[tokio::test]
    async fn completed_sub_agent_reports_its_text() {
        let gateway = Arc::new(ScriptedGateway::new([GatewayResponse::final_text("Intro drafted.")]));
        let task = AgentTask::builder()
            .description("write the intro")
            .role("technical writer")
            .output_target("intro.md")
            .build();

        let result = manager(gateway.clone())
            .delegate("d1", task, Some(Budget::new(10)), CancellationToken::new())
            .await;

        assert!(!result.is_error);
        assert_eq!(result.output["status"], "completed");
        assert_eq!(result.output["content"], "Intro drafted.");
        let request = &gateway.requests()[0];
        assert_eq!(request.depth, 1);
        assert_eq!(
            request.model.system.as_deref(),
            Some("You are a technical writer. Complete your task and write your output to intro.md using the available tools.")
        );
    }

    #[tokio::test]
    async fn silent_completion_names_the_output_target() {
        let gateway = Arc::new(ScriptedGateway::new([GatewayResponse {
            blocks: Vec::new(),
            termination: crate::gateway::Termination::Final,
            usage: Default::default(),
        }]));
        let task = AgentTask::builder()
            .description("write")
            .role("writer")
            .output_target("out.md")
            .build();
        let result = manager(gateway)
            .delegate("d1", task, None, CancellationToken::new())
            .await;
        assert_eq!(result.output["content"], "Output written to out.md");
    }

    #[tokio::test]
    async fn exhausted_sub_agent_is_an_annotated_error_result() {
        let gateway = Arc::new(ScriptedGateway::from_fn(|index, _| {
            GatewayResponse::paused(format!("still working {index}")).into()
        }));
        let task = AgentTask::builder()
            .description("research")
            .role("researcher")
            .budget(Budget::new(2))
            .build();

        let result = manager(gateway.clone())
            .delegate("d1", task, Some(Budget::new(10)), CancellationToken::new())
            .await;

        assert!(result.is_error);
        assert_eq!(result.error_kind, Some(ToolErrorKind::DelegationIncomplete));
        assert_eq!(result.output["status"], "exhausted");
        assert_eq!(result.output["content"], "still working 1");
        assert_eq!(gateway.invocations(), 2);
    }

    #[tokio::test]
    async fn sub_budget_never_exceeds_parent_remainder() {
        let gateway = Arc::new(ScriptedGateway::from_fn(|_, _| GatewayResponse::paused("...").into()));
        let task = AgentTask::builder()
            .description("research")
            .role("researcher")
            .budget(Budget::new(50))
            .build();
        let mut parent = Budget::new(10);
        parent.elapsed_iterations = 7;

        manager(gateway.clone())
            .delegate("d1", task, Some(parent.capped_by(&parent)), CancellationToken::new())
            .await;

        assert_eq!(gateway.invocations(), 3);
    }

    #[tokio::test]
    async fn references_are_inlined_and_unresolved_ones_skipped() {
        let gateway = Arc::new(ScriptedGateway::new([GatewayResponse::final_text("ok")]));
        let resolver = StaticInputResolver::new().with("notes.md", "TypeScript adds types.");
        let manager = DelegationManager::builder()
            .gateway(gateway.clone())
            .resolver(Arc::new(resolver))
            .build();
        let task = AgentTask::builder()
            .description("Write the 'Why TypeScript' section")
            .role("writer")
            .input_refs(vec!["notes.md".to_string(), "missing.md".to_string()])
            .build();

        manager.delegate("d1", task, None, CancellationToken::new()).await;

        let seed = gateway.requests()[0].conversation.turns()[0].text();
        assert_eq!(
            seed,
            "Write the 'Why TypeScript' section\n\nReference materials:\n--- notes.md ---\nTypeScript adds types.\n--- End ---\n\n"
        );
    }

    #[tokio::test]
    async fn file_resolver_rejects_escaping_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "alpha").unwrap();
        let resolver = FileInputResolver::new(dir.path());
        assert_eq!(resolver.resolve("a.md").await.unwrap(), "alpha");
        assert!(resolver.resolve("../etc/passwd").await.is_err());
    }

    #[test]
    fn nested_registry_only_when_allowed() {
        let gateway: Arc<dyn ModelGateway> =
            Arc::new(ScriptedGateway::new(Vec::<GatewayResponse>::new()));
        let flat = DelegationManager::builder().gateway(gateway.clone()).build();
        assert!(!flat.sub_registry().unwrap().contains(DELEGATE_TOOL_NAME));

        let mut config = LoopConfig::default();
        config.delegation.allow_nested = true;
        let nested = DelegationManager::builder()
            .gateway(gateway)
            .config(config)
            .registry(ToolRegistry::new().with_tool(flat.tool()).unwrap())
            .build();
        let registry = nested.sub_registry().unwrap();
        assert_eq!(registry.names(), vec![DELEGATE_TOOL_NAME]);
    }

    #[test]
    fn seed_turn_is_a_user_text_turn() {
        let state = ConversationState::seeded("task");
        assert!(matches!(state.turns()[0].blocks[0], ContentBlock::Text { .. }));
    }
}
