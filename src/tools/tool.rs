//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::arguments::ToolArguments;
use super::types::{Sensitivity, ToolParameters};
use crate::agent_loop::events::LoopEventEmitter;
use crate::budget::Budget;
use crate::error::ConductorError;
use crate::types::RiskLevel;

/// Context available during tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolExecutionContext {
    pub run_id: Option<Uuid>,
    pub call_id: String,
    pub tool_name: String,
    /// Delegation depth of the loop that issued the call (0 for the root loop).
    pub depth: usize,
    /// Budget left to the issuing loop when the batch was dispatched.
    pub remaining_budget: Option<Budget>,
    /// Fires when this call, its batch, or the whole loop is cancelled.
    pub cancel: CancellationToken,
    /// Event emitter of the issuing loop.
    pub events: Option<LoopEventEmitter>,
    /// Additional metadata for the tool.
    pub metadata: serde_json::Value,
}

/// A capability the agent can invoke by name.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    /// Approval profile; `Some` marks the tool as sensitive.
    fn sensitivity(&self) -> Option<&Sensitivity> {
        None
    }

    /// Execute the tool with validated arguments.
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value, ConductorError>;
}

/// Type alias for the tool handler function.
type ToolHandler = dyn Fn(
        ToolArguments,
        ToolExecutionContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ConductorError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    sensitivity: Option<Sensitivity>,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ConductorError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            sensitivity: None,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    /// Require approval before this tool runs.
    pub fn sensitive(mut self, risk: RiskLevel, reversible: bool) -> Self {
        self.sensitivity = Some(Sensitivity::new(risk, reversible));
        self
    }

    /// Require approval with a full profile.
    pub fn with_sensitivity(mut self, sensitivity: Sensitivity) -> Self {
        self.sensitivity = Some(sensitivity);
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn sensitivity(&self) -> Option<&Sensitivity> {
        self.sensitivity.as_ref()
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolExecutionContext,
    ) -> Result<serde_json::Value, ConductorError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("sensitivity", &self.sensitivity)
            .finish()
    }
}
