//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    AgentLoop, LoopEvent, LoopEventPayload, LoopEventSink, Outcome, OutcomeStatus, RunHandle,
    RunInput, Runner,
};
pub use crate::approval::{ApprovalPolicy, DecisionProvider, RuleBasedProvider, StaticDecision};
pub use crate::budget::Budget;
pub use crate::config::LoopConfig;
pub use crate::conversation::{Checkpoint, ConversationState};
pub use crate::delegation::{AgentTask, DelegationManager, InputResolver};
pub use crate::error::{ConductorError, Result};
pub use crate::gateway::{GatewayRequest, GatewayResponse, ModelGateway, Termination};
pub use crate::streaming::{fragment_channel, StreamFragment};
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolParameters, ToolRegistry};
pub use crate::types::{
    ContentBlock, RiskLevel, Role, ToolCall, ToolErrorKind, ToolResult, Turn, Usage,
};
