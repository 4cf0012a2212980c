//! Error types for conductor.

use thiserror::Error;

/// Primary error type for all conductor operations.
///
/// Tool-level failures (unknown tool, schema mismatch, handler errors, denied
/// approvals) are normally folded into error-flagged `ToolResult`s by the
/// dispatcher and never reach the caller as this type. The variants exist so
/// handlers, gateways and decision providers share one vocabulary.
#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Schema validation failed for {tool_name}: {message}")]
    SchemaValidation { tool_name: String, message: String },

    #[error("Tool handler error in {tool_name}: {message}")]
    Handler { tool_name: String, message: String },

    #[error("Approval denied for {tool_name}: {reason}")]
    ApprovalDenied { tool_name: String, reason: String },

    #[error("Budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("Gateway error: {message}")]
    Gateway { message: String, retryable: bool },

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Cancelled by caller")]
    CancelledByCaller,

    #[error("Delegation depth exceeded (depth {depth}, max {max_depth})")]
    DelegationDepthExceeded { depth: usize, max_depth: usize },

    #[error("Delegated task ended {status}")]
    DelegationIncomplete {
        status: String,
        output: serde_json::Value,
    },

    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Recovered locally into an error `ToolResult`.
    Tool,
    Approval,
    Budget,
    Gateway,
    RateLimit,
    Timeout,
    Cancellation,
    Delegation,
    Protocol,
    Configuration,
    Serialization,
    Unknown,
}

impl ConductorError {
    /// Create a fatal (non-retryable) gateway error.
    pub fn gateway_fatal(message: impl Into<String>) -> Self {
        Self::Gateway {
            message: message.into(),
            retryable: false,
        }
    }

    /// Create a transient gateway error that the retry policy may retry.
    pub fn gateway_transient(message: impl Into<String>) -> Self {
        Self::Gateway {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a handler error for the named tool.
    pub fn handler(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownTool(_) | Self::SchemaValidation { .. } | Self::Handler { .. } => {
                ErrorCategory::Tool
            }
            Self::ApprovalDenied { .. } => ErrorCategory::Approval,
            Self::BudgetExhausted(_) => ErrorCategory::Budget,
            Self::Gateway { .. } => ErrorCategory::Gateway,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::CancelledByCaller => ErrorCategory::Cancellation,
            Self::DelegationDepthExceeded { .. } | Self::DelegationIncomplete { .. } => {
                ErrorCategory::Delegation
            }
            Self::InvalidSequence(_) | Self::InvalidState(_) => ErrorCategory::Protocol,
            Self::Configuration(_) | Self::InvalidArgument(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable against the gateway.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Gateway { retryable, .. } => *retryable,
            Self::RateLimited { .. } | Self::Timeout(_) => true,
            _ => false,
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, ConductorError>;
