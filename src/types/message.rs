//! Conversation turns and their content blocks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One exchange unit in a conversation.
///
/// Turns are immutable once appended to a
/// [`ConversationState`](crate::conversation::ConversationState).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub blocks: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Turn {
    /// Create a user turn with arbitrary blocks.
    pub fn user(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            blocks,
            timestamp: Some(Utc::now()),
        }
    }

    /// Create a user turn holding a single text block.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![ContentBlock::text(text)])
    }

    /// Create an agent turn.
    pub fn agent(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Agent,
            blocks,
            timestamp: Some(Utc::now()),
        }
    }

    /// Create an agent turn holding a single text block.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::agent(vec![ContentBlock::text(text)])
    }

    /// Concatenate all text blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Tool calls requested in this turn.
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    /// Tool results carried by this turn.
    pub fn tool_results(&self) -> Vec<&ToolResult> {
        self.blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult(result) => Some(result),
                _ => None,
            })
            .collect()
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// A single block of turn content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    ApprovalRequest(ApprovalRequest),
    ApprovalDecision(ApprovalDecision),
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// Outcome of a single tool call, matched to it by `call_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub call_id: String,
    pub output: serde_json::Value,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    /// A successful result.
    pub fn success(call_id: impl Into<String>, output: serde_json::Value) -> Self {
        Self {
            call_id: call_id.into(),
            output,
            is_error: false,
            error_kind: None,
        }
    }

    /// An error-flagged result with a plain message.
    pub fn error(call_id: impl Into<String>, kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: serde_json::json!({
                "error": message.into(),
                "kind": kind,
            }),
            is_error: true,
            error_kind: Some(kind),
        }
    }

    /// An error-flagged result with a structured payload.
    pub fn error_with_output(
        call_id: impl Into<String>,
        kind: ToolErrorKind,
        output: serde_json::Value,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            output,
            is_error: true,
            error_kind: Some(kind),
        }
    }

    /// Error message, if this result carries one.
    pub fn error_message(&self) -> Option<&str> {
        if !self.is_error {
            return None;
        }
        self.output.get("error").and_then(|v| v.as_str())
    }
}

/// Why a tool result is error-flagged.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    SchemaValidation,
    Handler,
    ApprovalDenied,
    Timeout,
    Cancelled,
    BudgetExhausted,
    DelegationDepthExceeded,
    DelegationIncomplete,
}

/// Risk classification shown to whoever decides an approval.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// A request for a decision before a sensitive tool call may run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub call_id: String,
    pub tool_name: String,
    pub action: String,
    pub risk: RiskLevel,
    pub reversible: bool,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// The resolution of an [`ApprovalRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalDecision {
    pub request_id: String,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    pub decided_at: DateTime<Utc>,
}

impl ApprovalDecision {
    pub fn approve(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: true,
            reason: None,
            decided_by: None,
            decided_at: Utc::now(),
        }
    }

    pub fn deny(request_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            approved: false,
            reason: Some(reason.into()),
            decided_by: None,
            decided_at: Utc::now(),
        }
    }

    pub fn decided_by(mut self, who: impl Into<String>) -> Self {
        self.decided_by = Some(who.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_blocks_serialize_with_type_tag() {
        let block = ContentBlock::ToolCall(ToolCall::new("c1", "read_file", json!({"path": "a"})));
        let value = serde_json::to_value(&block).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["name"], "read_file");
    }

    #[test]
    fn error_result_carries_kind_and_message() {
        let result = ToolResult::error("c1", ToolErrorKind::UnknownTool, "Tool 'nope' not found");
        assert!(result.is_error);
        assert_eq!(result.error_kind, Some(ToolErrorKind::UnknownTool));
        assert_eq!(result.error_message(), Some("Tool 'nope' not found"));
        assert_eq!(result.output["kind"], "unknown_tool");
    }

    #[test]
    fn turn_text_joins_text_blocks_only() {
        let turn = Turn::agent(vec![
            ContentBlock::text("Hello, "),
            ContentBlock::ToolCall(ToolCall::new("c1", "x", json!({}))),
            ContentBlock::text("world"),
        ]);
        assert_eq!(turn.text(), "Hello, world");
        assert_eq!(turn.tool_calls().len(), 1);
    }

    #[test]
    fn risk_levels_are_ordered_and_parse() {
        assert!(RiskLevel::Low < RiskLevel::High);
        assert_eq!("medium".parse::<RiskLevel>().unwrap(), RiskLevel::Medium);
    }
}
