//! Conversation state: the ordered, append-only turn history of one loop run.

pub mod checkpoint;

pub use checkpoint::{restore, serialize, Checkpoint, CheckpointCodec, JsonCodec};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::ConductorError;
use crate::types::{ContentBlock, Role, Turn};

/// Ordered turn history with call/approval pairing enforced on append.
///
/// Pairing rules:
/// - a `ToolResult` must answer a pending `ToolCall`, exactly once;
/// - an `ApprovalDecision` must answer a pending `ApprovalRequest`, exactly once;
/// - no `ToolResult` may answer a call whose approval is still undecided;
/// - an agent turn cannot be appended while tool calls are unanswered.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Arc<Vec<Turn>>,
    pending: PendingSet,
}

#[derive(Debug, Clone, Default)]
struct PendingSet {
    /// call id -> tool name
    calls: BTreeMap<String, String>,
    /// approval request id -> call id
    approvals: BTreeMap<String, String>,
    seen_call_ids: HashSet<String>,
    seen_request_ids: HashSet<String>,
}

/// An immutable view of the history at one point in time.
///
/// Cheap to clone; later appends to the state do not affect it.
#[derive(Debug, Clone, Default)]
pub struct ConversationSnapshot {
    turns: Arc<Vec<Turn>>,
}

impl ConversationSnapshot {
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a conversation with a single user text turn.
    pub fn seeded(task: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.turns = Arc::new(vec![Turn::user_text(task)]);
        state
    }

    /// Rebuild a conversation from stored turns, re-validating every append.
    pub fn from_turns(turns: Vec<Turn>) -> Result<Self, ConductorError> {
        let mut state = Self::new();
        for turn in turns {
            state.append(turn)?;
        }
        Ok(state)
    }

    /// Append a turn, rejecting it whole if any block breaks pairing.
    pub fn append(&mut self, turn: Turn) -> Result<(), ConductorError> {
        let mut pending = self.pending.clone();
        if turn.role == Role::Agent && !pending.calls.is_empty() {
            return Err(ConductorError::InvalidSequence(format!(
                "agent turn appended while tool calls are unanswered: {}",
                pending.calls.keys().cloned().collect::<Vec<_>>().join(", ")
            )));
        }

        for block in &turn.blocks {
            match block {
                ContentBlock::Text { .. } => {}
                ContentBlock::ToolCall(call) => {
                    if turn.role != Role::Agent {
                        return Err(ConductorError::InvalidSequence(format!(
                            "tool call '{}' must come from an agent turn",
                            call.id
                        )));
                    }
                    if !pending.seen_call_ids.insert(call.id.clone()) {
                        return Err(ConductorError::InvalidSequence(format!(
                            "duplicate tool call id '{}'",
                            call.id
                        )));
                    }
                    pending.calls.insert(call.id.clone(), call.name.clone());
                }
                ContentBlock::ApprovalRequest(request) => {
                    if !pending.calls.contains_key(&request.call_id) {
                        return Err(ConductorError::InvalidSequence(format!(
                            "approval request '{}' references unknown or answered call '{}'",
                            request.id, request.call_id
                        )));
                    }
                    if !pending.seen_request_ids.insert(request.id.clone()) {
                        return Err(ConductorError::InvalidSequence(format!(
                            "duplicate approval request id '{}'",
                            request.id
                        )));
                    }
                    pending
                        .approvals
                        .insert(request.id.clone(), request.call_id.clone());
                }
                ContentBlock::ApprovalDecision(decision) => {
                    if pending.approvals.remove(&decision.request_id).is_none() {
                        return Err(ConductorError::InvalidSequence(format!(
                            "approval decision references no pending request '{}'",
                            decision.request_id
                        )));
                    }
                }
                ContentBlock::ToolResult(result) => {
                    if pending.approvals.values().any(|id| id == &result.call_id) {
                        return Err(ConductorError::InvalidSequence(format!(
                            "tool result for '{}' precedes its approval decision",
                            result.call_id
                        )));
                    }
                    if pending.calls.remove(&result.call_id).is_none() {
                        return Err(ConductorError::InvalidSequence(format!(
                            "tool result references no pending call '{}'",
                            result.call_id
                        )));
                    }
                }
            }
        }

        Arc::make_mut(&mut self.turns).push(turn);
        self.pending = pending;
        Ok(())
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            turns: self.turns.clone(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Whether every call and approval request has been answered.
    pub fn is_settled(&self) -> bool {
        self.pending.calls.is_empty() && self.pending.approvals.is_empty()
    }

    pub fn pending_call_ids(&self) -> Vec<String> {
        self.pending.calls.keys().cloned().collect()
    }

    /// Text of the most recent agent turn that has any.
    pub fn last_agent_text(&self) -> Option<String> {
        self.turns
            .iter()
            .rev()
            .filter(|turn| turn.role == Role::Agent)
            .map(Turn::text)
            .find(|text| !text.is_empty())
    }

    pub fn into_turns(self) -> Vec<Turn> {
        Arc::try_unwrap(self.turns).unwrap_or_else(|shared| (*shared).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ApprovalDecision, ApprovalRequest, RiskLevel, ToolCall, ToolResult};
    use serde_json::json;

    fn call_turn(ids: &[&str]) -> Turn {
        Turn::agent(
            ids.iter()
                .map(|id| ContentBlock::ToolCall(ToolCall::new(*id, "echo", json!({}))))
                .collect(),
        )
    }

    fn result_block(id: &str) -> ContentBlock {
        ContentBlock::ToolResult(ToolResult::success(id, json!("ok")))
    }

    fn approval_request(id: &str, call_id: &str) -> ApprovalRequest {
        ApprovalRequest {
            id: id.to_string(),
            call_id: call_id.to_string(),
            tool_name: "echo".to_string(),
            action: "echo".to_string(),
            risk: RiskLevel::High,
            reversible: false,
            arguments: json!({}),
        }
    }

    #[test]
    fn matched_results_settle_the_conversation() {
        let mut state = ConversationState::seeded("do things");
        state.append(call_turn(&["a", "b"])).unwrap();
        assert!(!state.is_settled());
        state
            .append(Turn::user(vec![result_block("b"), result_block("a")]))
            .unwrap();
        assert!(state.is_settled());
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn rejects_result_without_matching_call() {
        let mut state = ConversationState::seeded("task");
        let err = state
            .append(Turn::user(vec![result_block("ghost")]))
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidSequence(_)));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn rejects_duplicate_result_for_one_call() {
        let mut state = ConversationState::seeded("task");
        state.append(call_turn(&["a"])).unwrap();
        let err = state
            .append(Turn::user(vec![result_block("a"), result_block("a")]))
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidSequence(_)));
        assert_eq!(state.pending_call_ids(), vec!["a".to_string()]);
    }

    #[test]
    fn rejects_agent_turn_while_calls_are_pending() {
        let mut state = ConversationState::seeded("task");
        state.append(call_turn(&["a"])).unwrap();
        let err = state.append(Turn::agent_text("moving on")).unwrap_err();
        assert!(matches!(err, ConductorError::InvalidSequence(_)));
    }

    #[test]
    fn approval_must_be_decided_before_result() {
        let mut state = ConversationState::seeded("task");
        state.append(call_turn(&["a"])).unwrap();
        let err = state
            .append(Turn::user(vec![
                ContentBlock::ApprovalRequest(approval_request("r1", "a")),
                result_block("a"),
            ]))
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidSequence(_)));

        state
            .append(Turn::user(vec![
                ContentBlock::ApprovalRequest(approval_request("r1", "a")),
                ContentBlock::ApprovalDecision(ApprovalDecision::deny("r1", "not today")),
                result_block("a"),
            ]))
            .unwrap();
        assert!(state.is_settled());
    }

    #[test]
    fn decision_without_request_is_rejected() {
        let mut state = ConversationState::seeded("task");
        let err = state
            .append(Turn::user(vec![ContentBlock::ApprovalDecision(
                ApprovalDecision::approve("nope"),
            )]))
            .unwrap_err();
        assert!(matches!(err, ConductorError::InvalidSequence(_)));
    }

    #[test]
    fn snapshots_are_unaffected_by_later_appends() {
        let mut state = ConversationState::seeded("task");
        let before = state.snapshot();
        state.append(Turn::agent_text("done")).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(state.snapshot().len(), 2);
    }

    #[test]
    fn last_agent_text_skips_tool_only_turns() {
        let mut state = ConversationState::seeded("task");
        state.append(Turn::agent_text("thinking")).unwrap();
        state.append(call_turn(&["a"])).unwrap();
        assert_eq!(state.last_agent_text().as_deref(), Some("thinking"));
    }
}
