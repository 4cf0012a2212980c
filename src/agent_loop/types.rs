//! Core run types for the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::budget::{Budget, ExhaustionReason, LoopState};
use crate::conversation::Checkpoint;
use crate::types::{Turn, Usage};

/// Unique run identifier.
pub type RunId = Uuid;

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutcomeStatus {
    Completed,
    Exhausted,
    Failed,
    Cancelled,
}

impl OutcomeStatus {
    /// The status for a terminal loop state; `None` while still running.
    pub fn from_state(state: LoopState) -> Option<Self> {
        match state {
            LoopState::Running => None,
            LoopState::Completed => Some(Self::Completed),
            LoopState::Exhausted => Some(Self::Exhausted),
            LoopState::Failed => Some(Self::Failed),
            LoopState::Cancelled => Some(Self::Cancelled),
        }
    }
}

/// Terminal result of a run. Always returned, whatever the status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub run_id: RunId,
    pub status: OutcomeStatus,
    /// Last agent text available when the run ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exhaustion: Option<ExhaustionReason>,
    #[serde(default)]
    pub usage: Usage,
    /// Full history at termination.
    #[serde(default)]
    pub conversation: Vec<Turn>,
    /// Budget state at termination.
    pub budget: Budget,
    pub finished_at: DateTime<Utc>,
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    /// Gateway invocations this run performed.
    pub fn iterations(&self) -> u32 {
        self.budget.elapsed_iterations
    }

    /// Capture the terminal state for a later [`AgentLoop::resume`](super::AgentLoop::resume).
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            version: Checkpoint::CURRENT_VERSION,
            turns: self.conversation.clone(),
            budget: self.budget,
        }
    }
}
