//! Loop event stream types.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{OutcomeStatus, RunId};
use crate::types::{ApprovalDecision, ApprovalRequest, ToolErrorKind};

/// Stream category for events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopEventStream {
    Lifecycle,
    Gateway,
    Tool,
    Approval,
    Delegation,
}

/// Concrete event payloads emitted by the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEventPayload {
    Started,
    Finished {
        status: OutcomeStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    IterationStarted {
        iteration: u32,
    },
    GatewayRetry {
        attempt: u32,
        error: String,
    },
    ToolCallStarted {
        call_id: String,
        tool_name: String,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_kind: Option<ToolErrorKind>,
    },
    ApprovalRequired {
        request: ApprovalRequest,
    },
    ApprovalResolved {
        decision: ApprovalDecision,
    },
    DelegationStarted {
        call_id: String,
        role: String,
        child_depth: usize,
    },
    DelegationFinished {
        call_id: String,
        role: String,
        status: OutcomeStatus,
    },
}

impl LoopEventPayload {
    pub fn stream(&self) -> LoopEventStream {
        match self {
            Self::Started | Self::Finished { .. } | Self::IterationStarted { .. } => {
                LoopEventStream::Lifecycle
            }
            Self::GatewayRetry { .. } => LoopEventStream::Gateway,
            Self::ToolCallStarted { .. } | Self::ToolResult { .. } => LoopEventStream::Tool,
            Self::ApprovalRequired { .. } | Self::ApprovalResolved { .. } => {
                LoopEventStream::Approval
            }
            Self::DelegationStarted { .. } | Self::DelegationFinished { .. } => {
                LoopEventStream::Delegation
            }
        }
    }
}

/// Envelope for loop events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopEvent {
    pub run_id: RunId,
    pub depth: usize,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub stream: LoopEventStream,
    pub payload: LoopEventPayload,
}

/// Callback receiving loop events. Sub-agents share their parent's sink.
pub type LoopEventSink = Arc<dyn Fn(LoopEvent) + Send + Sync>;

/// Stamps payloads with run id, depth and a per-run sequence number.
#[derive(Clone)]
pub struct LoopEventEmitter {
    run_id: RunId,
    depth: usize,
    seq: Arc<AtomicU64>,
    sink: Option<LoopEventSink>,
}

impl LoopEventEmitter {
    pub fn new(run_id: RunId, depth: usize, sink: Option<LoopEventSink>) -> Self {
        Self {
            run_id,
            depth,
            seq: Arc::new(AtomicU64::new(1)),
            sink,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn sink(&self) -> Option<LoopEventSink> {
        self.sink.clone()
    }

    pub fn emit(&self, payload: LoopEventPayload) {
        let Some(sink) = &self.sink else {
            return;
        };
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        (sink)(LoopEvent {
            run_id: self.run_id,
            depth: self.depth,
            seq,
            timestamp: Utc::now(),
            stream: payload.stream(),
            payload,
        });
    }
}

impl std::fmt::Debug for LoopEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopEventEmitter")
            .field("run_id", &self.run_id)
            .field("depth", &self.depth)
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn sequence_numbers_increase_per_emitter() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let sink: LoopEventSink = Arc::new(move |event| sink_seen.lock().unwrap().push(event));
        let emitter = LoopEventEmitter::new(RunId::new_v4(), 0, Some(sink));

        emitter.emit(LoopEventPayload::Started);
        emitter.clone().emit(LoopEventPayload::IterationStarted { iteration: 1 });

        let events = seen.lock().unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(events[1].stream, LoopEventStream::Lifecycle);
    }

    #[test]
    fn emitting_without_a_sink_is_a_no_op() {
        LoopEventEmitter::new(RunId::new_v4(), 1, None).emit(LoopEventPayload::Started);
    }
}
