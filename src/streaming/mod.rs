//! Streaming channel: mirror text fragments to a subscriber while the turn
//! accumulates.
//!
//! A turn is committed only once its stream ends with `Done`. If the loop is
//! cancelled first, the stream is dropped (aborting the in-flight call) and
//! nothing accumulated so far reaches the conversation.

use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::ConductorError;
use crate::gateway::{DeltaStream, GatewayDelta, GatewayResponse, Termination};
use crate::types::{ContentBlock, Usage};

/// A text fragment delivered to the subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFragment {
    /// Delegation depth of the loop that produced it.
    pub depth: usize,
    /// Iteration the fragment belongs to (1-based).
    pub iteration: u32,
    /// Position of the fragment within its turn.
    pub index: usize,
    pub text: String,
}

/// Callback receiving fragments in arrival order.
pub type FragmentSink = Arc<dyn Fn(StreamFragment) + Send + Sync>;

/// A sink that forwards into an unbounded channel, exposed as a `Stream`.
pub fn fragment_channel() -> (FragmentSink, UnboundedReceiverStream<StreamFragment>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: FragmentSink = Arc::new(move |fragment| {
        let _ = tx.send(fragment);
    });
    (sink, UnboundedReceiverStream::new(rx))
}

/// Builds one agent turn out of gateway deltas.
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    blocks: Vec<ContentBlock>,
    usage: Usage,
    termination: Option<Termination>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one delta. Consecutive text deltas extend the same text block.
    pub fn push(&mut self, delta: GatewayDelta) -> Result<(), ConductorError> {
        if self.termination.is_some() {
            return Err(ConductorError::gateway_fatal("delta received after Done"));
        }
        match delta {
            GatewayDelta::Text { text } => match self.blocks.last_mut() {
                Some(ContentBlock::Text { text: current }) => current.push_str(&text),
                _ => self.blocks.push(ContentBlock::Text { text }),
            },
            GatewayDelta::ToolCall(call) => self.blocks.push(ContentBlock::ToolCall(call)),
            GatewayDelta::Usage(usage) => self.usage.merge(&usage),
            GatewayDelta::Done { termination } => self.termination = Some(termination),
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.termination.is_some()
    }

    /// The aggregated response; fails if the stream never reported `Done`.
    pub fn finish(self) -> Result<GatewayResponse, ConductorError> {
        let termination = self
            .termination
            .ok_or_else(|| ConductorError::gateway_fatal("stream ended without a termination signal"))?;
        Ok(GatewayResponse {
            blocks: self.blocks,
            termination,
            usage: self.usage,
        })
    }
}

/// Drains gateway streams for one loop, feeding the optional subscriber.
#[derive(Clone, Default)]
pub struct StreamingChannel {
    sink: Option<FragmentSink>,
    depth: usize,
}

impl StreamingChannel {
    pub fn new(sink: Option<FragmentSink>, depth: usize) -> Self {
        Self { sink, depth }
    }

    pub fn has_subscriber(&self) -> bool {
        self.sink.is_some()
    }

    /// Consume `stream` into a response.
    ///
    /// Each text fragment goes to the subscriber exactly once, before it is
    /// folded into the accumulator. Returns `CancelledByCaller` if `cancel`
    /// fires before the stream completes.
    pub async fn consume(
        &self,
        mut stream: DeltaStream,
        iteration: u32,
        cancel: &CancellationToken,
    ) -> Result<GatewayResponse, ConductorError> {
        let mut accumulator = TurnAccumulator::new();
        let mut index = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(iteration, fragments = index, "stream aborted by cancellation");
                    return Err(ConductorError::CancelledByCaller);
                }
                next = stream.next() => next,
            };
            let Some(delta) = next else { break };
            let delta = delta?;
            if let (Some(sink), GatewayDelta::Text { text }) = (&self.sink, &delta) {
                sink(StreamFragment {
                    depth: self.depth,
                    iteration,
                    index,
                    text: text.clone(),
                });
                index += 1;
            }
            accumulator.push(delta)?;
            if accumulator.is_done() {
                break;
            }
        }
        accumulator.finish()
    }
}

impl std::fmt::Debug for StreamingChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingChannel")
            .field("has_subscriber", &self.sink.is_some())
            .field("depth", &self.depth)
            .finish()
    }
}
