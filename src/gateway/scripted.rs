//! Deterministic gateway that replays scripted replies.
//!
//! Useful for tests and demos: it counts invocations, records every request,
//! and can stream text in fixed-size fragments with a delay between them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::{response_into_deltas, DeltaStream, GatewayRequest, GatewayResponse, ModelGateway};
use crate::error::ConductorError;

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Respond(GatewayResponse),
    /// Fail with a gateway error.
    Fail { message: String, retryable: bool },
}

impl From<GatewayResponse> for ScriptedReply {
    fn from(response: GatewayResponse) -> Self {
        Self::Respond(response)
    }
}

type ReplyFn = dyn Fn(usize, &GatewayRequest) -> ScriptedReply + Send + Sync;

enum Script {
    Queue(Mutex<VecDeque<ScriptedReply>>),
    Generated(Box<ReplyFn>),
}

/// A [`ModelGateway`] driven by a script instead of a model.
pub struct ScriptedGateway {
    script: Script,
    invocations: AtomicUsize,
    requests: Mutex<Vec<GatewayRequest>>,
    fragment_chars: Option<usize>,
    fragment_delay: Option<Duration>,
}

impl ScriptedGateway {
    /// Replay `replies` in order; once they run out every call fails fatally.
    pub fn new(replies: impl IntoIterator<Item = impl Into<ScriptedReply>>) -> Self {
        Self::with_script(Script::Queue(Mutex::new(
            replies.into_iter().map(Into::into).collect(),
        )))
    }

    /// Compute each reply from the zero-based invocation index and the request.
    pub fn from_fn<F>(reply: F) -> Self
    where
        F: Fn(usize, &GatewayRequest) -> ScriptedReply + Send + Sync + 'static,
    {
        Self::with_script(Script::Generated(Box::new(reply)))
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            invocations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            fragment_chars: None,
            fragment_delay: None,
        }
    }

    /// Stream text in fragments of at most `chars` characters.
    pub fn with_fragment_chars(mut self, chars: usize) -> Self {
        self.fragment_chars = Some(chars);
        self
    }

    /// Sleep before each streamed delta.
    pub fn with_fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    /// Number of `invoke`/`stream` calls so far.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Copies of every request received, in order.
    pub fn requests(&self) -> Vec<GatewayRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn next_reply(&self, request: &GatewayRequest) -> Result<GatewayResponse, ConductorError> {
        let index = self.invocations.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let reply = match &self.script {
            Script::Queue(queue) => queue
                .lock()
                .map_err(|_| ConductorError::InvalidState("script lock poisoned".into()))?
                .pop_front()
                .ok_or_else(|| {
                    ConductorError::gateway_fatal(format!("script exhausted at invocation {index}"))
                })?,
            Script::Generated(reply) => reply(index, request),
        };
        match reply {
            ScriptedReply::Respond(response) => Ok(response),
            ScriptedReply::Fail { message, retryable } => {
                Err(ConductorError::Gateway { message, retryable })
            }
        }
    }
}

#[async_trait]
impl ModelGateway for ScriptedGateway {
    async fn invoke(&self, request: &GatewayRequest) -> Result<GatewayResponse, ConductorError> {
        self.next_reply(request)
    }

    async fn stream(&self, request: &GatewayRequest) -> Result<DeltaStream, ConductorError> {
        let response = self.next_reply(request)?;
        let deltas = response_into_deltas(response, self.fragment_chars);
        Ok(match self.fragment_delay {
            Some(delay) => deltas
                .then(move |delta| async move {
                    tokio::time::sleep(delay).await;
                    delta
                })
                .boxed(),
            None => deltas,
        })
    }
}

impl std::fmt::Debug for ScriptedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedGateway")
            .field("invocations", &self.invocations())
            .finish()
    }
}
