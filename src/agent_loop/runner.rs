//! Loop driver: invoke the gateway, dispatch tool calls, fold results back,
//! repeat until a terminal state.

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::events::{LoopEventEmitter, LoopEventPayload, LoopEventSink};
use super::types::{Outcome, OutcomeStatus, RunId};
use crate::approval::{ApprovalGate, DecisionProvider};
use crate::budget::{Budget, BudgetController, ExhaustionReason, LoopState};
use crate::config::{LoopConfig, TimeoutPolicy};
use crate::conversation::{Checkpoint, ConversationState};
use crate::dispatch::{DispatchContext, DispatchRecord, Dispatcher};
use crate::error::ConductorError;
use crate::gateway::{GatewayRequest, GatewayResponse, ModelGateway, Termination};
use crate::streaming::{FragmentSink, StreamingChannel};
use crate::tools::ToolRegistry;
use crate::types::{ContentBlock, ToolCall, ToolErrorKind, ToolResult, Turn, Usage};

/// What a run starts from.
#[derive(Debug, Clone)]
pub enum RunInput {
    /// A fresh conversation seeded with this task.
    Task(String),
    /// A restored conversation with its restored budget.
    Resume(Checkpoint),
}

/// Handle for an in-flight run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    cancel: CancellationToken,
    result_rx: oneshot::Receiver<Outcome>,
}

impl RunHandle {
    /// Create a handle and the sender a runner reports the outcome through.
    pub fn new(run_id: RunId, cancel: CancellationToken) -> (Self, oneshot::Sender<Outcome>) {
        let (result_tx, result_rx) = oneshot::channel();
        (
            Self {
                run_id,
                cancel,
                result_rx,
            },
            result_tx,
        )
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Request cancellation. The run still ends with an `Outcome`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<Outcome, ConductorError> {
        self.result_rx.await.map_err(|_| {
            ConductorError::InvalidState(format!("run {} ended without an outcome", self.run_id))
        })
    }
}

/// Runner trait for starting loop runs in the background.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn start(&self, input: RunInput) -> Result<RunHandle, ConductorError>;
}

/// One agent loop: a gateway, the tools it may call and the rules it runs by.
///
/// Sub-agents are `AgentLoop`s too, built by the
/// [`DelegationManager`](crate::delegation::DelegationManager) with a larger
/// `depth` and a narrower registry.
#[derive(Clone, Builder)]
pub struct AgentLoop {
    gateway: Arc<dyn ModelGateway>,
    #[builder(default)]
    registry: ToolRegistry,
    #[builder(default)]
    config: LoopConfig,
    decision_provider: Option<Arc<dyn DecisionProvider>>,
    #[builder(default)]
    depth: usize,
    event_sink: Option<LoopEventSink>,
    fragment_sink: Option<FragmentSink>,
}

impl AgentLoop {
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Run `task` to a terminal outcome under the configured budget.
    pub async fn run(&self, task: impl Into<String>) -> Outcome {
        self.run_with_cancel(task, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(&self, task: impl Into<String>, cancel: CancellationToken) -> Outcome {
        let budget = self.config.budget.to_budget();
        self.run_conversation(ConversationState::seeded(task), budget, cancel)
            .await
    }

    /// Continue a checkpointed run with its restored budget.
    pub async fn resume(&self, checkpoint: Checkpoint) -> Result<Outcome, ConductorError> {
        self.resume_with_cancel(checkpoint, CancellationToken::new())
            .await
    }

    pub async fn resume_with_cancel(
        &self,
        checkpoint: Checkpoint,
        cancel: CancellationToken,
    ) -> Result<Outcome, ConductorError> {
        let (state, budget) = restore_settled(checkpoint)?;
        Ok(self.run_conversation(state, budget, cancel).await)
    }

    /// Drive `state` until completion, exhaustion, failure or cancellation.
    pub async fn run_conversation(
        &self,
        state: ConversationState,
        budget: Budget,
        cancel: CancellationToken,
    ) -> Outcome {
        self.execute(Uuid::new_v4(), state, budget, cancel).await
    }

    async fn execute(
        &self,
        run_id: RunId,
        state: ConversationState,
        budget: Budget,
        cancel: CancellationToken,
    ) -> Outcome {
        let span = tracing::info_span!("agent_loop", %run_id, depth = self.depth);
        LoopRun::new(self, run_id, state, budget, cancel)
            .drive()
            .instrument(span)
            .await
    }

    fn dispatcher(&self) -> Dispatcher {
        let gate = ApprovalGate::new(self.config.approval_policy, self.decision_provider.clone());
        Dispatcher::new(self.registry.clone(), gate)
            .with_max_concurrent_calls(self.config.max_concurrent_calls)
    }
}

#[async_trait]
impl Runner for AgentLoop {
    async fn start(&self, input: RunInput) -> Result<RunHandle, ConductorError> {
        let (state, budget) = match input {
            RunInput::Task(task) => (ConversationState::seeded(task), self.config.budget.to_budget()),
            RunInput::Resume(checkpoint) => restore_settled(checkpoint)?,
        };
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (handle, result_tx) = RunHandle::new(run_id, cancel.clone());
        let this = self.clone();

        tokio::spawn(async move {
            let outcome = this.execute(run_id, state, budget, cancel).await;
            if result_tx.send(outcome).is_err() {
                tracing::debug!(%run_id, "run handle dropped before the outcome was read");
            }
        });
        Ok(handle)
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("depth", &self.depth)
            .field("has_decision_provider", &self.decision_provider.is_some())
            .field("has_event_sink", &self.event_sink.is_some())
            .field("has_fragment_sink", &self.fragment_sink.is_some())
            .finish()
    }
}

fn restore_settled(checkpoint: Checkpoint) -> Result<(ConversationState, Budget), ConductorError> {
    let (state, budget) = checkpoint.into_parts()?;
    if !state.is_settled() {
        return Err(ConductorError::InvalidState(format!(
            "checkpoint has unanswered tool calls: {}",
            state.pending_call_ids().join(", ")
        )));
    }
    Ok((state, budget))
}

/// How one gateway round ended when it produced no response.
enum Interrupted {
    Cancelled,
    WallClock,
    Failed(String),
}

/// Mutable state of a single run.
struct LoopRun<'a> {
    agent: &'a AgentLoop,
    state: ConversationState,
    controller: BudgetController,
    cancel: CancellationToken,
    events: LoopEventEmitter,
    dispatcher: Dispatcher,
    streaming: StreamingChannel,
    usage: Usage,
    run_id: RunId,
}

impl<'a> LoopRun<'a> {
    fn new(
        agent: &'a AgentLoop,
        run_id: RunId,
        state: ConversationState,
        budget: Budget,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            agent,
            state,
            controller: BudgetController::new(budget),
            cancel,
            events: LoopEventEmitter::new(run_id, agent.depth, agent.event_sink.clone()),
            dispatcher: agent.dispatcher(),
            streaming: StreamingChannel::new(agent.fragment_sink.clone(), agent.depth),
            usage: Usage::default(),
            run_id,
        }
    }

    async fn drive(mut self) -> Outcome {
        tracing::info!(
            max_iterations = self.controller.budget().max_iterations,
            elapsed_iterations = self.controller.budget().elapsed_iterations,
            tools = self.agent.registry.len(),
            "agent loop started"
        );
        self.events.emit(LoopEventPayload::Started);

        while self.controller.state() == LoopState::Running {
            if self.cancel.is_cancelled() {
                self.controller.cancel();
                break;
            }
            if !self.controller.can_invoke() {
                break;
            }
            self.iterate().await;
        }

        self.finish()
    }

    /// One gateway invocation and, if requested, one dispatched batch.
    async fn iterate(&mut self) {
        let iteration = match self.controller.record_iteration() {
            Ok(iteration) => iteration,
            Err(err) => {
                self.controller.fail(err.to_string());
                return;
            }
        };
        tracing::debug!(iteration, turns = self.state.len(), "invoking gateway");
        self.events
            .emit(LoopEventPayload::IterationStarted { iteration });

        let response = match self.invoke_gateway(iteration).await {
            Ok(response) => response,
            Err(Interrupted::Cancelled) => {
                self.controller.cancel();
                return;
            }
            Err(Interrupted::WallClock) => {
                self.controller.exhaust(ExhaustionReason::WallClock);
                return;
            }
            Err(Interrupted::Failed(reason)) => {
                tracing::warn!(iteration, error = %reason, "gateway failed");
                self.controller.fail(reason);
                return;
            }
        };

        if let Some(block) = response.blocks.iter().find(|block| {
            !matches!(block, ContentBlock::Text { .. } | ContentBlock::ToolCall(_))
        }) {
            let reason = ConductorError::gateway_fatal(format!(
                "response carries a block the gateway may not produce: {}",
                block_kind(block)
            ));
            self.controller.fail(reason.to_string());
            return;
        }

        self.usage.merge(&response.usage);
        let calls: Vec<ToolCall> = response.calls().into_iter().cloned().collect();
        let termination = response.termination;
        if let Err(err) = self.state.append(Turn::agent(response.blocks)) {
            tracing::warn!(iteration, error = %err, "agent turn rejected");
            self.controller.fail(err.to_string());
            return;
        }

        match termination {
            Termination::Final if calls.is_empty() => {
                tracing::debug!(iteration, "final response");
                self.controller.complete();
                return;
            }
            Termination::Final => {
                tracing::warn!(
                    iteration,
                    calls = calls.len(),
                    "final response carries tool calls; dispatching them"
                );
            }
            Termination::ToolRequested | Termination::Paused => {}
        }
        if calls.is_empty() {
            return;
        }

        if self.controller.budget().is_exhausted() {
            self.settle_unbudgeted(&calls);
            return;
        }
        self.dispatch(iteration, &calls).await;
    }

    async fn invoke_gateway(&self, iteration: u32) -> Result<GatewayResponse, Interrupted> {
        let config = &self.agent.config;
        let request = GatewayRequest {
            model: config.model.clone(),
            conversation: self.state.snapshot(),
            tools: self.agent.registry.descriptors(),
            streaming: config.streaming,
            depth: self.agent.depth,
        };

        let round = async {
            if config.streaming {
                let stream = self
                    .with_retry(|| self.agent.gateway.stream(&request))
                    .await?;
                self.streaming.consume(stream, iteration, &self.cancel).await
            } else {
                self.with_retry(|| self.agent.gateway.invoke(&request))
                    .await
                    .map(GatewayResponse::merge_adjacent_text)
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Interrupted::Cancelled),
            _ = wall_clock(self.controller.deadline()) => return Err(Interrupted::WallClock),
            outcome = round => outcome,
        };
        outcome.map_err(|err| match err {
            ConductorError::CancelledByCaller => Interrupted::Cancelled,
            err => Interrupted::Failed(err.to_string()),
        })
    }

    /// Gateway call under the configured retry policy, reporting each retry.
    async fn with_retry<F, Fut, T>(&self, mut operation: F) -> Result<T, ConductorError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, ConductorError>>,
    {
        let retry = &self.agent.config.retry;
        let events = &self.events;
        let mut attempt = 0u32;
        retry
            .execute_cancellable(&self.cancel, || {
                attempt += 1;
                let attempt = attempt;
                let pending = operation();
                async move {
                    let result = pending.await;
                    if let Err(err) = &result {
                        if err.is_retryable() && attempt < retry.max_attempts {
                            events.emit(LoopEventPayload::GatewayRetry {
                                attempt,
                                error: err.to_string(),
                            });
                        }
                    }
                    result
                }
            })
            .await
    }

    async fn dispatch(&mut self, iteration: u32, calls: &[ToolCall]) {
        let ctx = DispatchContext {
            run_id: Some(self.run_id),
            depth: self.agent.depth,
            remaining_budget: Some(self.controller.remaining()),
            per_call_timeout: self.controller.budget().per_call_timeout,
            cancel: self.cancel.child_token(),
            events: Some(self.events.clone()),
        };
        tracing::debug!(iteration, calls = calls.len(), "dispatching tool calls");

        let mut batch = std::pin::pin!(self.dispatcher.dispatch_batch(calls, &ctx));
        let records = tokio::select! {
            records = &mut batch => records,
            _ = wall_clock(self.controller.deadline()) => {
                tracing::warn!(iteration, "wall clock ran out mid-batch; cancelling calls");
                ctx.cancel.cancel();
                batch.await
            }
        };

        if let Err(err) = self.state.append(result_turn(&records)) {
            self.controller.fail(err.to_string());
            return;
        }

        if self.cancel.is_cancelled() {
            self.controller.cancel();
            return;
        }
        if let Some(reason) = self.escalation(&records) {
            tracing::warn!(iteration, reason = %reason, "tool failure escalated");
            self.controller.fail(reason);
        }
    }

    /// Tool failures that end the loop instead of going back to the model.
    fn escalation(&self, records: &[DispatchRecord]) -> Option<String> {
        let config = &self.agent.config;
        records.iter().find_map(|record| {
            let result = &record.result;
            let message = || result.error_message().unwrap_or_default().to_string();
            match result.error_kind {
                Some(ToolErrorKind::DelegationDepthExceeded)
                    if config.delegation.escalate_depth_exceeded =>
                {
                    Some(message())
                }
                Some(ToolErrorKind::Timeout) if config.timeout_policy == TimeoutPolicy::FailLoop => {
                    Some(message())
                }
                _ => None,
            }
        })
    }

    /// Answer calls requested on the last permitted iteration without running them.
    fn settle_unbudgeted(&mut self, calls: &[ToolCall]) {
        tracing::debug!(calls = calls.len(), "budget spent; tool calls left unexecuted");
        let blocks = calls
            .iter()
            .map(|call| {
                ContentBlock::ToolResult(ToolResult::error(
                    &call.id,
                    ToolErrorKind::BudgetExhausted,
                    "iteration budget exhausted before this call could run",
                ))
            })
            .collect();
        if let Err(err) = self.state.append(Turn::user(blocks)) {
            self.controller.fail(err.to_string());
            return;
        }
        self.controller.exhaust(ExhaustionReason::Iterations);
    }

    fn finish(mut self) -> Outcome {
        self.controller.check();
        let state = self.controller.state();
        let status = OutcomeStatus::from_state(state).unwrap_or(OutcomeStatus::Failed);
        let error = match status {
            OutcomeStatus::Failed => Some(
                self.controller
                    .failure()
                    .unwrap_or("loop stopped without a terminal state")
                    .to_string(),
            ),
            OutcomeStatus::Cancelled => Some(ConductorError::CancelledByCaller.to_string()),
            OutcomeStatus::Completed | OutcomeStatus::Exhausted => None,
        };
        let budget = *self.controller.budget();

        tracing::info!(
            status = %status,
            iterations = budget.elapsed_iterations,
            exhaustion = ?self.controller.exhaustion(),
            error = error.as_deref().unwrap_or_default(),
            "agent loop finished"
        );
        self.events.emit(LoopEventPayload::Finished {
            status,
            error: error.clone(),
        });

        Outcome {
            run_id: self.run_id,
            status,
            content: self.state.last_agent_text(),
            error,
            exhaustion: self.controller.exhaustion(),
            usage: self.usage,
            conversation: self.state.into_turns(),
            budget,
            finished_at: chrono::Utc::now(),
        }
    }
}

/// User turn answering a dispatched batch: approval requests, then their
/// decisions, then one result per call, each group in call order.
fn result_turn(records: &[DispatchRecord]) -> Turn {
    let approvals = records.iter().filter_map(|record| record.approval.as_ref());
    let mut blocks: Vec<ContentBlock> = approvals
        .clone()
        .map(|(request, _)| ContentBlock::ApprovalRequest(request.clone()))
        .collect();
    blocks.extend(approvals.map(|(_, decision)| ContentBlock::ApprovalDecision(decision.clone())));
    blocks.extend(
        records
            .iter()
            .map(|record| ContentBlock::ToolResult(record.result.clone())),
    );
    Turn::user(blocks)
}

fn block_kind(block: &ContentBlock) -> &'static str {
    match block {
        ContentBlock::Text { .. } => "text",
        ContentBlock::ToolCall(_) => "tool_call",
        ContentBlock::ToolResult(_) => "tool_result",
        ContentBlock::ApprovalRequest(_) => "approval_request",
        ContentBlock::ApprovalDecision(_) => "approval_decision",
    }
}

async fn wall_clock(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
