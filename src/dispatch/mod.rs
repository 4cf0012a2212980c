//! Tool dispatcher: executes one turn's tool calls and returns id-matched results.
//!
//! Every call in a batch ends with exactly one [`ToolResult`]. Unknown tools,
//! schema violations, handler errors and panics, denials, timeouts and
//! cancellation all become error-flagged results rather than errors.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::agent_loop::events::{LoopEventEmitter, LoopEventPayload};
use crate::agent_loop::types::RunId;
use crate::approval::ApprovalGate;
use crate::budget::Budget;
use crate::error::ConductorError;
use crate::tools::{validate_arguments, Tool, ToolArguments, ToolExecutionContext, ToolRegistry};
use crate::types::{ApprovalDecision, ApprovalRequest, ToolCall, ToolErrorKind, ToolResult};
use crate::util::with_optional_timeout;

/// Per-batch settings handed down by the loop.
#[derive(Debug, Clone, Default)]
pub struct DispatchContext {
    pub run_id: Option<RunId>,
    pub depth: usize,
    pub remaining_budget: Option<Budget>,
    pub per_call_timeout: Option<Duration>,
    /// Cancels every call in the batch.
    pub cancel: CancellationToken,
    pub events: Option<LoopEventEmitter>,
}

impl DispatchContext {
    fn emit(&self, payload: LoopEventPayload) {
        if let Some(events) = &self.events {
            events.emit(payload);
        }
    }
}

/// What happened to one call: its approval exchange, if gated, and its result.
#[derive(Debug, Clone)]
pub struct DispatchRecord {
    pub call: ToolCall,
    pub approval: Option<(ApprovalRequest, ApprovalDecision)>,
    pub result: ToolResult,
}

/// Executes tool calls against a registry, behind an approval gate.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: ToolRegistry,
    gate: ApprovalGate,
    max_concurrent_calls: usize,
}

impl Dispatcher {
    pub fn new(registry: ToolRegistry, gate: ApprovalGate) -> Self {
        Self {
            registry,
            gate,
            max_concurrent_calls: 8,
        }
    }

    pub fn with_max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit.max(1);
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Dispatch a batch and return one result per call, in call order.
    pub async fn dispatch(&self, calls: &[ToolCall], ctx: &DispatchContext) -> Vec<ToolResult> {
        self.dispatch_batch(calls, ctx)
            .await
            .into_iter()
            .map(|record| record.result)
            .collect()
    }

    /// Dispatch a batch, keeping each call's approval exchange.
    ///
    /// Calls run concurrently (bounded by `max_concurrent_calls`) and finish
    /// in any order; records are matched back by call id and returned in call
    /// order once the whole batch is done.
    pub async fn dispatch_batch(
        &self,
        calls: &[ToolCall],
        ctx: &DispatchContext,
    ) -> Vec<DispatchRecord> {
        // Futures are built up front so the stream holds no borrowing closure;
        // a closure over `&ToolCall` makes the batch future fail `Send`.
        let pending: Vec<_> = calls.iter().map(|call| self.run_call(call, ctx)).collect();
        let mut finished: HashMap<String, DispatchRecord> = futures::stream::iter(pending)
            .buffer_unordered(self.max_concurrent_calls)
            .map(|record| (record.call.id.clone(), record))
            .collect()
            .await;

        calls
            .iter()
            .map(|call| {
                finished.remove(&call.id).unwrap_or_else(|| DispatchRecord {
                    call: call.clone(),
                    approval: None,
                    result: ToolResult::error(
                        &call.id,
                        ToolErrorKind::Handler,
                        "duplicate call id in batch",
                    ),
                })
            })
            .collect()
    }

    async fn run_call(&self, call: &ToolCall, ctx: &DispatchContext) -> DispatchRecord {
        ctx.emit(LoopEventPayload::ToolCallStarted {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
        });
        let (approval, result) = self.gated_result(call, ctx).await;
        if result.is_error {
            tracing::warn!(
                call_id = %call.id,
                tool = %call.name,
                kind = ?result.error_kind,
                error = result.error_message().unwrap_or_default(),
                "tool call failed"
            );
        } else {
            tracing::debug!(call_id = %call.id, tool = %call.name, "tool call succeeded");
        }
        ctx.emit(LoopEventPayload::ToolResult {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            is_error: result.is_error,
            error_kind: result.error_kind,
        });
        DispatchRecord {
            call: call.clone(),
            approval,
            result,
        }
    }

    async fn gated_result(
        &self,
        call: &ToolCall,
        ctx: &DispatchContext,
    ) -> (Option<(ApprovalRequest, ApprovalDecision)>, ToolResult) {
        let Some(tool) = self.registry.get(&call.name) else {
            let result = ToolResult::error(
                &call.id,
                ToolErrorKind::UnknownTool,
                format!("Tool '{}' not found", call.name),
            );
            return (None, result);
        };

        if let Err(message) = validate_arguments(&call.input, &tool.parameters().schema) {
            let result = ToolResult::error(
                &call.id,
                ToolErrorKind::SchemaValidation,
                format!("Argument validation failed: {message}"),
            );
            return (None, result);
        }

        let mut approval = None;
        if let Some(sensitivity) = self.gate.requires_gating(&self.registry, call) {
            let request = self.gate.request_for(call, sensitivity);
            ctx.emit(LoopEventPayload::ApprovalRequired {
                request: request.clone(),
            });
            let decision = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    ApprovalDecision::deny(&request.id, "cancelled before a decision was made")
                        .decided_by("conductor")
                }
                decision = self.gate.request_decision(&request) => decision,
            };
            ctx.emit(LoopEventPayload::ApprovalResolved {
                decision: decision.clone(),
            });
            let denied = (!decision.approved).then(|| {
                decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "approval denied".to_string())
            });
            approval = Some((request, decision));

            if let Some(reason) = denied {
                let kind = if ctx.cancel.is_cancelled() {
                    ToolErrorKind::Cancelled
                } else {
                    ToolErrorKind::ApprovalDenied
                };
                return (approval, ToolResult::error(&call.id, kind, reason));
            }
        }

        let result = execute(tool.as_ref(), call, ctx).await;
        (approval, result)
    }
}

async fn execute(tool: &dyn Tool, call: &ToolCall, ctx: &DispatchContext) -> ToolResult {
    let call_cancel = ctx.cancel.child_token();
    let exec_ctx = ToolExecutionContext {
        run_id: ctx.run_id,
        call_id: call.id.clone(),
        tool_name: call.name.clone(),
        depth: ctx.depth,
        remaining_budget: ctx.remaining_budget,
        cancel: call_cancel.clone(),
        events: ctx.events.clone(),
        metadata: serde_json::Value::Null,
    };
    let args = ToolArguments::new(call.input.clone());
    let running = AssertUnwindSafe(tool.execute(&args, &exec_ctx))
        .catch_unwind()
        .map(Ok::<_, ConductorError>);

    let outcome = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            return ToolResult::error(&call.id, ToolErrorKind::Cancelled, "cancelled");
        }
        outcome = with_optional_timeout(ctx.per_call_timeout, running) => outcome,
    };

    match outcome {
        Err(ConductorError::Timeout(limit_ms)) => {
            call_cancel.cancel();
            ToolResult::error(
                &call.id,
                ToolErrorKind::Timeout,
                format!("tool '{}' timed out after {limit_ms}ms", call.name),
            )
        }
        Err(error) => error_result(&call.id, error),
        Ok(Err(panic)) => ToolResult::error(
            &call.id,
            ToolErrorKind::Handler,
            format!("tool '{}' panicked: {}", call.name, panic_message(&*panic)),
        ),
        Ok(Ok(Ok(output))) => ToolResult::success(&call.id, output),
        Ok(Ok(Err(error))) => error_result(&call.id, error),
    }
}

fn error_result(call_id: &str, error: ConductorError) -> ToolResult {
    let kind = match &error {
        ConductorError::DelegationIncomplete { output, .. } => {
            return ToolResult::error_with_output(
                call_id,
                ToolErrorKind::DelegationIncomplete,
                output.clone(),
            );
        }
        ConductorError::DelegationDepthExceeded { .. } => ToolErrorKind::DelegationDepthExceeded,
        ConductorError::BudgetExhausted(_) => ToolErrorKind::BudgetExhausted,
        ConductorError::Timeout(_) => ToolErrorKind::Timeout,
        ConductorError::CancelledByCaller => ToolErrorKind::Cancelled,
        ConductorError::ApprovalDenied { .. } => ToolErrorKind::ApprovalDenied,
        ConductorError::SchemaValidation { .. } | ConductorError::InvalidArgument(_) => {
            ToolErrorKind::SchemaValidation
        }
        _ => ToolErrorKind::Handler,
    };
    ToolResult::error(call_id, kind, error.to_string())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalPolicy, StaticDecision};
    use crate::tools::{AgentTool, Tool, ToolParameters};
    use crate::types::RiskLevel;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn echo() -> Arc<dyn Tool> {
        Arc::new(AgentTool::new(
            "echo",
            "Echo the text back",
            ToolParameters::object().string("text", "Text", true).build(),
            |args, _ctx| async move { Ok(json!(args.get_str("text")?)) },
        ))
    }

    fn dispatcher(tools: Vec<Arc<dyn Tool>>, gate: ApprovalGate) -> Dispatcher {
        Dispatcher::new(ToolRegistry::from_tools(tools).unwrap(), gate)
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_input_never_reach_a_handler() {
        let dispatcher = dispatcher(vec![echo()], ApprovalGate::default());
        let results = dispatcher
            .dispatch(
                &[
                    ToolCall::new("a", "nope", json!({})),
                    ToolCall::new("b", "echo", json!({"text": 5})),
                    ToolCall::new("c", "echo", json!({"text": "hi"})),
                ],
                &DispatchContext::default(),
            )
            .await;

        assert_eq!(results[0].error_kind, Some(ToolErrorKind::UnknownTool));
        assert_eq!(results[1].error_kind, Some(ToolErrorKind::SchemaValidation));
        assert_eq!(results[2].output, json!("hi"));
        assert!(!results[2].is_error);
    }

    #[tokio::test]
    async fn handler_errors_and_panics_are_contained() {
        let failing: Arc<dyn Tool> = Arc::new(AgentTool::new(
            "fail",
            "Always fails",
            ToolParameters::empty(),
            |_args, _ctx| async move { Err(ConductorError::handler("fail", "boom")) },
        ));
        let panicking: Arc<dyn Tool> = Arc::new(AgentTool::new(
            "panic",
            "Panics",
            ToolParameters::empty(),
            |_args, _ctx| async move {
                if true {
                    panic!("handler exploded");
                }
                Ok(json!(null))
            },
        ));
        let dispatcher = dispatcher(vec![failing, panicking], ApprovalGate::default());
        let results = dispatcher
            .dispatch(
                &[ToolCall::new("a", "fail", json!({})), ToolCall::new("b", "panic", json!({}))],
                &DispatchContext::default(),
            )
            .await;

        assert_eq!(results[0].error_kind, Some(ToolErrorKind::Handler));
        assert!(results[0].error_message().unwrap().contains("boom"));
        assert_eq!(results[1].error_kind, Some(ToolErrorKind::Handler));
        assert!(results[1].error_message().unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn denied_calls_keep_the_handler_untouched() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let publish: Arc<dyn Tool> = Arc::new(
            AgentTool::new("publish", "Publish", ToolParameters::empty(), move |_a, _c| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("published"))
                }
            })
            .sensitive(RiskLevel::High, false),
        );
        let gate = ApprovalGate::new(
            ApprovalPolicy::Ask,
            Some(Arc::new(StaticDecision::deny_all("needs editorial review"))),
        );
        let records = dispatcher(vec![publish], gate)
            .dispatch_batch(&[ToolCall::new("p1", "publish", json!({}))], &DispatchContext::default())
            .await;

        let record = &records[0];
        let (request, decision) = record.approval.as_ref().unwrap();
        assert_eq!(request.call_id, "p1");
        assert_eq!(decision.request_id, request.id);
        assert_eq!(record.result.error_kind, Some(ToolErrorKind::ApprovalDenied));
        assert_eq!(record.result.error_message(), Some("needs editorial review"));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_without_blocking_siblings() {
        let slow: Arc<dyn Tool> = Arc::new(AgentTool::new(
            "slow",
            "Sleeps",
            ToolParameters::empty(),
            |_args, ctx| async move {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => Err(ConductorError::CancelledByCaller),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(json!("late")),
                }
            },
        ));
        let ctx = DispatchContext {
            per_call_timeout: Some(Duration::from_millis(100)),
            ..DispatchContext::default()
        };
        let results = dispatcher(vec![slow, echo()], ApprovalGate::default())
            .dispatch(
                &[
                    ToolCall::new("s", "slow", json!({})),
                    ToolCall::new("e", "echo", json!({"text": "fast"})),
                ],
                &ctx,
            )
            .await;

        assert_eq!(results[0].error_kind, Some(ToolErrorKind::Timeout));
        assert_eq!(results[1].output, json!("fast"));
    }

    #[tokio::test]
    async fn cancelled_batch_reports_cancelled_results() {
        let ctx = DispatchContext::default();
        ctx.cancel.cancel();
        let results = dispatcher(vec![echo()], ApprovalGate::default())
            .dispatch(&[ToolCall::new("a", "echo", json!({"text": "x"}))], &ctx)
            .await;
        assert_eq!(results[0].error_kind, Some(ToolErrorKind::Cancelled));
    }
}
