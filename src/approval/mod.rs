//! Approval gate for sensitive tools and the pluggable decision sources
//! behind it.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tokio::sync::{mpsc, oneshot};

use crate::error::ConductorError;
use crate::tools::{Sensitivity, ToolRegistry};
use crate::types::{ApprovalDecision, ApprovalRequest, RiskLevel, ToolCall};

/// How sensitive tool calls are resolved for a run.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalPolicy {
    /// Deny every sensitive call without asking.
    Never,
    /// Ask the decision provider; no provider means deny.
    #[default]
    Ask,
    /// Approve every sensitive call without asking.
    Always,
}

/// Resolves approval requests: a human operator, a policy engine or a rule set.
#[async_trait]
pub trait DecisionProvider: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, ConductorError>;
}

/// Async approval handler callback.
pub type ApprovalHandler =
    Arc<dyn Fn(ApprovalRequest) -> BoxFuture<'static, ApprovalDecision> + Send + Sync>;

/// Adapts an [`ApprovalHandler`] closure.
pub struct FnDecisionProvider {
    handler: ApprovalHandler,
}

impl FnDecisionProvider {
    pub fn new(handler: ApprovalHandler) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl DecisionProvider for FnDecisionProvider {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, ConductorError> {
        Ok((self.handler)(request.clone()).await)
    }
}

/// Gives the same answer to every request.
#[derive(Debug, Clone)]
pub struct StaticDecision {
    approve: bool,
    reason: Option<String>,
}

impl StaticDecision {
    pub fn allow_all() -> Self {
        Self {
            approve: true,
            reason: None,
        }
    }

    pub fn deny_all(reason: impl Into<String>) -> Self {
        Self {
            approve: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
impl DecisionProvider for StaticDecision {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, ConductorError> {
        let decision = if self.approve {
            ApprovalDecision::approve(&request.id)
        } else {
            ApprovalDecision::deny(&request.id, self.reason.clone().unwrap_or_default())
        };
        Ok(decision.decided_by("static"))
    }
}

/// Per-tool verdict in a [`RuleBasedProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum ToolRule {
    Allow,
    Deny(String),
}

/// Decides from per-tool rules, then from a risk threshold.
///
/// A tool with no rule is approved when its risk is at or below
/// `max_auto_risk`, and denied otherwise.
#[derive(Debug, Clone, Default)]
pub struct RuleBasedProvider {
    rules: HashMap<String, ToolRule>,
    max_auto_risk: Option<RiskLevel>,
}

impl RuleBasedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(mut self, tool_name: impl Into<String>) -> Self {
        self.rules.insert(tool_name.into(), ToolRule::Allow);
        self
    }

    pub fn deny(mut self, tool_name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.rules
            .insert(tool_name.into(), ToolRule::Deny(reason.into()));
        self
    }

    pub fn auto_approve_up_to(mut self, risk: RiskLevel) -> Self {
        self.max_auto_risk = Some(risk);
        self
    }
}

#[async_trait]
impl DecisionProvider for RuleBasedProvider {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, ConductorError> {
        let decision = match self.rules.get(&request.tool_name) {
            Some(ToolRule::Allow) => ApprovalDecision::approve(&request.id),
            Some(ToolRule::Deny(reason)) => ApprovalDecision::deny(&request.id, reason.clone()),
            None => match self.max_auto_risk {
                Some(max) if request.risk <= max => ApprovalDecision::approve(&request.id),
                Some(max) => ApprovalDecision::deny(
                    &request.id,
                    format!("{} risk exceeds auto-approval level {max}", request.risk),
                ),
                None => ApprovalDecision::deny(
                    &request.id,
                    format!("no rule for tool '{}'", request.tool_name),
                ),
            },
        };
        Ok(decision.decided_by("rules"))
    }
}

/// A request waiting for an operator, with the means to answer it.
#[derive(Debug)]
pub struct PendingApproval {
    pub request: ApprovalRequest,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl PendingApproval {
    pub fn respond(self, decision: ApprovalDecision) {
        let _ = self.responder.send(decision);
    }

    pub fn approve(self, operator: impl Into<String>) {
        let decision = ApprovalDecision::approve(&self.request.id).decided_by(operator);
        self.respond(decision);
    }

    pub fn deny(self, operator: impl Into<String>, reason: impl Into<String>) {
        let decision = ApprovalDecision::deny(&self.request.id, reason).decided_by(operator);
        self.respond(decision);
    }
}

/// Forwards requests to an operator over a channel and waits for the answer.
///
/// A dropped [`PendingApproval`] or a closed receiver counts as a denial.
#[derive(Debug, Clone)]
pub struct ChannelDecisionProvider {
    tx: mpsc::Sender<PendingApproval>,
}

impl ChannelDecisionProvider {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PendingApproval>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl DecisionProvider for ChannelDecisionProvider {
    async fn decide(&self, request: &ApprovalRequest) -> Result<ApprovalDecision, ConductorError> {
        let (responder, answer) = oneshot::channel();
        let pending = PendingApproval {
            request: request.clone(),
            responder,
        };
        if self.tx.send(pending).await.is_err() {
            return Ok(ApprovalDecision::deny(&request.id, "no operator is listening")
                .decided_by("channel"));
        }
        Ok(answer.await.unwrap_or_else(|_| {
            ApprovalDecision::deny(&request.id, "operator dropped the request").decided_by("channel")
        }))
    }
}

/// Intercepts calls to sensitive tools and obtains a decision for each.
#[derive(Clone, Default)]
pub struct ApprovalGate {
    policy: ApprovalPolicy,
    provider: Option<Arc<dyn DecisionProvider>>,
}

impl ApprovalGate {
    pub fn new(policy: ApprovalPolicy, provider: Option<Arc<dyn DecisionProvider>>) -> Self {
        Self { policy, provider }
    }

    pub fn policy(&self) -> ApprovalPolicy {
        self.policy
    }

    /// Sensitivity profile of the called tool, if the call must be gated.
    pub fn requires_gating<'a>(
        &self,
        registry: &'a ToolRegistry,
        call: &ToolCall,
    ) -> Option<&'a Sensitivity> {
        registry
            .get(&call.name)
            .and_then(|tool| tool.sensitivity())
    }

    /// Build the request shown to the decision source.
    pub fn request_for(&self, call: &ToolCall, sensitivity: &Sensitivity) -> ApprovalRequest {
        ApprovalRequest {
            id: format!("apr_{}", uuid::Uuid::new_v4().simple()),
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            action: describe_action(call),
            risk: sensitivity.risk,
            reversible: sensitivity.reversible,
            arguments: call.input.clone(),
        }
    }

    /// Resolve one request. Never fails: provider errors become denials.
    pub async fn request_decision(&self, request: &ApprovalRequest) -> ApprovalDecision {
        let mut decision = match self.policy {
            ApprovalPolicy::Always => ApprovalDecision::approve(&request.id).decided_by("policy"),
            ApprovalPolicy::Never => {
                ApprovalDecision::deny(&request.id, "sensitive tools are disabled for this run")
                    .decided_by("policy")
            }
            ApprovalPolicy::Ask => match &self.provider {
                None => ApprovalDecision::deny(&request.id, "no decision provider configured")
                    .decided_by("policy"),
                Some(provider) => match provider.decide(request).await {
                    Ok(decision) => decision,
                    Err(err) => {
                        tracing::warn!(request_id = %request.id, error = %err, "decision provider failed");
                        ApprovalDecision::deny(&request.id, format!("decision provider failed: {err}"))
                    }
                },
            },
        };
        decision.request_id = request.id.clone();
        decision
    }
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("policy", &self.policy)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

fn describe_action(call: &ToolCall) -> String {
    match call.input.as_object() {
        Some(args) if !args.is_empty() => {
            let keys: Vec<&str> = args.keys().map(String::as_str).collect();
            format!("run {} with {}", call.name, keys.join(", "))
        }
        _ => format!("run {}", call.name),
    }
}
