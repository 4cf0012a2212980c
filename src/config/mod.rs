//! Configuration system (layered: code > env > TOML file > defaults).

use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::approval::ApprovalPolicy;
use crate::budget::Budget;
use crate::error::ConductorError;
use crate::util::RetryPolicy;

const CONFIG_FILE_NAME: &str = "conductor.toml";
const DEFAULT_MAX_ITERATIONS: u32 = 15;
const DEFAULT_MAX_DEPTH: usize = 1;
const DEFAULT_SUB_AGENT_MAX_ITERATIONS: u32 = 5;
const DEFAULT_MAX_CONCURRENT_CALLS: usize = 8;

/// What a per-call timeout does to the loop.
#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Report the timeout as an error tool result and keep going.
    #[default]
    Report,
    /// End the loop as `Failed`.
    FailLoop,
}

/// Model settings passed through to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct ModelConfig {
    #[builder(into, default = "default".to_string())]
    pub model_id: String,
    /// System instructions for this loop.
    #[builder(into)]
    pub system: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "default".to_string(),
            system: None,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Default budget for a root loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct BudgetConfig {
    #[builder(default = DEFAULT_MAX_ITERATIONS)]
    pub max_iterations: u32,
    pub per_call_timeout_ms: Option<u64>,
    pub wall_clock_timeout_ms: Option<u64>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            per_call_timeout_ms: None,
            wall_clock_timeout_ms: None,
        }
    }
}

impl BudgetConfig {
    pub fn to_budget(&self) -> Budget {
        Budget {
            max_iterations: self.max_iterations,
            per_call_timeout: self.per_call_timeout_ms.map(Duration::from_millis),
            wall_clock_timeout: self.wall_clock_timeout_ms.map(Duration::from_millis),
            elapsed_iterations: 0,
        }
    }
}

/// Limits on sub-agent delegation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct DelegationConfig {
    /// Deepest loop allowed to exist; a loop at this depth cannot delegate.
    #[builder(default = DEFAULT_MAX_DEPTH)]
    pub max_depth: usize,
    #[builder(default = DEFAULT_SUB_AGENT_MAX_ITERATIONS)]
    pub sub_agent_max_iterations: u32,
    /// Keep `delegate_task` in sub-agent registries.
    #[builder(default)]
    pub allow_nested: bool,
    /// Fail the loop instead of reporting a depth violation to the model.
    #[builder(default)]
    pub escalate_depth_exceeded: bool,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            sub_agent_max_iterations: DEFAULT_SUB_AGENT_MAX_ITERATIONS,
            allow_nested: false,
            escalate_depth_exceeded: false,
        }
    }
}

/// Everything a loop run needs besides its collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
pub struct LoopConfig {
    #[builder(default)]
    pub model: ModelConfig,
    #[builder(default)]
    pub budget: BudgetConfig,
    #[builder(default)]
    pub delegation: DelegationConfig,
    #[builder(default)]
    pub approval_policy: ApprovalPolicy,
    #[builder(default)]
    pub timeout_policy: TimeoutPolicy,
    /// Request streamed responses from the gateway.
    #[builder(default)]
    pub streaming: bool,
    #[builder(default = DEFAULT_MAX_CONCURRENT_CALLS)]
    pub max_concurrent_calls: usize,
    /// Retry policy for gateway calls.
    #[builder(default)]
    pub retry: RetryPolicy,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            budget: BudgetConfig::default(),
            delegation: DelegationConfig::default(),
            approval_policy: ApprovalPolicy::default(),
            timeout_policy: TimeoutPolicy::default(),
            streaming: false,
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            retry: RetryPolicy::default(),
        }
    }
}

impl LoopConfig {
    /// Load defaults, then the default config file if present, then `.env`
    /// and `CONDUCTOR_*` environment variables.
    pub fn load() -> Result<Self, ConductorError> {
        Self::load_from(default_config_path().as_deref())
    }

    /// Like [`load`](Self::load) with an explicit (optional) file.
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConductorError> {
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        let config = match path {
            Some(path) if path.exists() => Self::from_file(path)?,
            _ => Self::default(),
        };
        Ok(config.with_env())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConductorError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw).map_err(|err| match err {
            ConductorError::Configuration(message) => {
                ConductorError::Configuration(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConductorError> {
        let config: Self =
            toml::from_str(raw).map_err(|err| ConductorError::Configuration(err.to_string()))?;
        config.retry.validate()?;
        Ok(config)
    }

    /// Overlay process environment variables.
    pub fn with_env(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup`. Unparseable values are ignored.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(model) = lookup("CONDUCTOR_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model.model_id = model.trim().to_string();
        }
        if let Some(system) = lookup("CONDUCTOR_SYSTEM_PROMPT").filter(|v| !v.trim().is_empty()) {
            self.model.system = Some(system);
        }
        if let Some(max_tokens) = parse_positive(&lookup, "CONDUCTOR_MAX_TOKENS") {
            self.model.max_tokens = Some(max_tokens);
        }
        if let Some(temperature) = lookup("CONDUCTOR_TEMPERATURE")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|t| t.is_finite() && *t >= 0.0)
        {
            self.model.temperature = Some(temperature);
        }
        if let Some(max) = parse_positive(&lookup, "CONDUCTOR_MAX_ITERATIONS") {
            self.budget.max_iterations = max;
        }
        if let Some(ms) = parse_positive(&lookup, "CONDUCTOR_PER_CALL_TIMEOUT_MS") {
            self.budget.per_call_timeout_ms = Some(ms);
        }
        if let Some(ms) = parse_positive(&lookup, "CONDUCTOR_WALL_CLOCK_TIMEOUT_MS") {
            self.budget.wall_clock_timeout_ms = Some(ms);
        }
        if let Some(depth) = lookup("CONDUCTOR_MAX_DEPTH").and_then(|v| v.trim().parse::<usize>().ok()) {
            self.delegation.max_depth = depth;
        }
        if let Some(max) = parse_positive(&lookup, "CONDUCTOR_SUB_AGENT_MAX_ITERATIONS") {
            self.delegation.sub_agent_max_iterations = max;
        }
        if let Some(allow) = parse_bool(&lookup, "CONDUCTOR_ALLOW_NESTED_DELEGATION") {
            self.delegation.allow_nested = allow;
        }
        if let Some(policy) = lookup("CONDUCTOR_APPROVAL_POLICY").and_then(|v| v.trim().parse().ok()) {
            self.approval_policy = policy;
        }
        if let Some(policy) = lookup("CONDUCTOR_TIMEOUT_POLICY").and_then(|v| v.trim().parse().ok()) {
            self.timeout_policy = policy;
        }
        if let Some(streaming) = parse_bool(&lookup, "CONDUCTOR_STREAMING") {
            self.streaming = streaming;
        }
        if let Some(limit) = parse_positive(&lookup, "CONDUCTOR_MAX_CONCURRENT_CALLS") {
            self.max_concurrent_calls = limit;
        }
        self
    }
}

/// `<config dir>/conductor.toml` for this platform, if a home directory exists.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "conductor")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

/// A positive integer that fits `T`; anything else is logged and ignored.
fn parse_positive<T: TryFrom<u64>>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    let parsed = raw
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
        .and_then(|value| T::try_from(value).ok());
    if parsed.is_none() {
        tracing::warn!(key, value = %raw, "ignoring invalid positive integer");
    }
    parsed
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    match lookup(key)?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = LoopConfig::default();
        assert_eq!(config.budget.max_iterations, 15);
        assert_eq!(config.delegation.max_depth, 1);
        assert_eq!(config.delegation.sub_agent_max_iterations, 5);
        assert_eq!(config.approval_policy, ApprovalPolicy::Ask);
        assert_eq!(config, LoopConfig::builder().build());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = LoopConfig::from_toml_str(
            r#"
            approval_policy = "always"
            timeout_policy = "fail_loop"

            [budget]
            max_iterations = 4
            per_call_timeout_ms = 2500
            "#,
        )
        .unwrap();
        assert_eq!(config.approval_policy, ApprovalPolicy::Always);
        assert_eq!(config.timeout_policy, TimeoutPolicy::FailLoop);
        assert_eq!(config.budget.max_iterations, 4);
        assert_eq!(
            config.budget.to_budget().per_call_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(config.delegation, DelegationConfig::default());
    }

    #[test]
    fn malformed_toml_is_a_configuration_error() {
        let err = LoopConfig::from_toml_str("budget = 3").unwrap_err();
        assert!(matches!(err, ConductorError::Configuration(_)));
    }

    #[test]
    fn env_overrides_and_ignores_invalid_values() {
        let config = LoopConfig::default().with_env_from(env(&[
            ("CONDUCTOR_MAX_ITERATIONS", "0"),
            ("CONDUCTOR_MAX_CONCURRENT_CALLS", "lots"),
            ("CONDUCTOR_MAX_DEPTH", "2"),
            ("CONDUCTOR_APPROVAL_POLICY", "never"),
            ("CONDUCTOR_TIMEOUT_POLICY", "explode"),
            ("CONDUCTOR_STREAMING", "yes"),
            ("CONDUCTOR_MODEL", " writer-large "),
        ]));
        assert_eq!(config.budget.max_iterations, 15);
        assert_eq!(config.max_concurrent_calls, 8);
        assert_eq!(config.delegation.max_depth, 2);
        assert_eq!(config.approval_policy, ApprovalPolicy::Never);
        assert_eq!(config.timeout_policy, TimeoutPolicy::Report);
        assert!(config.streaming);
        assert_eq!(config.model.model_id, "writer-large");
    }

    #[test]
    fn env_values_too_large_for_the_field_are_ignored() {
        let config = LoopConfig::default().with_env_from(env(&[
            ("CONDUCTOR_MAX_ITERATIONS", "4294967296"),
            ("CONDUCTOR_SUB_AGENT_MAX_ITERATIONS", "99999999999"),
            ("CONDUCTOR_MAX_TOKENS", "4294967297"),
            ("CONDUCTOR_PER_CALL_TIMEOUT_MS", "4294967296"),
        ]));
        assert_eq!(config.budget.max_iterations, 15);
        assert_eq!(config.delegation.sub_agent_max_iterations, 5);
        assert_eq!(config.model.max_tokens, None);
        assert_eq!(config.budget.per_call_timeout_ms, Some(4_294_967_296));

        let config = LoopConfig::default()
            .with_env_from(env(&[("CONDUCTOR_MAX_ITERATIONS", "4294967295")]));
        assert_eq!(config.budget.max_iterations, u32::MAX);
    }

    #[test]
    fn unusable_retry_settings_are_rejected() {
        for retry in [
            "multiplier = -1.0",
            "multiplier = nan",
            "multiplier = 0.5",
            "initial_backoff = 60000\nmax_backoff = 1000",
        ] {
            let raw = format!("[retry]\n{retry}\n");
            let err = LoopConfig::from_toml_str(&raw).unwrap_err();
            assert!(matches!(err, ConductorError::Configuration(_)), "{retry}: {err}");
        }

        let config = LoopConfig::from_toml_str("[retry]\nmultiplier = 1.5\nmax_attempts = 5\n").unwrap();
        assert_eq!(config.retry.max_attempts, 5);
    }
}
