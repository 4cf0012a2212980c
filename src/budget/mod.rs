//! Budget and the finite-state controller that enforces it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::Display;
use tokio::time::Instant;

use crate::error::ConductorError;

/// Bound on iterations and time a single loop instance may consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub max_iterations: u32,
    #[serde(default, with = "crate::util::duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub per_call_timeout: Option<Duration>,
    #[serde(default, with = "crate::util::duration_ms::option", skip_serializing_if = "Option::is_none")]
    pub wall_clock_timeout: Option<Duration>,
    #[serde(default)]
    pub elapsed_iterations: u32,
}

impl Budget {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations,
            per_call_timeout: None,
            wall_clock_timeout: None,
            elapsed_iterations: 0,
        }
    }

    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = Some(timeout);
        self
    }

    pub fn with_wall_clock_timeout(mut self, timeout: Duration) -> Self {
        self.wall_clock_timeout = Some(timeout);
        self
    }

    pub fn remaining_iterations(&self) -> u32 {
        self.max_iterations.saturating_sub(self.elapsed_iterations)
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed_iterations >= self.max_iterations
    }

    /// A fresh budget no larger than `ceiling` in any dimension.
    pub fn capped_by(&self, ceiling: &Budget) -> Budget {
        Budget {
            max_iterations: self
                .remaining_iterations()
                .min(ceiling.remaining_iterations()),
            per_call_timeout: min_duration(self.per_call_timeout, ceiling.per_call_timeout),
            wall_clock_timeout: min_duration(self.wall_clock_timeout, ceiling.wall_clock_timeout),
            elapsed_iterations: 0,
        }
    }
}

fn min_duration(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Loop lifecycle. Every state other than `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    Running,
    Completed,
    Exhausted,
    Failed,
    Cancelled,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, LoopState::Running)
    }
}

/// Which budget dimension ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExhaustionReason {
    Iterations,
    WallClock,
}

/// Sole owner and mutator of a loop's [`Budget`].
#[derive(Debug)]
pub struct BudgetController {
    budget: Budget,
    state: LoopState,
    started_at: Instant,
    exhaustion: Option<ExhaustionReason>,
    failure: Option<String>,
}

impl BudgetController {
    /// Start the wall clock for `budget`.
    ///
    /// A restored budget keeps its elapsed iterations; the wall clock restarts.
    pub fn new(budget: Budget) -> Self {
        Self {
            budget,
            state: LoopState::Running,
            started_at: Instant::now(),
            exhaustion: None,
            failure: None,
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn exhaustion(&self) -> Option<ExhaustionReason> {
        self.exhaustion
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wall-clock deadline, if the budget has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.budget
            .wall_clock_timeout
            .map(|timeout| self.started_at + timeout)
    }

    /// Re-evaluate the budget and move to `Exhausted` if it ran out.
    ///
    /// Returns the (possibly updated) state.
    pub fn check(&mut self) -> LoopState {
        if self.state.is_terminal() {
            return self.state;
        }
        if self.budget.is_exhausted() {
            self.exhaust(ExhaustionReason::Iterations);
        } else if self
            .deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.exhaust(ExhaustionReason::WallClock);
        }
        self.state
    }

    /// Whether another gateway invocation is permitted right now.
    pub fn can_invoke(&mut self) -> bool {
        self.check() == LoopState::Running
    }

    /// Count one gateway invocation.
    pub fn record_iteration(&mut self) -> Result<u32, ConductorError> {
        if self.state.is_terminal() {
            return Err(ConductorError::InvalidState(format!(
                "cannot record an iteration in terminal state {}",
                self.state
            )));
        }
        if self.budget.is_exhausted() {
            return Err(ConductorError::BudgetExhausted(format!(
                "max_iterations={} reached",
                self.budget.max_iterations
            )));
        }
        self.budget.elapsed_iterations += 1;
        Ok(self.budget.elapsed_iterations)
    }

    pub fn complete(&mut self) -> bool {
        self.transition(LoopState::Completed)
    }

    pub fn exhaust(&mut self, reason: ExhaustionReason) -> bool {
        let moved = self.transition(LoopState::Exhausted);
        if moved {
            self.exhaustion = Some(reason);
        }
        moved
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let moved = self.transition(LoopState::Failed);
        if moved {
            self.failure = Some(reason.into());
        }
        moved
    }

    pub fn cancel(&mut self) -> bool {
        self.transition(LoopState::Cancelled)
    }

    /// The budget left for a nested loop started now.
    pub fn remaining(&self) -> Budget {
        let wall_clock_timeout = self
            .budget
            .wall_clock_timeout
            .map(|timeout| timeout.saturating_sub(self.elapsed()));
        Budget {
            max_iterations: self.budget.remaining_iterations(),
            per_call_timeout: self.budget.per_call_timeout,
            wall_clock_timeout,
            elapsed_iterations: 0,
        }
    }

    fn transition(&mut self, next: LoopState) -> bool {
        if self.state.is_terminal() {
            tracing::debug!(from = %self.state, to = %next, "ignoring transition out of terminal state");
            return false;
        }
        self.state = next;
        true
    }
}
