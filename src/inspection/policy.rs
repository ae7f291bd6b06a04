// src/inspection/policy.rs
//! Interruption policy
//!
//! ```text
//!            Continue
//!          ┌─────────┐
//!          ▼         │
//!      ┌─────────┐───┘   Interrupt    ┌─────────────┐
//!      │ Running │──────────────────► │ Interrupted │
//!      └─────────┘                    └─────────────┘
//!           │  Error / evaluate failed ┌─────────────┐
//!           └────────────────────────► │   Errored   │
//!                                      └─────────────┘
//! ```
//!
//! Both terminal states stop evaluation of request and response phases;
//! only `Logging` may still run. `Errored` fails closed: the exchange is
//! answered with a server error and never forwarded.

use crate::inspection::context::EvaluationContext;
use crate::inspection::engine::{EvaluationOutcome, RuleEngine};
use crate::inspection::phase::Phase;
use crate::observability::{ENGINE_ERRORS_TOTAL, INTERRUPTIONS_TOTAL};
use crate::utils::errors::Result;
use tracing::{error, info};

/// Policy state after the last evaluated phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyState {
    Running,
    Interrupted,
    Errored,
}

impl PolicyState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, PolicyState::Running)
    }
}

/// Tracks how the evaluation of one exchange is going
#[derive(Debug)]
pub struct InterruptionPolicy {
    state: PolicyState,
    error_detail: Option<String>,
}

impl InterruptionPolicy {
    pub fn new() -> Self {
        Self {
            state: PolicyState::Running,
            error_detail: None,
        }
    }

    pub fn state(&self) -> PolicyState {
        self.state
    }

    /// Engine failure that moved the policy to `Errored`
    pub fn error_detail(&self) -> Option<&str> {
        self.error_detail.as_deref()
    }

    /// Whether the engine may be asked to evaluate `phase`
    pub fn may_evaluate(&self, phase: Phase) -> bool {
        phase == Phase::Logging || self.state == PolicyState::Running
    }

    /// Apply the result of evaluating `phase` and return the new state
    pub fn observe<E: RuleEngine>(
        &mut self,
        ctx: &mut EvaluationContext<E>,
        phase: Phase,
        result: Result<EvaluationOutcome>,
    ) -> PolicyState {
        if self.state.is_terminal() {
            return self.state;
        }

        match result {
            Ok(EvaluationOutcome::Continue) => {}
            Ok(EvaluationOutcome::Interrupt {
                status,
                reason,
                rule_id,
            }) => {
                info!(
                    exchange_id = %ctx.exchange_id(),
                    %phase,
                    rule_id = rule_id.as_deref().unwrap_or("-"),
                    "Exchange interrupted: {}",
                    reason
                );
                metrics::counter!(INTERRUPTIONS_TOTAL, "phase" => phase.name()).increment(1);
                ctx.interrupt(phase, status, reason, rule_id);
                self.state = PolicyState::Interrupted;
            }
            Ok(EvaluationOutcome::Error { detail }) => self.fail(ctx, phase, detail),
            Err(e) => self.fail(ctx, phase, e.to_string()),
        }

        self.state
    }

    fn fail<E: RuleEngine>(&mut self, ctx: &EvaluationContext<E>, phase: Phase, detail: String) {
        error!(
            exchange_id = %ctx.exchange_id(),
            %phase,
            "Rule engine evaluation failed: {}",
            detail
        );
        metrics::counter!(ENGINE_ERRORS_TOTAL).increment(1);
        self.error_detail = Some(detail);
        self.state = PolicyState::Errored;
    }
}

impl Default for InterruptionPolicy {
    fn default() -> Self {
        Self::new()
    }
}
