// src/inspection/engine.rs
//! Rule engine capability
//!
//! The inspector does not evaluate rules itself. It drives an engine through
//! one session per exchange:
//!
//! ```text
//! begin_session ─► evaluate(Connection) ─► ... ─► evaluate(Logging) ─► end_session
//!                        │ Interrupt / Error
//!                        └──────────────────────► evaluate(Logging) ─► end_session
//! ```
//!
//! `end_session` is called exactly once per session on every path. Engines
//! with blocking internals should move that work onto
//! `tokio::task::spawn_blocking` inside `evaluate` so other exchanges keep
//! making progress.

use crate::inspection::context::Facts;
use crate::inspection::phase::Phase;
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Result of evaluating one phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EvaluationOutcome {
    /// Nothing matched, keep going
    Continue,

    /// A rule asked for the exchange to be blocked
    Interrupt {
        /// Status to return; the configured default applies when absent
        status: Option<u16>,
        reason: String,
        rule_id: Option<String>,
    },

    /// The engine could not evaluate the phase
    Error { detail: String },
}

impl EvaluationOutcome {
    pub fn interrupt(status: u16, reason: impl Into<String>, rule_id: impl Into<String>) -> Self {
        EvaluationOutcome::Interrupt {
            status: Some(status),
            reason: reason.into(),
            rule_id: Some(rule_id.into()),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        EvaluationOutcome::Error {
            detail: detail.into(),
        }
    }

    pub fn is_continue(&self) -> bool {
        matches!(self, EvaluationOutcome::Continue)
    }
}

/// Capability contract of an external rule-evaluation engine
///
/// One engine instance is shared read-only by every exchange; a session is
/// owned by exactly one exchange and never crosses task boundaries.
#[async_trait]
pub trait RuleEngine: Send + Sync + 'static {
    /// Per-exchange evaluation handle
    type Session: Send;

    /// Open a session for a new exchange
    fn begin_session(&self) -> Self::Session;

    /// Evaluate `phase` against every fact recorded so far
    ///
    /// An `Err` means the call itself failed and is treated exactly like
    /// [`EvaluationOutcome::Error`].
    async fn evaluate(
        &self,
        session: &mut Self::Session,
        phase: Phase,
        facts: &Facts,
    ) -> Result<EvaluationOutcome>;

    /// Dispose of a session
    fn end_session(&self, session: Self::Session) -> Result<()>;
}
