// src/inspection/mod.rs
//! Request inspection core
//!
//! Every inbound exchange is walked through a fixed sequence of phases
//! against a rule engine before it may reach the backend:
//!
//! - **Phase**: the seven named inspection stages
//! - **Context**: per-exchange facts, interruption record, engine session
//! - **Engine**: capability contract of the external rule engine
//! - **Policy**: Running / Interrupted / Errored state machine (fails closed)
//! - **Pipeline**: phase ordering and fact recording
//! - **Middleware**: `handle(request) -> response` around a forwarder
//!
//! # Architecture
//!
//! ```text
//! Client ─► Inspector::handle
//!              │  EvaluationContext + engine session
//!              ├─ Connection → RequestUri → RequestHeaders → RequestBody
//!              │      (InterruptionPolicy after each phase)
//!              ├─ halted?  ── yes ─► 403 / 500 response (never forwarded)
//!              ├─ Forwarder::forward ─► Backend
//!              ├─ ResponseHeaders → ResponseBody (advisory)
//!              ├─ Logging (always, once)
//!              └─ session released (every path, including cancellation)
//! ```

pub mod context;
pub mod engine;
pub mod middleware;
pub mod phase;
pub mod pipeline;
pub mod policy;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use context::{BodyCapture, CaptureLimits, EvaluationContext, Facts, Interruption, PhaseData};
pub use engine::{EvaluationOutcome, RuleEngine};
pub use middleware::{ExchangeOutcome, Inspector};
pub use phase::Phase;
pub use pipeline::{ConnectionMeta, PhasePipeline, PipelineConfig};
pub use policy::{InterruptionPolicy, PolicyState};
