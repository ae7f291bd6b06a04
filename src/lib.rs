// src/lib.rs
//! Inspector Gate Library
//!
//! An inline HTTP traffic inspector: every exchange is walked through rule
//! evaluation phases and either forwarded to the backend unchanged or
//! answered with a blocking response.
//!
//! # Architecture
//!
//! The crate is structured into several key modules:
//!
//! - **inspection**: evaluation context, phase pipeline, interruption policy,
//!   intercepting middleware
//! - **rules**: directive-driven rule engine
//! - **proxy**: backend forwarding and the accept loop
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and error types

// Public module exports
pub mod inspection;
pub mod observability;
pub mod proxy;
pub mod rules;
pub mod utils;

// Re-export commonly used types
pub use inspection::{ConnectionMeta, EvaluationOutcome, Inspector, Phase, RuleEngine};
pub use proxy::{Forwarder, HttpForwarder, InspectorServer};
pub use rules::DirectiveEngine;
pub use utils::config::InspectorConfig;
pub use utils::errors::{InspectorError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
