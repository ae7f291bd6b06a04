// src/utils/errors.rs
//! Error taxonomy for the inspector
//!
//! Every failure an exchange can hit is represented here. None of them
//! escapes the per-exchange handler: the middleware maps each variant to a
//! response status (see [`InspectorError::status_code`]) and keeps serving.

use hyper::StatusCode;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, InspectorError>;

/// Inspector errors
#[derive(Debug, Error)]
pub enum InspectorError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Directive text could not be compiled into rules
    #[error("Rule parse error at line {line}: {message}")]
    RuleParse { line: usize, message: String },

    /// The rule engine malfunctioned while evaluating a phase
    #[error("Engine evaluation failed: {0}")]
    EngineEvaluation(String),

    /// Backend unreachable or returned an unusable response
    #[error("Forwarding failed: {0}")]
    Forwarding(String),

    /// Backend did not answer within the configured timeout
    #[error("Forwarding timed out after {0}ms")]
    ForwardingTimeout(u64),

    /// Rule engine session could not be disposed cleanly
    #[error("Session release failed: {0}")]
    SessionRelease(String),

    /// Attempt to record facts after the exchange was interrupted
    #[error("Evaluation context is sealed by an interruption")]
    ContextSealed,

    /// Inbound or outbound body could not be read
    #[error("Body read error: {0}")]
    Body(String),

    /// Inbound body exceeded the buffering ceiling
    #[error("Body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InspectorError {
    /// Status returned to the client when this error ends an exchange
    pub fn status_code(&self) -> StatusCode {
        match self {
            InspectorError::Forwarding(_) => StatusCode::BAD_GATEWAY,
            InspectorError::ForwardingTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            InspectorError::Body(_) => StatusCode::BAD_REQUEST,
            InspectorError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error originates from talking to the backend
    pub fn is_forwarding(&self) -> bool {
        matches!(
            self,
            InspectorError::Forwarding(_) | InspectorError::ForwardingTimeout(_)
        )
    }
}

impl From<config::ConfigError> for InspectorError {
    fn from(err: config::ConfigError) -> Self {
        InspectorError::ConfigError(err.to_string())
    }
}
