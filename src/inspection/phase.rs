// src/inspection/phase.rs
//! The fixed set of inspection phases

use serde::{Deserialize, Serialize};
use std::fmt;

/// Inspection phase, in pipeline order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connection,
    RequestUri,
    RequestHeaders,
    RequestBody,
    ResponseHeaders,
    ResponseBody,
    Logging,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 7] = [
        Phase::Connection,
        Phase::RequestUri,
        Phase::RequestHeaders,
        Phase::RequestBody,
        Phase::ResponseHeaders,
        Phase::ResponseBody,
        Phase::Logging,
    ];

    /// Phases run before forwarding
    pub const REQUEST: [Phase; 4] = [
        Phase::Connection,
        Phase::RequestUri,
        Phase::RequestHeaders,
        Phase::RequestBody,
    ];

    /// Advisory phases run after forwarding
    pub const RESPONSE: [Phase; 2] = [Phase::ResponseHeaders, Phase::ResponseBody];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Connection => "connection",
            Phase::RequestUri => "request_uri",
            Phase::RequestHeaders => "request_headers",
            Phase::RequestBody => "request_body",
            Phase::ResponseHeaders => "response_headers",
            Phase::ResponseBody => "response_body",
            Phase::Logging => "logging",
        }
    }

    pub fn is_response(self) -> bool {
        matches!(self, Phase::ResponseHeaders | Phase::ResponseBody)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
