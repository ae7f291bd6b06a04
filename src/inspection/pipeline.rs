// src/inspection/pipeline.rs
//! Phase pipeline
//!
//! Walks an exchange through the fixed phase order, recording facts into the
//! evaluation context and consulting the interruption policy after every
//! evaluation:
//!
//! ```text
//! Connection → RequestUri → RequestHeaders → RequestBody ─┬─► (forward)
//!        │ halt                                           │
//!        ▼                                                ▼
//!     Logging ◄──────────── ResponseBody ◄──── ResponseHeaders (advisory)
//! ```
//!
//! Phases are never skipped because there is nothing to record; only a
//! terminal policy state stops them. `Logging` runs exactly once.

use crate::inspection::context::{CaptureLimits, EvaluationContext, PhaseData};
use crate::inspection::engine::{EvaluationOutcome, RuleEngine};
use crate::inspection::phase::Phase;
use crate::inspection::policy::{InterruptionPolicy, PolicyState};
use bytes::Bytes;
use hyper::header::HOST;
use hyper::http::request::Parts;
use hyper::{HeaderMap, Response, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Transport-level facts about the inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionMeta {
    pub client_addr: SocketAddr,

    /// Whether the client reached us over TLS
    pub secure: bool,
}

impl ConnectionMeta {
    pub fn new(client_addr: SocketAddr, secure: bool) -> Self {
        Self {
            client_addr,
            secure,
        }
    }
}

/// Pipeline settings
#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub limits: CaptureLimits,

    /// Run the advisory response phases after forwarding
    pub response_inspection: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            limits: CaptureLimits::default(),
            response_inspection: true,
        }
    }
}

/// Drives evaluation contexts through the inspection phases
pub struct PhasePipeline<E: RuleEngine> {
    engine: Arc<E>,
    config: PipelineConfig,
}

impl<E: RuleEngine> PhasePipeline<E> {
    pub fn new(engine: Arc<E>, config: PipelineConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Open a context (and engine session) for a new exchange
    pub fn begin(&self) -> EvaluationContext<E> {
        EvaluationContext::create(Arc::clone(&self.engine), self.config.limits)
    }

    /// Phases 1-3: everything available before the body is read
    pub async fn run_head_phases(
        &self,
        ctx: &mut EvaluationContext<E>,
        policy: &mut InterruptionPolicy,
        conn: &ConnectionMeta,
        parts: &Parts,
    ) -> PolicyState {
        let connection = PhaseData::Connection {
            client_addr: conn.client_addr,
            host: request_host(parts),
            secure: conn.secure,
        };
        if self
            .run_phase(ctx, policy, Phase::Connection, connection)
            .await
            .is_terminal()
        {
            return policy.state();
        }

        let request_line = PhaseData::RequestLine {
            method: parts.method.to_string(),
            uri: parts.uri.to_string(),
            protocol: format_http_version(parts.version).to_string(),
        };
        if self
            .run_phase(ctx, policy, Phase::RequestUri, request_line)
            .await
            .is_terminal()
        {
            return policy.state();
        }

        let headers = PhaseData::Headers(header_pairs(&parts.headers));
        self.run_phase(ctx, policy, Phase::RequestHeaders, headers)
            .await
    }

    /// Phase 4: the (possibly empty) request body, truncated at the limit
    pub async fn run_body_phase(
        &self,
        ctx: &mut EvaluationContext<E>,
        policy: &mut InterruptionPolicy,
        body: &Bytes,
    ) -> PolicyState {
        self.run_phase(ctx, policy, Phase::RequestBody, body_data(body))
            .await
    }

    /// Phases 5-6, advisory only: the response is never altered here
    pub async fn run_response_phases(
        &self,
        ctx: &mut EvaluationContext<E>,
        policy: &mut InterruptionPolicy,
        response: &Response<Bytes>,
    ) -> PolicyState {
        if !self.config.response_inspection {
            return policy.state();
        }

        let head = PhaseData::ResponseHead {
            status: response.status().as_u16(),
            headers: header_pairs(response.headers()),
        };
        if self
            .run_phase(ctx, policy, Phase::ResponseHeaders, head)
            .await
            .is_terminal()
        {
            return policy.state();
        }

        self.run_phase(ctx, policy, Phase::ResponseBody, body_data(response.body()))
            .await
    }

    /// Phase 7: audit only, runs at most once per context
    pub async fn run_logging(&self, ctx: &mut EvaluationContext<E>) {
        if ctx.cursor() == Some(Phase::Logging) {
            debug!("Logging phase already ran");
            return;
        }

        match ctx.evaluate(Phase::Logging).await {
            Ok(EvaluationOutcome::Continue) => {}
            Ok(EvaluationOutcome::Interrupt { reason, .. }) => {
                debug!("Ignoring interruption from logging phase: {}", reason);
            }
            Ok(EvaluationOutcome::Error { detail }) => {
                warn!("Logging phase failed: {}", detail);
            }
            Err(e) => warn!("Logging phase failed: {}", e),
        }

        ctx.complete(Phase::Logging);
    }

    async fn run_phase(
        &self,
        ctx: &mut EvaluationContext<E>,
        policy: &mut InterruptionPolicy,
        phase: Phase,
        data: PhaseData,
    ) -> PolicyState {
        if !policy.may_evaluate(phase) {
            return policy.state();
        }

        if let Err(e) = ctx.record(phase, data) {
            warn!(%phase, "Failed to record phase data: {}", e);
        }

        debug!(%phase, "Evaluating phase");
        let result = ctx.evaluate(phase).await;
        let state = policy.observe(ctx, phase, result);
        ctx.complete(phase);
        state
    }
}

fn body_data(body: &Bytes) -> PhaseData {
    if body.is_empty() {
        PhaseData::Empty
    } else {
        PhaseData::BodyChunk(body.clone())
    }
}

/// Header pairs in map order, one entry per value
///
/// `HeaderMap` keeps names in first-arrival order with every value of a
/// repeated name grouped under it, so interleaved duplicates come out
/// adjacent rather than in wire order.
pub fn header_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

/// Requested host without port, from the URI authority or the Host header
fn request_host(parts: &Parts) -> Option<String> {
    parts
        .uri
        .host()
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .and_then(|h| h.split(':').next())
        })
        .map(str::to_string)
}

fn format_http_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}
