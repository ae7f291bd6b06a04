// src/inspection/context.rs
//! Per-exchange evaluation context
//!
//! Holds every fact observed about one exchange, the interruption record and
//! the rule engine session. Facts are append-only; once an interruption is
//! recorded the request/response data is sealed and the record itself is
//! never cleared.

use crate::inspection::engine::{EvaluationOutcome, RuleEngine};
use crate::inspection::phase::Phase;
use crate::utils::errors::{InspectorError, Result};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, warn};
use ulid::Ulid;

/// Bounded capture of a message body
#[derive(Debug, Clone, Default, Serialize)]
pub struct BodyCapture {
    #[serde(skip)]
    data: BytesMut,

    /// Maximum bytes retained
    limit: usize,

    /// Bytes observed, including those beyond the limit
    total_len: usize,
}

impl BodyCapture {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: BytesMut::new(),
            limit,
            total_len: 0,
        }
    }

    /// Append a chunk, retaining at most `limit` bytes overall
    pub fn append(&mut self, chunk: &[u8]) {
        self.total_len += chunk.len();
        let room = self.limit.saturating_sub(self.data.len());
        let take = room.min(chunk.len());
        self.data.extend_from_slice(&chunk[..take]);
    }

    /// Captured bytes
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn is_truncated(&self) -> bool {
        self.total_len > self.data.len()
    }
}

/// Body capture bounds for one exchange
#[derive(Debug, Clone, Copy)]
pub struct CaptureLimits {
    pub request_body: usize,
    pub response_body: usize,
}

impl Default for CaptureLimits {
    fn default() -> Self {
        Self {
            request_body: 128 * 1024,
            response_body: 512 * 1024,
        }
    }
}

/// Everything observed about an exchange so far
///
/// This is the snapshot handed to [`RuleEngine::evaluate`].
#[derive(Debug, Clone, Serialize)]
pub struct Facts {
    pub exchange_id: Ulid,
    pub client_addr: Option<SocketAddr>,
    pub secure: bool,
    pub host: Option<String>,
    pub method: Option<String>,
    pub uri: Option<String>,
    pub protocol: Option<String>,

    /// Request headers in arrival order; repeated names keep separate entries
    pub request_headers: Vec<(String, String)>,
    pub request_body: BodyCapture,
    pub response_status: Option<u16>,
    pub response_headers: Vec<(String, String)>,
    pub response_body: BodyCapture,
}

impl Facts {
    pub fn new(limits: CaptureLimits) -> Self {
        Self {
            exchange_id: Ulid::new(),
            client_addr: None,
            secure: false,
            host: None,
            method: None,
            uri: None,
            protocol: None,
            request_headers: Vec::new(),
            request_body: BodyCapture::with_limit(limits.request_body),
            response_status: None,
            response_headers: Vec::new(),
            response_body: BodyCapture::with_limit(limits.response_body),
        }
    }

    /// All values of a request header, case-insensitive, in arrival order
    pub fn request_header_values<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.request_headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of a response header, case-insensitive, in arrival order
    pub fn response_header_values<'a, 'n>(
        &'a self,
        name: &'n str,
    ) -> impl Iterator<Item = &'a str> + 'n
    where
        'a: 'n,
    {
        self.response_headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Query component of the recorded URI
    pub fn query_string(&self) -> Option<&str> {
        self.uri
            .as_deref()
            .and_then(|uri| uri.split_once('?'))
            .map(|(_, query)| query)
    }
}

/// Data observed during one phase
#[derive(Debug, Clone)]
pub enum PhaseData {
    Connection {
        client_addr: SocketAddr,
        host: Option<String>,
        secure: bool,
    },
    RequestLine {
        method: String,
        uri: String,
        protocol: String,
    },
    Headers(Vec<(String, String)>),
    BodyChunk(Bytes),
    ResponseHead {
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// Phase ran with nothing to record
    Empty,
}

/// Why an exchange was blocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interruption {
    pub phase: Phase,
    pub status: Option<u16>,
    pub reason: String,
    pub rule_id: Option<String>,
}

/// Owns a rule engine session and guarantees it is ended exactly once
///
/// Dropping the guard without calling [`SessionGuard::release`] (e.g. when
/// the client disconnects and the exchange task is cancelled) still ends
/// the session.
pub struct SessionGuard<E: RuleEngine> {
    engine: Arc<E>,
    session: Option<E::Session>,
}

impl<E: RuleEngine> SessionGuard<E> {
    pub fn begin(engine: Arc<E>) -> Self {
        let session = engine.begin_session();
        Self {
            engine,
            session: Some(session),
        }
    }

    pub fn is_released(&self) -> bool {
        self.session.is_none()
    }

    /// End the session; later calls are no-ops returning `Ok`
    pub fn release(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => self.engine.end_session(session),
            None => Ok(()),
        }
    }
}

impl<E: RuleEngine> Drop for SessionGuard<E> {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("Rule engine session released on drop");
            if let Err(e) = self.release() {
                error!("Failed to release rule engine session: {}", e);
                metrics::counter!(crate::observability::SESSION_RELEASE_FAILURES_TOTAL)
                    .increment(1);
            }
        }
    }
}

/// Per-exchange evaluation context
pub struct EvaluationContext<E: RuleEngine> {
    facts: Facts,
    interruption: Option<Interruption>,
    cursor: Option<Phase>,
    session: SessionGuard<E>,
}

impl<E: RuleEngine> EvaluationContext<E> {
    /// Fresh context with its own engine session
    pub fn create(engine: Arc<E>, limits: CaptureLimits) -> Self {
        let facts = Facts::new(limits);
        debug!(exchange_id = %facts.exchange_id, "Evaluation context created");

        Self {
            facts,
            interruption: None,
            cursor: None,
            session: SessionGuard::begin(engine),
        }
    }

    pub fn exchange_id(&self) -> Ulid {
        self.facts.exchange_id
    }

    pub fn facts(&self) -> &Facts {
        &self.facts
    }

    /// Append facts observed during `phase`
    ///
    /// Single-valued facts that are already set are left untouched.
    pub fn record(&mut self, phase: Phase, data: PhaseData) -> Result<()> {
        if self.interruption.is_some() {
            return Err(InspectorError::ContextSealed);
        }

        let facts = &mut self.facts;
        match data {
            PhaseData::Connection {
                client_addr,
                host,
                secure,
            } => {
                if facts.client_addr.is_none() {
                    facts.client_addr = Some(client_addr);
                    facts.host = host;
                    facts.secure = secure;
                } else {
                    debug!(%phase, "Connection facts already recorded");
                }
            }
            PhaseData::RequestLine {
                method,
                uri,
                protocol,
            } => {
                if facts.method.is_none() {
                    facts.method = Some(method);
                    facts.uri = Some(uri);
                    facts.protocol = Some(protocol);
                } else {
                    debug!(%phase, "Request line already recorded");
                }
            }
            PhaseData::Headers(headers) => {
                if phase.is_response() {
                    facts.response_headers.extend(headers);
                } else {
                    facts.request_headers.extend(headers);
                }
            }
            PhaseData::BodyChunk(chunk) => {
                if phase.is_response() {
                    facts.response_body.append(&chunk);
                } else {
                    facts.request_body.append(&chunk);
                }
            }
            PhaseData::ResponseHead { status, headers } => {
                if facts.response_status.is_none() {
                    facts.response_status = Some(status);
                }
                facts.response_headers.extend(headers);
            }
            PhaseData::Empty => {}
        }

        Ok(())
    }

    /// Ask the engine to evaluate `phase` against the facts recorded so far
    pub async fn evaluate(&mut self, phase: Phase) -> Result<EvaluationOutcome> {
        let engine = Arc::clone(&self.session.engine);
        let session = self.session.session.as_mut().ok_or_else(|| {
            InspectorError::EngineEvaluation("session already released".to_string())
        })?;

        engine.evaluate(session, phase, &self.facts).await
    }

    /// Record an interruption; returns `false` if one was already set
    pub fn interrupt(
        &mut self,
        phase: Phase,
        status: Option<u16>,
        reason: impl Into<String>,
        rule_id: Option<String>,
    ) -> bool {
        if self.interruption.is_some() {
            return false;
        }

        self.interruption = Some(Interruption {
            phase,
            status,
            reason: reason.into(),
            rule_id,
        });
        true
    }

    pub fn is_interrupted(&self) -> bool {
        self.interruption.is_some()
    }

    pub fn interruption(&self) -> Option<&Interruption> {
        self.interruption.as_ref()
    }

    /// Mark `phase` as finished; the cursor only moves forward
    pub fn complete(&mut self, phase: Phase) {
        match self.cursor {
            Some(last) if last >= phase => {
                warn!(%phase, %last, "Phase completed out of order");
            }
            _ => self.cursor = Some(phase),
        }
    }

    /// Last completed phase
    pub fn cursor(&self) -> Option<Phase> {
        self.cursor
    }

    /// End the engine session; safe to call more than once
    pub fn release(&mut self) -> Result<()> {
        self.session.release()
    }

    pub fn is_released(&self) -> bool {
        self.session.is_released()
    }
}
