// src/inspection/middleware.rs
//! Intercepting middleware
//!
//! Composes the phase pipeline, the interruption policy and a forwarder into
//! a single `handle(request) -> response` operation. Whatever happens inside
//! an exchange, the logging phase runs once and the engine session is
//! released before `handle` returns; no error escapes it.

use crate::inspection::context::{CaptureLimits, EvaluationContext};
use crate::inspection::engine::RuleEngine;
use crate::inspection::pipeline::{ConnectionMeta, PhasePipeline, PipelineConfig};
use crate::inspection::policy::{InterruptionPolicy, PolicyState};
use crate::observability::{
    EXCHANGES_TOTAL, EXCHANGE_DURATION_SECONDS, FORWARDING_ERRORS_TOTAL,
    SESSION_RELEASE_FAILURES_TOTAL,
};
use crate::proxy::forwarder::Forwarder;
use crate::utils::config::InspectionConfig;
use crate::utils::errors::InspectorError;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::{Request, Response, StatusCode};
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info_span, warn, Instrument};

/// How an exchange ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Forwarded,
    Interrupted,
    EngineError,
    ForwardingError,
    BadRequest,
    PayloadTooLarge,
}

impl ExchangeOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeOutcome::Forwarded => "forwarded",
            ExchangeOutcome::Interrupted => "interrupted",
            ExchangeOutcome::EngineError => "engine_error",
            ExchangeOutcome::ForwardingError => "forwarding_error",
            ExchangeOutcome::BadRequest => "bad_request",
            ExchangeOutcome::PayloadTooLarge => "payload_too_large",
        }
    }
}

/// Inspecting reverse-proxy handler
pub struct Inspector<E: RuleEngine, F: Forwarder> {
    pipeline: PhasePipeline<E>,
    forwarder: Arc<F>,
    blocked_status: StatusCode,
    max_request_body: usize,
}

impl<E: RuleEngine, F: Forwarder> Inspector<E, F> {
    pub fn new(engine: Arc<E>, forwarder: Arc<F>, config: &InspectionConfig) -> Self {
        let pipeline = PhasePipeline::new(
            engine,
            PipelineConfig {
                limits: CaptureLimits {
                    request_body: config.request_body_limit,
                    response_body: config.response_body_limit,
                },
                response_inspection: config.response_inspection,
            },
        );
        let blocked_status =
            StatusCode::from_u16(config.blocked_status).unwrap_or(StatusCode::FORBIDDEN);

        Self {
            pipeline,
            forwarder,
            blocked_status,
            max_request_body: config.max_request_body,
        }
    }

    /// Inspect one exchange and produce the response for the client
    pub async fn handle<B>(&self, conn: ConnectionMeta, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let started = Instant::now();
        let mut ctx = self.pipeline.begin();
        let span = info_span!(
            "exchange",
            exchange_id = %ctx.exchange_id(),
            client = %conn.client_addr,
            method = %req.method(),
            uri = %req.uri(),
        );

        async move {
            let mut policy = InterruptionPolicy::new();
            let (response, outcome) = self.drive(&mut ctx, &mut policy, conn, req).await;

            self.pipeline.run_logging(&mut ctx).await;
            if let Err(e) = ctx.release() {
                error!("Failed to release rule engine session: {}", e);
                metrics::counter!(SESSION_RELEASE_FAILURES_TOTAL).increment(1);
            }

            metrics::counter!(EXCHANGES_TOTAL, "outcome" => outcome.as_str()).increment(1);
            metrics::histogram!(EXCHANGE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
            response
        }
        .instrument(span)
        .await
    }

    async fn drive<B>(
        &self,
        ctx: &mut EvaluationContext<E>,
        policy: &mut InterruptionPolicy,
        conn: ConnectionMeta,
        req: Request<B>,
    ) -> (Response<Full<Bytes>>, ExchangeOutcome)
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();

        if self
            .pipeline
            .run_head_phases(ctx, policy, &conn, &parts)
            .await
            .is_terminal()
        {
            return self.halted(ctx, policy);
        }

        let body = match Limited::new(body, self.max_request_body).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                let err = InspectorError::PayloadTooLarge(self.max_request_body);
                warn!("Rejecting request body: {}", err);
                let status = err.status_code();
                return (
                    plain_response(status, &status_line(status)),
                    ExchangeOutcome::PayloadTooLarge,
                );
            }
            Err(e) => {
                warn!("Failed to read request body: {}", e);
                return (
                    plain_response(StatusCode::BAD_REQUEST, "400 Bad Request"),
                    ExchangeOutcome::BadRequest,
                );
            }
        };

        if self
            .pipeline
            .run_body_phase(ctx, policy, &body)
            .await
            .is_terminal()
        {
            return self.halted(ctx, policy);
        }

        parts.extensions.insert(conn);
        let response = match self.forwarder.forward(Request::from_parts(parts, body)).await {
            Ok(response) => response,
            Err(e) => {
                error!("Forwarding failed: {}", e);
                metrics::counter!(FORWARDING_ERRORS_TOTAL).increment(1);
                let status = e.status_code();
                return (
                    plain_response(status, &status_line(status)),
                    ExchangeOutcome::ForwardingError,
                );
            }
        };

        let state = self.pipeline.run_response_phases(ctx, policy, &response).await;
        if state != PolicyState::Running {
            warn!("Response matched after forwarding; delivered unchanged");
        }

        let (parts, body) = response.into_parts();
        (
            Response::from_parts(parts, Full::new(body)),
            ExchangeOutcome::Forwarded,
        )
    }

    /// Response for an exchange stopped before forwarding
    fn halted(
        &self,
        ctx: &EvaluationContext<E>,
        policy: &InterruptionPolicy,
    ) -> (Response<Full<Bytes>>, ExchangeOutcome) {
        match policy.state() {
            PolicyState::Interrupted => {
                let status = ctx
                    .interruption()
                    .and_then(|i| i.status)
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(self.blocked_status);
                let message = format!("{} - Request blocked", status_line(status));
                (plain_response(status, &message), ExchangeOutcome::Interrupted)
            }
            _ => (
                plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &status_line(StatusCode::INTERNAL_SERVER_ERROR),
                ),
                ExchangeOutcome::EngineError,
            ),
        }
    }
}

fn status_line(status: StatusCode) -> String {
    format!(
        "{} {}",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Error")
    )
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspection::engine::EvaluationOutcome;
    use crate::inspection::phase::Phase;
    use crate::inspection::test_support::ScriptedEngine;
    use crate::utils::errors::{InspectorError, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Forwarder that echoes a fixed response and remembers what it saw
    #[derive(Default)]
    struct RecordingForwarder {
        fail_with: Option<fn() -> InspectorError>,
        seen: Mutex<Vec<Request<Bytes>>>,
    }

    impl RecordingForwarder {
        fn failing(make: fn() -> InspectorError) -> Self {
            Self {
                fail_with: Some(make),
                ..Default::default()
            }
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl Forwarder for RecordingForwarder {
        async fn forward(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
            self.seen.lock().push(req);
            if let Some(make) = self.fail_with {
                return Err(make());
            }
            Ok(Response::builder()
                .status(200)
                .header("x-backend", "yes")
                .body(Bytes::from_static(b"backend says hi"))
                .unwrap())
        }
    }

    /// Forwarder whose backend never answers
    struct StalledForwarder;

    #[async_trait]
    impl Forwarder for StalledForwarder {
        async fn forward(&self, _req: Request<Bytes>) -> Result<Response<Bytes>> {
            std::future::pending().await
        }
    }

    fn build(
        engine: ScriptedEngine,
        forwarder: RecordingForwarder,
    ) -> (
        Arc<ScriptedEngine>,
        Arc<RecordingForwarder>,
        Inspector<ScriptedEngine, RecordingForwarder>,
    ) {
        let engine = Arc::new(engine);
        let forwarder = Arc::new(forwarder);
        let inspector = Inspector::new(
            Arc::clone(&engine),
            Arc::clone(&forwarder),
            &InspectionConfig::default(),
        );
        (engine, forwarder, inspector)
    }

    fn conn() -> ConnectionMeta {
        ConnectionMeta::new("127.0.0.1:40123".parse().unwrap(), false)
    }

    fn request(uri: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("host", "app.local")
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_clean_exchange_is_forwarded_once() {
        let (engine, forwarder, inspector) =
            build(ScriptedEngine::new(), RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/ok", "hello")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-backend"], "yes");
        assert_eq!(body_text(response).await, "backend says hi");
        assert_eq!(forwarder.calls(), 1);
        assert_eq!(engine.evaluated(), Phase::ALL.to_vec());
        assert_eq!(engine.count(Phase::Logging), 1);
        assert_eq!(engine.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_forwarded_request_keeps_body_and_connection() {
        let (_, forwarder, inspector) =
            build(ScriptedEngine::new(), RecordingForwarder::default());

        inspector.handle(conn(), request("/submit?x=1", "payload")).await;

        let seen = forwarder.seen.lock();
        assert_eq!(seen[0].uri(), "/submit?x=1");
        assert_eq!(seen[0].body().as_ref(), b"payload");
        assert_eq!(seen[0].extensions().get::<ConnectionMeta>(), Some(&conn()));
    }

    #[tokio::test]
    async fn test_interrupt_blocks_with_recorded_status() {
        let engine = ScriptedEngine::new().on(
            Phase::RequestUri,
            EvaluationOutcome::interrupt(451, "Admin access denied", "1"),
        );
        let (engine, forwarder, inspector) = build(engine, RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/admin", "")).await;

        assert_eq!(response.status().as_u16(), 451);
        let text = body_text(response).await;
        assert!(text.contains("Request blocked"));
        assert!(!text.contains("Admin access denied"));
        assert_eq!(forwarder.calls(), 0);
        assert_eq!(engine.count(Phase::Logging), 1);
        assert_eq!(engine.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_without_status_uses_default() {
        let engine = ScriptedEngine::new().on(
            Phase::RequestBody,
            EvaluationOutcome::Interrupt {
                status: None,
                reason: "bad body".to_string(),
                rule_id: None,
            },
        );
        let (_, forwarder, inspector) = build(engine, RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/", "evil")).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(forwarder.calls(), 0);
    }

    #[tokio::test]
    async fn test_engine_failure_fails_closed() {
        let engine = ScriptedEngine::new().failing_on(Phase::RequestHeaders, "parser crashed");
        let (engine, forwarder, inspector) = build(engine, RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/", "")).await;

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body_text(response).await.contains("parser crashed"));
        assert_eq!(forwarder.calls(), 0);
        assert_eq!(engine.count(Phase::Logging), 1);
        assert_eq!(engine.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_error_outcome_fails_closed() {
        let engine = ScriptedEngine::new()
            .on(Phase::Connection, EvaluationOutcome::error("bad address"));
        let (_, forwarder, inspector) = build(engine, RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/", "")).await;

        assert!(response.status().is_server_error());
        assert_eq!(forwarder.calls(), 0);
    }

    #[tokio::test]
    async fn test_forwarding_failure_still_logs_and_releases() {
        let forwarder = RecordingForwarder::failing(|| InspectorError::Forwarding("refused".into()));
        let (engine, forwarder, inspector) = build(ScriptedEngine::new(), forwarder);

        let response = inspector.handle(conn(), request("/", "")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(forwarder.calls(), 1);
        assert_eq!(engine.count(Phase::Logging), 1);
        assert_eq!(engine.count(Phase::ResponseHeaders), 0);
        assert_eq!(engine.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_forwarding_timeout_is_gateway_timeout() {
        let forwarder = RecordingForwarder::failing(|| InspectorError::ForwardingTimeout(10));
        let (_, _, inspector) = build(ScriptedEngine::new(), forwarder);

        let response = inspector.handle(conn(), request("/", "")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_response_interrupt_is_advisory() {
        let engine = ScriptedEngine::new().on(
            Phase::ResponseHeaders,
            EvaluationOutcome::interrupt(403, "leaky header", "50"),
        );
        let (engine, forwarder, inspector) = build(engine, RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/", "")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "backend says hi");
        assert_eq!(forwarder.calls(), 1);
        assert_eq!(engine.count(Phase::ResponseBody), 0);
        assert_eq!(engine.count(Phase::Logging), 1);
    }

    #[tokio::test]
    async fn test_session_release_failure_is_not_fatal() {
        let engine = ScriptedEngine::new().failing_release();
        let (engine, _, inspector) = build(engine, RecordingForwarder::default());

        let response = inspector.handle(conn(), request("/", "")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(engine.sessions_ended(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_exchange_releases_session() {
        let engine = Arc::new(ScriptedEngine::new());
        let inspector = Inspector::new(
            Arc::clone(&engine),
            Arc::new(StalledForwarder),
            &InspectionConfig::default(),
        );

        {
            let fut = inspector.handle(conn(), request("/", ""));
            tokio::pin!(fut);
            // Runs up to the stalled forward, then the client goes away.
            assert!(futures::poll!(fut.as_mut()).is_pending());
        }

        assert_eq!(engine.sessions_begun(), 1);
        assert_eq!(engine.sessions_ended(), 1);
        assert_eq!(engine.count(Phase::Logging), 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_before_forwarding() {
        let engine = Arc::new(ScriptedEngine::new());
        let forwarder = Arc::new(RecordingForwarder::default());
        let config = InspectionConfig {
            request_body_limit: 4,
            max_request_body: 16,
            ..Default::default()
        };
        let inspector = Inspector::new(Arc::clone(&engine), Arc::clone(&forwarder), &config);

        let response = inspector
            .handle(conn(), request("/upload", "0123456789abcdef-overflow"))
            .await;

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_text(response).await, "413 Payload Too Large\n");
        assert_eq!(forwarder.calls(), 0);
        assert_eq!(engine.count(Phase::RequestBody), 0);
        assert_eq!(engine.count(Phase::Logging), 1);
        assert_eq!(engine.sessions_ended(), 1);

        // At the ceiling is still accepted.
        let response = inspector
            .handle(conn(), request("/upload", "0123456789abcdef"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(forwarder.calls(), 1);
    }
}
