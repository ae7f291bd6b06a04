// src/proxy/forwarder.rs
//! Backend forwarding
//!
//! Sends an inspected request to the single configured backend and buffers
//! its response. Hop-by-hop headers are stripped in both directions and the
//! inbound `Host` header is kept.

use crate::inspection::pipeline::ConnectionMeta;
use crate::utils::config::BackendConfig;
use crate::utils::errors::{InspectorError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::header::{HeaderName, HeaderValue, CONNECTION};
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

// RFC 7230 Section 6.1: hop-by-hop headers are not forwarded.
static HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Reverse-proxy capability the inspector wraps
#[async_trait]
pub trait Forwarder: Send + Sync + 'static {
    /// Deliver `req` to the backend and return its buffered response
    async fn forward(&self, req: Request<Bytes>) -> Result<Response<Bytes>>;
}

/// Forwarder backed by a pooled hyper client
pub struct HttpForwarder {
    base: Uri,
    request_timeout: Duration,
    max_response_body: usize,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpForwarder {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base: Uri = config.url.parse().map_err(|e| {
            InspectorError::ConfigError(format!("Invalid backend url {:?}: {}", config.url, e))
        })?;
        if base.authority().is_none() {
            return Err(InspectorError::ConfigError(format!(
                "Backend url {:?} has no host",
                config.url
            )));
        }

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_millis(config.connect_timeout_ms)));

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Ok(Self {
            base,
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            max_response_body: config.max_response_body,
            client,
        })
    }

    /// Backend URI for an inbound request URI
    fn target_uri(&self, inbound: &Uri) -> Result<Uri> {
        let path_and_query = inbound
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let prefix = self.base.path().trim_end_matches('/');
        let scheme = self.base.scheme_str().unwrap_or("http");
        let authority = self
            .base
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();

        format!("{}://{}{}{}", scheme, authority, prefix, path_and_query)
            .parse()
            .map_err(|e| InspectorError::Forwarding(format!("Request build error: {}", e)))
    }

    async fn send(&self, req: Request<Full<Bytes>>) -> Result<Response<Bytes>> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| InspectorError::Forwarding(format!("Backend request failed: {}", e)))?;

        let (mut parts, body) = response.into_parts();
        let body = Limited::new(body, self.max_response_body)
            .collect()
            .await
            .map_err(|e| {
                if e.is::<LengthLimitError>() {
                    InspectorError::Forwarding(format!(
                        "Backend response exceeds {} bytes",
                        self.max_response_body
                    ))
                } else {
                    InspectorError::Forwarding(format!("Response body error: {}", e))
                }
            })?
            .to_bytes();

        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body))
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, req: Request<Bytes>) -> Result<Response<Bytes>> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.target_uri(&parts.uri)?;
        strip_hop_by_hop(&mut parts.headers);

        if let Some(conn) = parts.extensions.get::<ConnectionMeta>() {
            append_forwarded_for(&mut parts.headers, conn);
        }

        debug!("Forwarding {} {}", parts.method, parts.uri);
        let upstream = Request::from_parts(parts, Full::new(body));

        match tokio::time::timeout(self.request_timeout, self.send(upstream)).await {
            Ok(result) => result,
            Err(_) => Err(InspectorError::ForwardingTimeout(
                self.request_timeout.as_millis() as u64,
            )),
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, conn: &ConnectionMeta) {
    let client_ip = conn.client_addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, client_ip),
        None => client_ip,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
