// src/proxy/server.rs
//! Inspector HTTP server
//!
//! Accepts client connections and serves each one on its own task; every
//! request on a connection is handed to [`Inspector::handle`]. A failing
//! connection or exchange never stops the accept loop.

use crate::inspection::engine::RuleEngine;
use crate::inspection::middleware::Inspector;
use crate::inspection::pipeline::ConnectionMeta;
use crate::proxy::forwarder::Forwarder;
use crate::utils::errors::Result;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Accept loop in front of an [`Inspector`]
pub struct InspectorServer<E: RuleEngine, F: Forwarder> {
    inspector: Arc<Inspector<E, F>>,
    trust_forwarded_proto: bool,
}

impl<E: RuleEngine, F: Forwarder> InspectorServer<E, F> {
    pub fn new(inspector: Arc<Inspector<E, F>>, trust_forwarded_proto: bool) -> Self {
        Self {
            inspector,
            trust_forwarded_proto,
        }
    }

    /// Serve until the process exits
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending())
            .await
    }

    /// Serve until `shutdown` completes
    ///
    /// Connections already accepted finish on their own tasks.
    pub async fn serve_with_shutdown(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        info!("Inspector listening on {}", listener.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
        }
    }

    fn spawn_connection(&self, stream: tokio::net::TcpStream, addr: SocketAddr) {
        let inspector = Arc::clone(&self.inspector);
        let trust_forwarded_proto = self.trust_forwarded_proto;

        tokio::spawn(async move {
            debug!("Accepted connection from {}", addr);

            let io = TokioIo::new(stream);

            let service = service_fn(move |req: Request<Incoming>| {
                let inspector = Arc::clone(&inspector);
                async move {
                    let conn = ConnectionMeta::new(addr, is_secure(&req, trust_forwarded_proto));
                    Ok::<_, Infallible>(inspector.handle(conn, req).await)
                }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!("Connection from {} ended with error: {}", addr, e);
            }
        });
    }
}

/// TLS flag for a plain-TCP listener, optionally taken from a front proxy
fn is_secure<B>(req: &Request<B>, trust_forwarded_proto: bool) -> bool {
    trust_forwarded_proto
        && req
            .headers()
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().eq_ignore_ascii_case("https"))
            .unwrap_or(false)
}
