// src/main.rs
//! Inspector Gate
//!
//! Reverse proxy that inspects every exchange against a directive rule set
//! before letting it reach the backend.
//!
//! Usage: `inspector-gate [CONFIG_FILE]`

use anyhow::Result;
use inspector_gate::observability::{init_metrics, init_tracing};
use inspector_gate::{DirectiveEngine, HttpForwarder, Inspector, InspectorConfig, InspectorServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = InspectorConfig::load_from(config_path.as_deref())?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Inspector Gate v{}", env!("CARGO_PKG_VERSION"));

    // Rule set is compiled once and shared read-only by all exchanges
    let directives = config.resolved_directives()?;
    let engine = Arc::new(DirectiveEngine::from_directives(&directives)?);

    let forwarder = Arc::new(HttpForwarder::new(&config.backend)?);
    info!("Forwarding inspected traffic to {}", config.backend.url);

    let inspector = Arc::new(Inspector::new(engine, forwarder, &config.inspection));
    let server = InspectorServer::new(inspector, config.server.trust_forwarded_proto);

    let listener = TcpListener::bind(config.listen_addr()?).await?;

    // Graceful shutdown handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install CTRL+C signal handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    match server.serve_with_shutdown(listener, shutdown_signal).await {
        Ok(()) => {
            info!("Server stopped gracefully");
            Ok(())
        }
        Err(e) => {
            error!("Server error: {}", e);
            Err(e.into())
        }
    }
}
