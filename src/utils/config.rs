// src/utils/config.rs
//! Inspector configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then `INSPECTOR_*` environment variables
//! (e.g. `INSPECTOR_BACKEND__URL=http://10.0.0.5:8080`).

use crate::utils::errors::{InspectorError, Result};
use config::{Config, Environment, File};
use hyper::Uri;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directives used when neither inline text nor a file is configured
pub const DEFAULT_DIRECTIVES: &str = r#"
SecRuleEngine On
SecRequestBodyAccess On
SecResponseBodyAccess On
SecRule REQUEST_URI "@contains /admin" "id:1,phase:1,deny,status:403,msg:'Admin access denied'"
"#;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectorConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub inspection: InspectionConfig,
    pub rules: RulesConfig,
    pub observability: ObservabilityConfig,
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,

    /// Honour `X-Forwarded-Proto: https` from a TLS-terminating front proxy
    pub trust_forwarded_proto: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            trust_forwarded_proto: false,
        }
    }
}

/// Backend the inspected traffic is forwarded to
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,

    /// Largest backend response body buffered before answering 502
    pub max_response_body: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8089".to_string(),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 30_000,
            max_response_body: 8 * 1024 * 1024,
        }
    }
}

/// Inspection policy knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InspectionConfig {
    /// Maximum request body bytes captured for evaluation
    pub request_body_limit: usize,

    /// Maximum response body bytes captured for evaluation
    pub response_body_limit: usize,

    /// Largest request body buffered before answering 413
    pub max_request_body: usize,

    /// Run the advisory response phases after forwarding
    pub response_inspection: bool,

    /// Status used when the engine interrupts without one
    pub blocked_status: u16,
}

impl Default for InspectionConfig {
    fn default() -> Self {
        Self {
            request_body_limit: 128 * 1024,
            response_body_limit: 512 * 1024,
            max_request_body: 8 * 1024 * 1024,
            response_inspection: true,
            blocked_status: 403,
        }
    }
}

/// Rule set source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Inline directive text
    pub directives: Option<String>,

    /// Path to a directive file, takes precedence over inline text
    pub directives_file: Option<PathBuf>,
}

/// Logging and metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,

    /// `pretty` or `json`
    pub log_format: String,

    /// Prometheus scrape endpoint; metrics are disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_addr: None,
        }
    }
}

impl InspectorConfig {
    /// Load from `./inspector.toml` (optional) and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit file (required when given) and the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("inspector").required(false),
        };

        let config: InspectorConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("INSPECTOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        debug!("Configuration validated");
        Ok(config)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.backend_uri()?;

        if self.inspection.request_body_limit == 0 || self.inspection.response_body_limit == 0 {
            return Err(InspectorError::ConfigError(
                "body capture limits must be greater than zero".to_string(),
            ));
        }

        if self.inspection.max_request_body < self.inspection.request_body_limit {
            return Err(InspectorError::ConfigError(format!(
                "max_request_body {} is below request_body_limit {}",
                self.inspection.max_request_body, self.inspection.request_body_limit
            )));
        }

        if self.backend.max_response_body < self.inspection.response_body_limit {
            return Err(InspectorError::ConfigError(format!(
                "max_response_body {} is below response_body_limit {}",
                self.backend.max_response_body, self.inspection.response_body_limit
            )));
        }

        if !(400..=599).contains(&self.inspection.blocked_status) {
            return Err(InspectorError::ConfigError(format!(
                "blocked_status {} is not a 4xx/5xx code",
                self.inspection.blocked_status
            )));
        }

        Ok(())
    }

    /// Socket address the server listens on
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| InspectorError::ConfigError(format!("Invalid listen address: {}", e)))
    }

    /// Parsed backend base URI
    pub fn backend_uri(&self) -> Result<Uri> {
        let uri: Uri = self.backend.url.parse().map_err(|e| {
            InspectorError::ConfigError(format!("Invalid backend url {:?}: {}", self.backend.url, e))
        })?;

        match (uri.scheme_str(), uri.authority()) {
            (Some("http"), Some(_)) => Ok(uri),
            _ => Err(InspectorError::ConfigError(format!(
                "backend url must be an absolute http:// url, got {:?}",
                self.backend.url
            ))),
        }
    }

    /// Directive text to compile, read from disk if a file is configured
    pub fn resolved_directives(&self) -> Result<String> {
        if let Some(path) = &self.rules.directives_file {
            return std::fs::read_to_string(path).map_err(|e| {
                InspectorError::ConfigError(format!(
                    "Failed to read directives file {}: {}",
                    path.display(),
                    e
                ))
            });
        }

        Ok(self
            .rules
            .directives
            .clone()
            .unwrap_or_else(|| DEFAULT_DIRECTIVES.to_string()))
    }
}
