//! Configuration schema definitions.
//!
//! Server entries keep every field optional and `port` as a raw TOML value;
//! `validation.rs` turns them into typed options.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for a helper instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HelperConfig {
    /// Rendezvous path of the socket broker. Falls back to
    /// `LISTENKIT_BROKER_PATH` when unset.
    pub broker_path: Option<PathBuf>,

    /// How long shutdown waits for connections to finish closing.
    pub drain_timeout_secs: u64,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Servers to create at startup.
    pub servers: Vec<ServerConfig>,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            broker_path: None,
            drain_timeout_secs: 5,
            observability: ObservabilityConfig::default(),
            servers: Vec::new(),
        }
    }
}

/// One server entry, as written by the user.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Symbolic name, unique per helper instance.
    pub title: Option<String>,

    /// Kept as a raw value so strings and floats can be rejected explicitly.
    pub port: Option<toml::Value>,

    /// One of `tcp`, `udp`, `tls`, `unix`. Defaults to `tcp`.
    pub protocol: Option<String>,

    /// IP literal, or the socket path for `unix`.
    pub bind: Option<String>,

    pub shared: Option<bool>,
    pub resolve_name: Option<bool>,

    /// Stream only.
    pub backlog: Option<u32>,

    /// Stream only, in seconds.
    pub linger_timeout: Option<u64>,

    /// UDP only.
    pub max_bytes: Option<usize>,

    /// UDP only, e.g. `["broadcast"]`.
    pub flags: Option<Vec<String>>,

    /// TLS only.
    pub certopts: Option<CertConfig>,
}

/// TLS certificate locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Path to private key (PEM).
    pub private_key_path: PathBuf,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus endpoint.
    pub metrics_enabled: bool,

    /// Prometheus endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
