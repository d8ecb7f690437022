//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for a conveyor server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ConveyorConfig {
    /// Listener configuration (bind address, inherited socket, TLS).
    pub listener: ListenerConfig,

    /// Per-connection buffering and limits.
    pub connection: ConnectionConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Log-identifying prefix. Defaults to the process id.
    pub log_prefix: Option<String>,
}

impl ConveyorConfig {
    /// The prefix attached to every log line of this server instance.
    pub fn log_prefix(&self) -> String {
        self.log_prefix
            .clone()
            .unwrap_or_else(|| std::process::id().to_string())
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., ":8080" or "127.0.0.1:8080").
    pub bind_address: String,

    /// Already-open listening descriptor to adopt instead of binding.
    pub inherited_fd: Option<RawFd>,

    /// How long a single accept waits before the loop re-checks for shutdown.
    pub accept_timeout_ms: u64,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl ListenerConfig {
    pub fn accept_timeout(&self) -> Duration {
        Duration::from_millis(self.accept_timeout_ms)
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: ":8080".to_string(),
            inherited_fd: None,
            accept_timeout_ms: 3_000,
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: PathBuf,

    /// Path to private key file (PEM).
    pub key_path: PathBuf,
}

/// Connection handling configuration.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Size of the per-connection read buffer in bytes.
    pub read_buffer_size: usize,

    /// Largest request line + header block accepted.
    pub max_head_bytes: usize,

    /// Largest decoded request body accepted.
    pub max_body_bytes: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 8 * 1024,
            max_head_bytes: 64 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter used when `RUST_LOG` is not set.
    pub log_filter: String,

    /// Enable the Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_filter: "conveyor=info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
