//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, buffers > 0)
//! - Check that the listener has a source (address or inherited descriptor)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ConveyorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ConveyorConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.bind_address is empty and no inherited_fd is set")]
    NoListenerSource,
    #[error("listener.inherited_fd must be non-negative, got {0}")]
    NegativeFd(i32),
    #[error("listener.accept_timeout_ms must be greater than zero")]
    ZeroAcceptTimeout,
    #[error("listener.tls.{0} is empty")]
    EmptyTlsPath(&'static str),
    #[error("connection.{0} must be greater than zero")]
    ZeroLimit(&'static str),
    #[error("observability.metrics_address {0:?} is not a socket address")]
    BadMetricsAddress(String),
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ConveyorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let listener = &config.listener;

    match listener.inherited_fd {
        Some(fd) if fd < 0 => errors.push(ValidationError::NegativeFd(fd)),
        Some(_) => {}
        None if listener.bind_address.trim().is_empty() => {
            errors.push(ValidationError::NoListenerSource)
        }
        None => {}
    }

    if listener.accept_timeout_ms == 0 {
        errors.push(ValidationError::ZeroAcceptTimeout);
    }

    if let Some(tls) = &listener.tls {
        if tls.cert_path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("cert_path"));
        }
        if tls.key_path.as_os_str().is_empty() {
            errors.push(ValidationError::EmptyTlsPath("key_path"));
        }
    }

    let connection = &config.connection;
    for (name, value) in [
        ("read_buffer_size", connection.read_buffer_size),
        ("max_head_bytes", connection.max_head_bytes),
        ("max_body_bytes", connection.max_body_bytes),
    ] {
        if value == 0 {
            errors.push(ValidationError::ZeroLimit(name));
        }
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::BadMetricsAddress(
            observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
