//! Startup orchestration.
//!
//! # Responsibilities
//! - Load TLS credentials before any socket is touched
//! - Adopt the inherited listener, or bind a fresh one
//! - Attach TLS to the listener
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and returned to the caller

use crate::config::ListenerConfig;
use crate::http::ServerError;
use crate::net::{load_tls_config, Listener};

/// Build the listener described by `config`.
pub async fn bootstrap_listener(config: &ListenerConfig) -> Result<Listener, ServerError> {
    let tls = match &config.tls {
        Some(tls) => Some(load_tls_config(&tls.cert_path, &tls.key_path)?),
        None => None,
    };

    let timeout = config.accept_timeout();
    let listener = match config.inherited_fd {
        Some(fd) => Listener::adopt(fd, timeout)?,
        None => Listener::bind(&config.bind_address, timeout).await?,
    };

    Ok(match tls {
        Some(tls) => listener.with_tls(tls),
        None => listener,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsConfig;
    use std::os::fd::IntoRawFd;
    use std::time::Duration;

    fn config(bind_address: &str) -> ListenerConfig {
        ListenerConfig {
            bind_address: bind_address.to_string(),
            accept_timeout_ms: 50,
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn binds_fresh_listener() {
        let listener = bootstrap_listener(&config("127.0.0.1:0")).await.unwrap();
        assert_ne!(listener.port(), 0);
        assert_eq!(listener.accept_timeout(), Duration::from_millis(50));
        assert!(!listener.is_tls());
    }

    #[tokio::test]
    async fn inherited_fd_wins_over_address() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = std_listener.local_addr().unwrap().port();

        let mut config = config("address-that-would-not-resolve");
        config.inherited_fd = Some(std_listener.into_raw_fd());

        let listener = bootstrap_listener(&config).await.unwrap();
        assert_eq!(listener.port(), port);
    }

    #[tokio::test]
    async fn bad_credentials_fail_before_binding() {
        let mut config = config("127.0.0.1:0");
        config.tls = Some(TlsConfig {
            cert_path: "/nonexistent/cert.pem".into(),
            key_path: "/nonexistent/key.pem".into(),
        });
        let err = bootstrap_listener(&config).await.unwrap_err();
        assert!(matches!(err, ServerError::Tls(_)));
    }
}
