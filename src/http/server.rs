//! HTTP server setup and the graceful accept loop.
//!
//! # Responsibilities
//! - Own the listener (fresh bind, adopted descriptor, optional TLS)
//! - Accept connections and spawn one handler task per connection
//! - Signal readiness once the accept loop is running
//! - On shutdown: stop accepting, wait for every handler, then return
//!
//! # Lifecycle
//! ```text
//! idle ──serve()──▶ accepting ──stop_accepting()──▶ draining ──handlers == 0──▶ stopped
//! ```

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use crate::config::ConveyorConfig;
use crate::http::codec::CodecLimits;
use crate::http::handler::{self, HandlerContext};
use crate::lifecycle::{startup, Shutdown};
use crate::net::{load_tls_config, ConnectionTracker, Listener, ListenerError, TlsError};
use crate::observability::metrics;
use crate::pipeline::Pipeline;

/// Startup-fatal server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error(transparent)]
    Tls(#[from] TlsError),
    /// Rebinding is not supported once a listener is attached.
    #[error("server already has a listener")]
    AlreadyListening,
    #[error("server has no listener")]
    NotListening,
}

/// A connection-serving engine for one listener.
pub struct Server {
    config: ConveyorConfig,
    pipeline: Arc<dyn Pipeline>,
    listener: Option<Listener>,
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    log_prefix: Arc<str>,
    ready: watch::Sender<bool>,
}

impl Server {
    /// Create a server; no socket is opened until `listen` or `serve`.
    pub fn new(config: ConveyorConfig, pipeline: impl Pipeline) -> Self {
        let log_prefix = Arc::from(config.log_prefix());
        let (ready, _) = watch::channel(false);
        Self {
            config,
            pipeline: Arc::new(pipeline),
            listener: None,
            shutdown: Shutdown::new(),
            tracker: ConnectionTracker::new(),
            log_prefix,
            ready,
        }
    }

    /// Acquire the listener described by the configuration: adopt the
    /// inherited descriptor if one is set, bind otherwise, then wrap with
    /// TLS when configured.
    pub async fn listen(&mut self) -> Result<(), ServerError> {
        self.ensure_unbound()?;
        let listener = startup::bootstrap_listener(&self.config.listener).await?;
        self.attach(listener, "Listener ready");
        Ok(())
    }

    /// Bind a fresh listening socket to `address` (`":8080"` or `host:port`).
    pub async fn bind(&mut self, address: &str) -> Result<(), ServerError> {
        self.ensure_unbound()?;
        let listener = Listener::bind(address, self.config.listener.accept_timeout()).await?;
        self.attach(listener, "Listener bound");
        Ok(())
    }

    /// Adopt an open listening descriptor, typically inherited from the
    /// process this one replaces.
    ///
    /// Must be called inside a Tokio runtime. Ownership of `fd` follows
    /// [`Listener::adopt`]: a `NotAListener` error leaves it with the caller.
    pub fn adopt_fd(&mut self, fd: RawFd) -> Result<(), ServerError> {
        self.ensure_unbound()?;
        let listener = Listener::adopt(fd, self.config.listener.accept_timeout())?;
        self.attach(listener, "Adopted inherited listener");
        Ok(())
    }

    /// Terminate TLS on the current listener with the given key pair.
    pub fn enable_tls(&mut self, cert_path: &Path, key_path: &Path) -> Result<(), ServerError> {
        let listener = self.listener.take().ok_or(ServerError::NotListening)?;
        let tls = match load_tls_config(cert_path, key_path) {
            Ok(tls) => tls,
            Err(e) => {
                self.listener = Some(listener);
                return Err(e.into());
            }
        };
        info!(prefix = %self.log_prefix, cert = ?cert_path, "TLS enabled");
        self.listener = Some(listener.with_tls(tls));
        Ok(())
    }

    fn ensure_unbound(&self) -> Result<(), ServerError> {
        match self.listener {
            Some(_) => Err(ServerError::AlreadyListening),
            None => Ok(()),
        }
    }

    fn attach(&mut self, listener: Listener, message: &'static str) {
        info!(
            prefix = %self.log_prefix,
            address = %listener.local_addr(),
            fd = listener.as_raw_fd(),
            tls = listener.is_tls(),
            "{message}"
        );
        self.listener = Some(listener);
    }

    /// Raw listening descriptor, for handing the socket to a successor.
    pub fn socket_fd(&self) -> Option<RawFd> {
        self.listener.as_ref().map(|l| l.as_raw_fd())
    }

    /// Port in use, if listening.
    pub fn port(&self) -> Option<u16> {
        self.listener.as_ref().map(Listener::port)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(Listener::local_addr)
    }

    /// Prefix carried by every log event of this server.
    pub fn log_prefix(&self) -> &str {
        &self.log_prefix
    }

    /// A cloneable handle for stopping the server and observing it.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
            ready: self.ready.subscribe(),
        }
    }

    /// Stop accepting new connections; in-flight ones run to completion.
    pub fn stop_accepting(&self) {
        self.shutdown.trigger();
    }

    /// Run the accept loop until shutdown has been requested and every
    /// connection handler has exited.
    ///
    /// Listens first if no listener is attached. Only startup failures are
    /// returned; accept and connection errors are logged and contained.
    pub async fn serve(mut self) -> Result<(), ServerError> {
        if self.listener.is_none() {
            self.listen().await?;
        }
        let listener = self.listener.take().ok_or(ServerError::NotListening)?;

        let shared = Arc::new(HandlerContext {
            pipeline: Arc::clone(&self.pipeline),
            tls: listener.tls_acceptor().cloned(),
            limits: CodecLimits::from(&self.config.connection),
            read_buffer_size: self.config.connection.read_buffer_size,
            log_prefix: Arc::clone(&self.log_prefix),
            local_addr: listener.local_addr(),
        });

        info!(
            prefix = %self.log_prefix,
            address = %listener.local_addr(),
            fd = listener.as_raw_fd(),
            tls = listener.is_tls(),
            accept_timeout = ?listener.accept_timeout(),
            "Accepting connections"
        );
        self.ready.send_replace(true);

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let guard = self.tracker.track();
                    metrics::record_connection_accepted();
                    tokio::spawn(handler::handle_connection(
                        stream,
                        peer_addr,
                        guard,
                        Arc::clone(&shared),
                    ));
                }
                Err(e) if e.is_transient() => {}
                Err(e) => {
                    metrics::record_accept_error();
                    error!(prefix = %self.log_prefix, error = %e, "SERVER Accept Error");
                }
            }

            if self.shutdown.is_triggered() {
                break;
            }
        }

        info!(
            prefix = %self.log_prefix,
            active = self.tracker.active_count(),
            "Stopped accepting, waiting for handlers"
        );
        self.tracker.wait_idle().await;
        info!(prefix = %self.log_prefix, "All handlers finished");
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("listener", &self.listener)
            .field("log_prefix", &self.log_prefix)
            .field("active", &self.tracker.active_count())
            .finish()
    }
}

/// Controls a running server from outside its accept loop.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: Shutdown,
    tracker: ConnectionTracker,
    ready: watch::Receiver<bool>,
}

impl ServerHandle {
    /// Stop accepting new connections. Calling this more than once has no
    /// further effect.
    pub fn stop_accepting(&self) {
        self.shutdown.trigger();
    }

    /// Wait until the accept loop is running. Returns false if the server
    /// was dropped before it got there.
    pub async fn ready(&self) -> bool {
        let mut ready = self.ready.clone();
        let became_ready = ready.wait_for(|ready| *ready).await.is_ok();
        became_ready
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Number of connection handlers currently running.
    pub fn active_connections(&self) -> usize {
        self.tracker.active_count()
    }

    /// Wait until no connection handler is running.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await
    }
}
