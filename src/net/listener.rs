//! TCP listener bootstrap.
//!
//! # Responsibilities
//! - Resolve and bind a fresh listening socket
//! - Adopt a listening descriptor inherited from a previous process
//! - Bound every accept by a timeout so the accept loop can observe shutdown
//! - Carry the optional TLS acceptor for accepted connections
//! - Expose the raw descriptor for listener handoff

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockname, getsockopt, sockopt, SockType, SockaddrStorage};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Error type for listener bootstrap.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// The bind address could not be turned into a socket address.
    #[error("failed to resolve {address:?}: {source}")]
    Resolve { address: String, source: io::Error },
    /// Failed to bind to address.
    #[error("failed to bind {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },
    /// The inherited descriptor is not a listening TCP socket.
    #[error("descriptor {fd} is not a TCP listener: {source}")]
    NotAListener { fd: RawFd, source: io::Error },
    #[error("listener setup failed: {0}")]
    Io(#[from] io::Error),
}

/// Why a single accept attempt produced no connection.
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// The accept timeout elapsed with nothing pending.
    #[error("accept timed out")]
    TimedOut,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl AcceptError {
    /// Transient conditions are expected and not worth reporting.
    pub fn is_transient(&self) -> bool {
        match self {
            AcceptError::TimedOut => true,
            AcceptError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// A listening socket with a bounded accept and optional TLS.
pub struct Listener {
    inner: TcpListener,
    fd: RawFd,
    local_addr: SocketAddr,
    accept_timeout: Duration,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Resolve `address` and bind a fresh listening socket.
    ///
    /// `address` may be `host:port` or `:port`; the latter binds every
    /// interface, and `:http` / `:https` name the usual ports. Resolved
    /// addresses are tried in order and the first that binds wins.
    pub async fn bind(address: &str, accept_timeout: Duration) -> Result<Self, ListenerError> {
        let mut last_err = None;
        for addr in resolve_bind_address(address).await? {
            match std::net::TcpListener::bind(addr) {
                Ok(listener) => return Self::from_std(listener, accept_timeout),
                Err(source) => last_err = Some(ListenerError::Bind { address: addr, source }),
            }
        }
        Err(last_err.unwrap_or_else(|| ListenerError::Resolve {
            address: address.to_string(),
            source: io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses found"),
        }))
    }

    /// Take ownership of an already-open listening descriptor.
    ///
    /// Must be called inside a Tokio runtime; outside one it panics.
    ///
    /// If the descriptor is rejected as not being a listening TCP socket
    /// (`ListenerError::NotAListener`), the caller still owns it. Past that
    /// check ownership has moved here, and any later error (`Io`) means the
    /// descriptor has been closed.
    pub fn adopt(fd: RawFd, accept_timeout: Duration) -> Result<Self, ListenerError> {
        if fd < 0 {
            return Err(ListenerError::NotAListener {
                fd,
                source: io::Error::new(io::ErrorKind::InvalidInput, "negative descriptor"),
            });
        }

        // SAFETY: the borrow does not outlive this call and nothing is closed.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        check_tcp_listener(&borrowed).map_err(|source| ListenerError::NotAListener { fd, source })?;

        // SAFETY: the descriptor is an open listening TCP socket; ownership moves here.
        let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
        Self::from_std(listener, accept_timeout)
    }

    fn from_std(listener: std::net::TcpListener, accept_timeout: Duration) -> Result<Self, ListenerError> {
        listener.set_nonblocking(true)?;
        let fd = listener.as_raw_fd();
        let inner = TcpListener::from_std(listener)?;
        let local_addr = inner.local_addr()?;

        Ok(Self {
            inner,
            fd,
            local_addr,
            accept_timeout,
            tls: None,
        })
    }

    /// Terminate TLS on every connection accepted from now on.
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(TlsAcceptor::from(config));
        self
    }

    /// Accept one connection, waiting at most the accept timeout.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), AcceptError> {
        match tokio::time::timeout(self.accept_timeout, self.inner.accept()).await {
            Ok(Ok(accepted)) => Ok(accepted),
            Ok(Err(e)) => Err(AcceptError::Io(e)),
            Err(_) => Err(AcceptError::TimedOut),
        }
    }

    /// The TLS acceptor, when TLS is enabled.
    pub fn tls_acceptor(&self) -> Option<&TlsAcceptor> {
        self.tls.as_ref()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The concrete port in use, useful after binding port 0.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn accept_timeout(&self) -> Duration {
        self.accept_timeout
    }

    /// Clear close-on-exec and return the descriptor, so a successor
    /// process started with `exec` inherits the listening socket.
    pub fn inheritable_fd(&self) -> io::Result<RawFd> {
        set_inheritable(self.fd)?;
        Ok(self.fd)
    }
}

/// Clear close-on-exec on `fd`.
pub fn set_inheritable(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    Ok(())
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("fd", &self.fd)
            .field("local_addr", &self.local_addr)
            .field("accept_timeout", &self.accept_timeout)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

fn check_tcp_listener(fd: &BorrowedFd<'_>) -> io::Result<()> {
    if getsockopt(fd, sockopt::SockType)? != SockType::Stream {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a stream socket"));
    }
    if !getsockopt(fd, sockopt::AcceptConn)? {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "socket is not listening"));
    }
    let addr: SockaddrStorage = getsockname(fd.as_raw_fd())?;
    if addr.as_sockaddr_in().is_none() && addr.as_sockaddr_in6().is_none() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not an inet socket"));
    }
    Ok(())
}

/// Turn a bind address into the candidate addresses to bind, in order.
///
/// `:port` means every interface: dual-stack `[::]` first, then `0.0.0.0`
/// for hosts without IPv6.
pub async fn resolve_bind_address(address: &str) -> Result<Vec<SocketAddr>, ListenerError> {
    let resolve_err = |source| ListenerError::Resolve {
        address: address.to_string(),
        source,
    };

    if let Some(port) = address.strip_prefix(':') {
        let port = named_port(port).map_err(resolve_err)?;
        return Ok(vec![
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)),
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        ]);
    }

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(address)
        .await
        .map_err(resolve_err)?
        .collect();
    if addrs.is_empty() {
        return Err(resolve_err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no addresses found",
        )));
    }
    Ok(addrs)
}

fn named_port(port: &str) -> io::Result<u16> {
    match port {
        "http" => Ok(80),
        "https" => Ok(443),
        other => other
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e)),
    }
}
