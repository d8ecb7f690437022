//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Bind address (":8080") or inherited descriptor
//!     → listener.rs (bind / adopt, bounded accept)
//!     → tls.rs (optional: credentials → acceptor on the listener)
//!     → stream.rs (plain or TLS transport, handshake in the connection task)
//!     → connection.rs (connection id, handler counting for drain)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - Accept is bounded by a timeout so shutdown is observed periodically
//! - Each connection is counted until its handler exits
//! - TLS is optional and handled transparently

pub mod connection;
pub mod listener;
pub mod stream;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionInfo, ConnectionTracker};
pub use listener::{AcceptError, Listener, ListenerError};
pub use stream::Stream;
pub use tls::{load_tls_config, TlsError};
