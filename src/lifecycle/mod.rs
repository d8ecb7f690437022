//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load TLS credentials → Adopt or bind listener → Attach TLS
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Hand listener to successor (handoff.rs), then shut down
//! ```
//!
//! # Design Decisions
//! - Ordered startup: credentials first, then the socket
//! - Ordered shutdown: stop accept, drain, close
//! - No forced exit: draining waits for every connection

pub mod handoff;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{LifecycleEvent, Signals};
