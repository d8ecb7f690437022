//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT, SIGHUP)
//! - Translate signals to lifecycle events
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - SIGHUP hands the listener to a successor, it does not just stop

use std::io;
use tokio::signal::unix::{signal, SignalKind};

/// Lifecycle event requested by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Stop accepting and drain (SIGTERM / SIGINT).
    Shutdown,
    /// Start a successor on the same listener, then drain (SIGHUP).
    Handoff,
}

/// Installed signal listeners.
pub struct Signals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

impl Signals {
    /// Install handlers. Must be called inside a Tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next lifecycle signal.
    pub async fn recv(&mut self) -> LifecycleEvent {
        tokio::select! {
            _ = self.terminate.recv() => LifecycleEvent::Shutdown,
            _ = self.interrupt.recv() => LifecycleEvent::Shutdown,
            _ = self.hangup.recv() => LifecycleEvent::Handoff,
        }
    }
}
