//! Per-request context and stage timing.
//!
//! # Responsibilities
//! - Generate a unique request ID (UUID v4) for log correlation
//! - Carry the parsed request and the connection it arrived on
//! - Record when each processing stage started and ended
//!
//! # Design Decisions
//! - Timings use the monotonic clock so every record satisfies end >= start
//! - Records are only ever appended, in the order stages ran
//! - The server opens the sequence with `server.init` and closes it with
//!   `server.response_write`; pipeline stages land in between

use std::borrow::Cow;
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use http::Request;
use uuid::Uuid;

use crate::net::ConnectionInfo;

/// Stage covering connection setup and request parsing.
pub const STAGE_INIT: &str = "server.init";

/// Stage covering response serialization and flush.
pub const STAGE_RESPONSE_WRITE: &str = "server.response_write";

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One named interval of request processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTiming {
    pub name: Cow<'static, str>,
    pub start: Instant,
    pub end: Instant,
}

impl StageTiming {
    pub fn duration(&self) -> Duration {
        self.end.saturating_duration_since(self.start)
    }
}

/// Everything known about one request while it moves through the server.
#[derive(Debug)]
pub struct RequestContext {
    id: RequestId,
    sequence: u64,
    request: Request<Bytes>,
    connection: ConnectionInfo,
    started_at: Instant,
    started_wall: SystemTime,
    stages: Vec<StageTiming>,
    open_stage: Option<(Cow<'static, str>, Instant)>,
    finished_at: Option<Instant>,
}

impl RequestContext {
    /// Build a context for `request`, the `sequence`-th on its connection
    /// (starting at 1), whose processing began at `started_at`.
    pub fn new(
        request: Request<Bytes>,
        connection: ConnectionInfo,
        sequence: u64,
        started_at: Instant,
    ) -> Self {
        let started_wall = SystemTime::now()
            .checked_sub(started_at.elapsed())
            .unwrap_or_else(SystemTime::now);

        Self {
            id: RequestId::new(),
            sequence,
            request,
            connection,
            started_at,
            started_wall,
            stages: Vec::new(),
            open_stage: None,
            finished_at: None,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Position of this request on its connection, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn request(&self) -> &Request<Bytes> {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Request<Bytes> {
        &mut self.request
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Wall-clock time at which processing began.
    pub fn wall_clock_start(&self) -> SystemTime {
        self.started_wall
    }

    /// Release the request body; it is not needed once a response exists.
    pub fn discard_body(&mut self) {
        *self.request.body_mut() = Bytes::new();
    }

    /// Completed stage records, in the order they ran.
    pub fn stages(&self) -> &[StageTiming] {
        &self.stages
    }

    /// Append an already-measured stage. An `end` before `start` is
    /// clamped to `start`.
    pub fn append_stage(&mut self, name: impl Into<Cow<'static, str>>, start: Instant, end: Instant) {
        self.finish_stage();
        self.stages.push(StageTiming {
            name: name.into(),
            start,
            end: end.max(start),
        });
    }

    /// Open a stage now. A stage that is still open is finished first.
    pub fn start_stage(&mut self, name: impl Into<Cow<'static, str>>) {
        self.finish_stage();
        self.open_stage = Some((name.into(), Instant::now()));
    }

    /// Close the open stage, if any.
    pub fn finish_stage(&mut self) {
        if let Some((name, start)) = self.open_stage.take() {
            self.stages.push(StageTiming {
                name,
                start,
                end: Instant::now().max(start),
            });
        }
    }

    /// Close any open stage and stamp the request as complete.
    pub fn finish(&mut self) {
        self.finish_stage();
        self.finished_at.get_or_insert_with(Instant::now);
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Time from start to finish, or to now while still running.
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at)
    }
}
