//! Conveyor: a connection-serving engine for HTTP/1.x.
//!
//! Accepts connections on a plain or TLS listener (fresh or inherited from a
//! previous process), runs a keep-alive request loop per connection, hands
//! each request to a pluggable [`Pipeline`], and drains gracefully on
//! shutdown.

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod pipeline;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ConveyorConfig;
pub use http::{RequestContext, Server, ServerError, ServerHandle};
pub use lifecycle::Shutdown;
pub use pipeline::{Pipeline, RequestDone, StagePipeline};
