//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Listener (plain or TLS)
//!     → server.rs (accept loop, one task per connection, graceful drain)
//!     → handler.rs (keep-alive loop: read → dispatch → write)
//!         → codec.rs (read buffer, request parsing)
//!         → request.rs (RequestContext, stage timings)
//!         → [pipeline decides the response]
//!         → response.rs (default 404, Connection header, encoding)
//!     → Send to client
//! ```

pub mod codec;
mod handler;
pub mod request;
pub mod response;
pub mod server;

pub use codec::{CodecError, CodecLimits, ReadBuffer};
pub use request::{RequestContext, RequestId, StageTiming, STAGE_INIT, STAGE_RESPONSE_WRITE};
pub use response::{not_found, simple_response};
pub use server::{Server, ServerError, ServerHandle};
