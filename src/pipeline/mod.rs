//! Pipeline execution interface.
//!
//! # Data Flow
//! ```text
//! connection handler
//!     → Pipeline::execute(&mut RequestContext)   (awaited)
//!         → stages append their own timing records
//!     ← Some(response) | None (handler substitutes 404)
//!     → response written and flushed
//!     → RequestDone::request_done(&RequestContext)   (spawned, not awaited)
//! ```
//!
//! # Design Decisions
//! - `execute` returns a boxed future so pipelines can be used as trait objects
//! - The completion hook runs on its own task; a panic there is contained

pub mod stages;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::Response;

use crate::http::RequestContext;

pub use stages::{request_filter, response_filter, RequestFilter, ResponseFilter, StagePipeline};

/// What the connection handler submits each request to.
pub trait Pipeline: Send + Sync + 'static {
    /// Run the request through the pipeline. `None` means no stage
    /// produced a response.
    fn execute<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Option<Response<Bytes>>>;

    /// Observer notified after the response has been written.
    fn request_done(&self) -> Option<Arc<dyn RequestDone>> {
        None
    }
}

/// Observer of completed requests.
pub trait RequestDone: Send + Sync + 'static {
    fn request_done(&self, ctx: &RequestContext);
}

impl<F> RequestDone for F
where
    F: Fn(&RequestContext) + Send + Sync + 'static,
{
    fn request_done(&self, ctx: &RequestContext) {
        self(ctx)
    }
}

impl<P: Pipeline + ?Sized> Pipeline for Arc<P> {
    fn execute<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Option<Response<Bytes>>> {
        (**self).execute(ctx)
    }

    fn request_done(&self) -> Option<Arc<dyn RequestDone>> {
        (**self).request_done()
    }
}

/// Hand a finished request to the pipeline's observer without waiting.
pub(crate) fn dispatch_request_done(pipeline: &dyn Pipeline, ctx: RequestContext) {
    if let Some(observer) = pipeline.request_done() {
        tokio::spawn(async move {
            observer.request_done(&ctx);
        });
    }
}
