//! Ordered stage pipeline.
//!
//! Upstream filters see the request in order; the first to return a
//! response ends the upstream pass. Downstream filters then see that
//! response in order. Every filter run is timed under the filter's name.

use std::borrow::Cow;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};
use http::Response;

use crate::http::RequestContext;
use crate::pipeline::{Pipeline, RequestDone};

/// A stage that may answer the request.
pub trait RequestFilter: Send + Sync + 'static {
    fn name(&self) -> Cow<'static, str>;

    fn filter<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Option<Response<Bytes>>>;
}

/// A stage that may rewrite the response.
pub trait ResponseFilter: Send + Sync + 'static {
    fn name(&self) -> Cow<'static, str>;

    fn filter<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        response: &'a mut Response<Bytes>,
    ) -> BoxFuture<'a, ()>;
}

/// Composable pipeline of request and response filters.
#[derive(Default, Clone)]
pub struct StagePipeline {
    upstream: Vec<Arc<dyn RequestFilter>>,
    downstream: Vec<Arc<dyn ResponseFilter>>,
    done: Option<Arc<dyn RequestDone>>,
}

impl StagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a request filter.
    pub fn upstream(mut self, filter: impl RequestFilter) -> Self {
        self.upstream.push(Arc::new(filter));
        self
    }

    /// Append a response filter.
    pub fn downstream(mut self, filter: impl ResponseFilter) -> Self {
        self.downstream.push(Arc::new(filter));
        self
    }

    /// Set the observer notified after each response is written.
    pub fn on_request_done(mut self, observer: impl RequestDone) -> Self {
        self.done = Some(Arc::new(observer));
        self
    }

    async fn run(&self, ctx: &mut RequestContext) -> Option<Response<Bytes>> {
        let mut response = None;
        for filter in &self.upstream {
            ctx.start_stage(filter.name());
            response = filter.filter(ctx).await;
            ctx.finish_stage();
            if response.is_some() {
                break;
            }
        }

        if let Some(response) = response.as_mut() {
            for filter in &self.downstream {
                ctx.start_stage(filter.name());
                filter.filter(ctx, response).await;
                ctx.finish_stage();
            }
        }
        response
    }
}

impl std::fmt::Debug for StagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let upstream: Vec<_> = self.upstream.iter().map(|s| s.name()).collect();
        let downstream: Vec<_> = self.downstream.iter().map(|s| s.name()).collect();
        f.debug_struct("StagePipeline")
            .field("upstream", &upstream)
            .field("downstream", &downstream)
            .field("request_done", &self.done.is_some())
            .finish()
    }
}

impl Pipeline for StagePipeline {
    fn execute<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Option<Response<Bytes>>> {
        self.run(ctx).boxed()
    }

    fn request_done(&self) -> Option<Arc<dyn RequestDone>> {
        self.done.clone()
    }
}

/// Request filter built from a synchronous closure.
pub struct FnRequestFilter<F> {
    name: Cow<'static, str>,
    f: F,
}

/// Wrap a closure as a named request filter.
pub fn request_filter<F>(name: impl Into<Cow<'static, str>>, f: F) -> FnRequestFilter<F>
where
    F: Fn(&mut RequestContext) -> Option<Response<Bytes>> + Send + Sync + 'static,
{
    FnRequestFilter { name: name.into(), f }
}

impl<F> RequestFilter for FnRequestFilter<F>
where
    F: Fn(&mut RequestContext) -> Option<Response<Bytes>> + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn filter<'a>(&'a self, ctx: &'a mut RequestContext) -> BoxFuture<'a, Option<Response<Bytes>>> {
        future::ready((self.f)(ctx)).boxed()
    }
}

/// Response filter built from a synchronous closure.
pub struct FnResponseFilter<F> {
    name: Cow<'static, str>,
    f: F,
}

/// Wrap a closure as a named response filter.
pub fn response_filter<F>(name: impl Into<Cow<'static, str>>, f: F) -> FnResponseFilter<F>
where
    F: Fn(&mut RequestContext, &mut Response<Bytes>) + Send + Sync + 'static,
{
    FnResponseFilter { name: name.into(), f }
}

impl<F> ResponseFilter for FnResponseFilter<F>
where
    F: Fn(&mut RequestContext, &mut Response<Bytes>) + Send + Sync + 'static,
{
    fn name(&self) -> Cow<'static, str> {
        self.name.clone()
    }

    fn filter<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
        response: &'a mut Response<Bytes>,
    ) -> BoxFuture<'a, ()> {
        (self.f)(ctx, response);
        future::ready(()).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::simple_response;
    use crate::net::{ConnectionId, ConnectionInfo};
    use http::{HeaderValue, Request, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn context(path: &str) -> RequestContext {
        let request = Request::builder().uri(path).body(Bytes::new()).unwrap();
        let connection = ConnectionInfo {
            id: ConnectionId::new(),
            peer_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:8080".parse().unwrap(),
            secure: false,
        };
        RequestContext::new(request, connection, 1, Instant::now())
    }

    fn stage_names(ctx: &RequestContext) -> Vec<String> {
        ctx.stages().iter().map(|s| s.name.to_string()).collect()
    }

    #[tokio::test]
    async fn empty_pipeline_yields_nothing() {
        let mut ctx = context("/");
        assert!(StagePipeline::new().execute(&mut ctx).await.is_none());
        assert!(ctx.stages().is_empty());
        assert!(StagePipeline::new().request_done().is_none());
    }

    #[tokio::test]
    async fn first_response_short_circuits_upstream() {
        let later_calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&later_calls);
        let pipeline = StagePipeline::new()
            .upstream(request_filter("skip", |_ctx: &mut RequestContext| None))
            .upstream(request_filter("answer", |_ctx: &mut RequestContext| {
                Some(simple_response(StatusCode::OK, "hi"))
            }))
            .upstream(request_filter("never", move |_ctx: &mut RequestContext| {
                counter.fetch_add(1, Ordering::SeqCst);
                None
            }));

        let mut ctx = context("/");
        let response = pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert_eq!(stage_names(&ctx), ["skip", "answer"]);
    }

    #[tokio::test]
    async fn downstream_rewrites_produced_response() {
        let pipeline = StagePipeline::new()
            .upstream(request_filter("answer", |ctx: &mut RequestContext| {
                Some(simple_response(StatusCode::OK, ctx.request().uri().path().to_string()))
            }))
            .downstream(response_filter(
                "server-header",
                |_ctx: &mut RequestContext, response: &mut Response<Bytes>| {
                    response
                        .headers_mut()
                        .insert("server", HeaderValue::from_static("conveyor"));
                },
            ));

        let mut ctx = context("/echo");
        let response = pipeline.execute(&mut ctx).await.unwrap();
        assert_eq!(response.body().as_ref(), b"/echo");
        assert_eq!(response.headers()["server"], "conveyor");
        assert_eq!(stage_names(&ctx), ["answer", "server-header"]);
    }

    #[tokio::test]
    async fn downstream_skipped_without_response() {
        let pipeline = StagePipeline::new().downstream(response_filter(
            "unused",
            |_ctx: &mut RequestContext, _response: &mut Response<Bytes>| {},
        ));
        let mut ctx = context("/");
        assert!(pipeline.execute(&mut ctx).await.is_none());
        assert!(ctx.stages().is_empty());
    }

    #[tokio::test]
    async fn done_observer_is_exposed() {
        let pipeline = StagePipeline::new().on_request_done(|_ctx: &RequestContext| {});
        assert!(pipeline.request_done().is_some());
        assert!(format!("{:?}", pipeline).contains("request_done: true"));
    }
}
