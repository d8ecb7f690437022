//! Per-connection request loop.
//!
//! Each accepted connection runs this loop on its own task:
//!
//! ```text
//! Reading ──request──▶ Dispatching ──response──▶ Writing ──keep-alive──▶ Reading
//!    │                                              │
//!    └──peer closed / read error──▶ Closing ◀──close┘
//! ```
//!
//! Requests on one connection are strictly sequential: the next request is
//! not read until the previous response has been flushed. Whatever state the
//! loop leaves from, the stream is shut down and the connection guard is
//! dropped, releasing the handler count.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::CONNECTION;
use http::{HeaderMap, Method, Response};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, trace};

use crate::http::codec::{self, CodecLimits, ReadBuffer};
use crate::http::request::{RequestContext, STAGE_INIT, STAGE_RESPONSE_WRITE};
use crate::http::response;
use crate::net::{ConnectionGuard, ConnectionInfo, Stream};
use crate::observability::metrics;
use crate::pipeline::{self, Pipeline};

/// Immutable state shared by every handler of one server.
pub(crate) struct HandlerContext {
    pub pipeline: Arc<dyn Pipeline>,
    pub tls: Option<TlsAcceptor>,
    pub limits: CodecLimits,
    pub read_buffer_size: usize,
    pub log_prefix: Arc<str>,
    pub local_addr: SocketAddr,
}

enum State {
    Reading,
    Dispatching {
        ctx: RequestContext,
        keep_alive: bool,
    },
    Writing {
        ctx: RequestContext,
        response: Response<Bytes>,
        keep_alive: bool,
    },
    Closing,
}

struct Connection {
    stream: Stream,
    buffer: ReadBuffer,
    info: ConnectionInfo,
    shared: Arc<HandlerContext>,
    started_at: Instant,
    requests: u64,
}

/// Serve one accepted connection until it closes.
///
/// `guard` is held for the whole call and released on every exit path.
pub(crate) async fn handle_connection(
    tcp: TcpStream,
    peer_addr: SocketAddr,
    guard: ConnectionGuard,
    shared: Arc<HandlerContext>,
) {
    let started_at = Instant::now();

    let mut stream = match &shared.tls {
        Some(acceptor) => match acceptor.accept(tcp).await {
            Ok(tls) => Stream::Tls(Box::new(tls)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(prefix = %shared.log_prefix, %peer_addr, "Peer left during TLS handshake");
                return;
            }
            Err(e) => {
                error!(prefix = %shared.log_prefix, %peer_addr, error = %e, "TLS handshake failed");
                return;
            }
        },
        None => Stream::Plain(tcp),
    };

    let info = ConnectionInfo {
        id: guard.id(),
        peer_addr,
        local_addr: shared.local_addr,
        secure: stream.is_tls(),
    };

    let buffer = match ReadBuffer::try_with_capacity(shared.read_buffer_size) {
        Ok(buffer) => buffer,
        Err(e) => {
            error!(prefix = %shared.log_prefix, %peer_addr, error = %e, "Read buffer fail");
            let _ = stream.shutdown().await;
            return;
        }
    };

    let mut connection = Connection {
        stream,
        buffer,
        info,
        shared,
        started_at,
        requests: 0,
    };
    connection.run().await;
    connection.close().await;
    drop(guard);
}

impl Connection {
    async fn run(&mut self) {
        let mut state = State::Reading;
        loop {
            state = match state {
                State::Reading => self.read().await,
                State::Dispatching { ctx, keep_alive } => self.dispatch(ctx, keep_alive).await,
                State::Writing {
                    ctx,
                    response,
                    keep_alive,
                } => self.write(ctx, response, keep_alive).await,
                State::Closing => break,
            };
        }
    }

    async fn read(&mut self) -> State {
        // The first request also accounts for connection setup.
        let cycle_start = if self.requests == 0 {
            self.started_at
        } else {
            Instant::now()
        };

        match codec::read_request(&mut self.stream, &mut self.buffer, &self.shared.limits).await {
            Ok(request) => {
                self.requests += 1;
                let keep_alive = wants_keep_alive(request.headers());
                let mut ctx = RequestContext::new(request, self.info, self.requests, cycle_start);
                ctx.append_stage(STAGE_INIT, cycle_start, Instant::now());
                State::Dispatching { ctx, keep_alive }
            }
            Err(e) if e.is_closed() => {
                trace!(
                    prefix = %self.shared.log_prefix,
                    connection_id = %self.info.id,
                    reason = %e,
                    "Peer closed connection"
                );
                State::Closing
            }
            Err(e) => {
                error!(
                    prefix = %self.shared.log_prefix,
                    peer_addr = %self.info.peer_addr,
                    connection_id = %self.info.id,
                    error = %e,
                    "ERROR reading request"
                );
                State::Closing
            }
        }
    }

    async fn dispatch(&mut self, mut ctx: RequestContext, keep_alive: bool) -> State {
        let response = match self.shared.pipeline.execute(&mut ctx).await {
            Some(response) => response,
            None => response::not_found(),
        };
        State::Writing {
            ctx,
            response,
            keep_alive,
        }
    }

    async fn write(
        &mut self,
        mut ctx: RequestContext,
        mut response: Response<Bytes>,
        keep_alive: bool,
    ) -> State {
        ctx.start_stage(STAGE_RESPONSE_WRITE);
        let head_request = ctx.request().method() == Method::HEAD;
        ctx.discard_body();
        response::set_keep_alive(&mut response, keep_alive);
        let status = response.status();
        let written = self.write_response(&response, head_request).await;
        drop(response);
        ctx.finish();

        metrics::record_request(status.as_u16());

        match written {
            Ok(()) => {
                debug!(
                    prefix = %self.shared.log_prefix,
                    request_id = %ctx.id(),
                    connection_id = %self.info.id,
                    method = %ctx.request().method(),
                    path = %ctx.request().uri().path(),
                    status = status.as_u16(),
                    elapsed = ?ctx.elapsed(),
                    "Request served"
                );
                pipeline::dispatch_request_done(self.shared.pipeline.as_ref(), ctx);
                if keep_alive {
                    State::Reading
                } else {
                    State::Closing
                }
            }
            Err(e) => {
                error!(
                    prefix = %self.shared.log_prefix,
                    peer_addr = %self.info.peer_addr,
                    request_id = %ctx.id(),
                    error = %e,
                    "ERROR writing response"
                );
                State::Closing
            }
        }
    }

    async fn write_response(&mut self, response: &Response<Bytes>, head_request: bool) -> std::io::Result<()> {
        let mut writer = BufWriter::new(&mut self.stream);
        response::write_response(&mut writer, response, head_request).await?;
        writer.flush().await
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!(
                prefix = %self.shared.log_prefix,
                connection_id = %self.info.id,
                error = %e,
                "Shutdown after close"
            );
        }
        debug!(
            prefix = %self.shared.log_prefix,
            peer_addr = %self.info.peer_addr,
            connection_id = %self.info.id,
            requests = self.requests,
            "Connection finished"
        );
    }
}

/// Keep-alive is granted only when the request asks for it.
fn wants_keep_alive(headers: &HeaderMap) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
}
