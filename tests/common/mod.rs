//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use conveyor::config::ConveyorConfig;
use conveyor::http::simple_response;
use conveyor::pipeline::request_filter;
use conveyor::{Pipeline, RequestContext, Server, ServerError, ServerHandle, StagePipeline};
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::subscriber::DefaultGuard;
use tracing::Level;

/// Config bound to an ephemeral loopback port with a short accept timeout,
/// so shutdown is observed quickly.
pub fn test_config() -> ConveyorConfig {
    let mut config = ConveyorConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.listener.accept_timeout_ms = 50;
    config.log_prefix = Some("test".into());
    config
}

/// A running server under test.
pub struct TestServer {
    pub addr: SocketAddr,
    pub handle: ServerHandle,
    pub task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    /// Stop accepting and wait for the accept loop and every handler to finish.
    pub async fn shutdown(self) {
        self.handle.stop_accepting();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server did not drain in time")
            .expect("serve task panicked")
            .expect("serve returned an error");
    }
}

pub async fn start_server(pipeline: impl Pipeline) -> TestServer {
    start_server_with(test_config(), pipeline).await
}

pub async fn start_server_with(config: ConveyorConfig, pipeline: impl Pipeline) -> TestServer {
    let mut server = Server::new(config, pipeline);
    server.listen().await.expect("listen");
    spawn_server(server).await
}

/// Run an already-listening server and wait until it accepts.
pub async fn spawn_server(server: Server) -> TestServer {
    let addr = server.local_addr().expect("server is listening");
    let handle = server.handle();
    let task = tokio::spawn(server.serve());
    assert!(handle.ready().await, "server never became ready");
    TestServer { addr, handle, task }
}

/// Pipeline answering every request with its own path.
pub fn echo_path_pipeline() -> StagePipeline {
    StagePipeline::new().upstream(request_filter("echo", |ctx: &mut RequestContext| {
        let path = ctx.request().uri().path().to_string();
        Some(simple_response(StatusCode::OK, path))
    }))
}

/// Pipeline answering every request with the size of its body.
pub fn body_length_pipeline() -> StagePipeline {
    StagePipeline::new().upstream(request_filter("length", |ctx: &mut RequestContext| {
        let length = ctx.request().body().len().to_string();
        Some(simple_response(StatusCode::OK, length))
    }))
}

/// Response as seen on the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A request with the given path and `Connection` header value.
pub fn get(path: &str, connection: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: {connection}\r\n\r\n")
}

/// Raw HTTP/1.1 client over any byte stream, keeping bytes that arrive
/// ahead of the response being read.
pub struct Client<S> {
    pub stream: S,
    buf: Vec<u8>,
}

impl Client<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, request: &str) {
        self.stream.write_all(request.as_bytes()).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Send a request and read its response.
    pub async fn roundtrip(&mut self, request: &str) -> RawResponse {
        self.send(request).await;
        self.read_response().await.expect("connection closed")
    }

    /// Read one response framed by `Content-Length`. Returns `None` when
    /// the server closed the connection before sending anything.
    pub async fn read_response(&mut self) -> Option<RawResponse> {
        loop {
            if let Some(response) = self.parse_buffered() {
                return Some(response);
            }
            if !self.fill().await {
                assert!(self.buf.is_empty(), "connection closed mid-response");
                return None;
            }
        }
    }

    /// True once the server has closed its side of the connection.
    pub async fn is_closed(&mut self) -> bool {
        self.buf.is_empty() && !self.fill().await
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match self.stream.read(&mut chunk).await {
            Ok(0) | Err(_) => false,
            Ok(n) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
        }
    }

    fn parse_buffered(&mut self) -> Option<RawResponse> {
        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut parsed = httparse::Response::new(&mut headers);
        let head_len = match parsed.parse(&self.buf).unwrap() {
            httparse::Status::Complete(head_len) => head_len,
            httparse::Status::Partial => return None,
        };
        let status = parsed.code.unwrap();
        let headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
            .collect();
        let length: usize = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .map(|(_, v)| v.parse().unwrap())
            .unwrap_or(0);
        if self.buf.len() < head_len + length {
            return None;
        }

        let rest = self.buf.split_off(head_len + length);
        let body = Bytes::copy_from_slice(&self.buf[head_len..]);
        self.buf = rest;
        Some(RawResponse {
            status,
            headers,
            body,
        })
    }
}

/// Poll until `f` holds or the deadline passes.
pub async fn eventually(mut f: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    f()
}

/// Formatted log output collected by [`capture_logs`].
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    pub fn lines(&self) -> Vec<String> {
        let buf = self.0.lock().unwrap();
        String::from_utf8_lossy(&buf)
            .lines()
            .map(str::to_owned)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Collect events at `level` and above for the current thread. Tasks
/// spawned on a current-thread test runtime report here too.
pub fn capture_logs(level: Level) -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (logs, tracing::subscriber::set_default(subscriber))
}
