//! Conveyor server binary.
//!
//! Serves a small stage pipeline (`/status` plus the default 404) and wires
//! the process lifecycle to signals:
//! - SIGTERM / SIGINT: stop accepting, drain, exit
//! - SIGHUP: start a successor on the same listening socket, then drain

use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Instant;

use bytes::Bytes;
use clap::Parser;
use http::header::{CONTENT_TYPE, SERVER};
use http::{HeaderValue, Response, StatusCode};
use tracing::{error, info};

use conveyor::config::{load_config, validate_config, ConfigError, ConveyorConfig, TlsConfig};
use conveyor::http::simple_response;
use conveyor::lifecycle::{handoff, LifecycleEvent, Signals};
use conveyor::observability::{init_logging, init_metrics, StageMetrics};
use conveyor::pipeline::{request_filter, response_filter};
use conveyor::{RequestContext, Server, ServerHandle, StagePipeline};

#[derive(Parser, Debug)]
#[command(name = "conveyor", version, about = "HTTP/1.x connection-serving engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,

    /// Listen on this port on all interfaces
    #[arg(short, long)]
    port: Option<u16>,

    /// Adopt this already-listening descriptor instead of binding
    #[arg(long, env = "CONVEYOR_LISTEN_FD")]
    fd: Option<RawFd>,

    /// TLS certificate chain (PEM)
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// TLS private key (PEM)
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

impl Cli {
    fn load(&self) -> Result<ConveyorConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ConveyorConfig::default(),
        };
        if let Some(port) = self.port {
            config.listener.bind_address = format!(":{port}");
        }
        if let Some(fd) = self.fd {
            config.listener.inherited_fd = Some(fd);
        }
        if let (Some(cert_path), Some(key_path)) = (&self.cert, &self.key) {
            config.listener.tls = Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            });
        }
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load()?;
    init_logging(&config.observability)?;
    let prefix = config.log_prefix();

    info!(prefix = %prefix, version = env!("CARGO_PKG_VERSION"), "conveyor starting");
    info!(
        prefix = %prefix,
        bind_address = %config.listener.bind_address,
        inherited_fd = ?config.listener.inherited_fd,
        tls = config.listener.tls.is_some(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        init_metrics(addr)?;
        info!(prefix = %prefix, address = %addr, "Metrics exporter listening");
    }

    let mut server = Server::new(config, demo_pipeline(Instant::now()));
    server.listen().await?;

    let signals = Signals::install()?;
    tokio::spawn(watch_signals(
        signals,
        server.handle(),
        server.socket_fd(),
        server.log_prefix().to_owned(),
    ));

    server.serve().await?;
    info!(prefix = %prefix, "Shutdown complete");
    Ok(())
}

async fn watch_signals(
    mut signals: Signals,
    handle: ServerHandle,
    listen_fd: Option<RawFd>,
    prefix: String,
) {
    loop {
        match signals.recv().await {
            LifecycleEvent::Shutdown => {
                info!(prefix = %prefix, "Shutdown signal received, draining");
                break;
            }
            LifecycleEvent::Handoff => {
                let Some(fd) = listen_fd else { break };
                match handoff::spawn_successor(fd) {
                    Ok(child) => {
                        info!(
                            prefix = %prefix,
                            fd,
                            pid = child.id(),
                            "Listener handed to successor, draining"
                        );
                        break;
                    }
                    Err(e) => error!(prefix = %prefix, error = %e, "Handoff failed, still serving"),
                }
            }
        }
    }
    handle.stop_accepting();
}

fn demo_pipeline(started: Instant) -> StagePipeline {
    StagePipeline::new()
        .upstream(request_filter("status", move |ctx: &mut RequestContext| {
            if ctx.request().uri().path() != "/status" {
                return None;
            }
            let body = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "uptime_secs": started.elapsed().as_secs(),
                "request_id": ctx.id().to_string(),
                "connection_requests": ctx.sequence(),
            });
            let mut response = simple_response(StatusCode::OK, body.to_string());
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Some(response)
        }))
        .downstream(response_filter(
            "server-header",
            |_ctx: &mut RequestContext, response: &mut Response<Bytes>| {
                response.headers_mut().insert(
                    SERVER,
                    HeaderValue::from_static(concat!("conveyor/", env!("CARGO_PKG_VERSION"))),
                );
            },
        ))
        .on_request_done(StageMetrics)
}
