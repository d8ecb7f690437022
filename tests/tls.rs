//! TLS termination on the listener.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use conveyor::config::TlsConfig;
use conveyor::http::simple_response;
use conveyor::pipeline::request_filter;
use conveyor::{RequestContext, Server, StagePipeline};
use http::StatusCode;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

mod common;
use common::{
    echo_path_pipeline, get, spawn_server, start_server_with, test_config, Client, TestServer,
};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    let mut reader = BufReader::new(File::open(fixture("ca.crt")).unwrap());
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

async fn start_tls_server() -> TestServer {
    let mut config = test_config();
    config.listener.tls = Some(TlsConfig {
        cert_path: fixture("localhost.crt"),
        key_path: fixture("localhost.key"),
    });
    start_server_with(config, echo_path_pipeline()).await
}

async fn tls_client(server: &TestServer) -> Client<tokio_rustls::client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(server.addr).await.unwrap();
    let name = ServerName::try_from("localhost").unwrap();
    Client::new(connector().connect(name, tcp).await.unwrap())
}

#[tokio::test]
async fn serves_requests_over_tls() {
    let server = start_tls_server().await;
    let mut client = tls_client(&server).await;

    let first = client.roundtrip(&get("/secure", "keep-alive")).await;
    assert_eq!(first.status, 200);
    assert_eq!(&first.body[..], b"/secure");
    assert_eq!(first.header("connection"), Some("keep-alive"));

    let second = client.roundtrip(&get("/again", "close")).await;
    assert_eq!(&second.body[..], b"/again");
    assert!(client.is_closed().await);

    server.shutdown().await;
}

#[tokio::test]
async fn plaintext_client_fails_handshake_without_harm() {
    let server = start_tls_server().await;

    let mut plain = TcpStream::connect(server.addr).await.unwrap();
    plain.write_all(get("/", "close").as_bytes()).await.unwrap();
    let mut reply = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(2), plain.read_to_end(&mut reply))
        .await
        .expect("server should drop the connection");
    assert!(!reply.starts_with(b"HTTP/"));

    let mut client = tls_client(&server).await;
    let response = client.roundtrip(&get("/after", "close")).await;
    assert_eq!(response.status, 200);

    server.shutdown().await;
}

#[tokio::test]
async fn client_leaving_mid_handshake_is_contained() {
    let server = start_tls_server().await;

    drop(TcpStream::connect(server.addr).await.unwrap());

    let mut client = tls_client(&server).await;
    assert_eq!(client.roundtrip(&get("/", "close")).await.status, 200);
    assert!(common::eventually(|| server.handle.active_connections() == 0).await);

    server.shutdown().await;
}

/// Pipeline answering with whether the connection is TLS-wrapped.
fn transport_pipeline() -> StagePipeline {
    StagePipeline::new().upstream(request_filter("transport", |ctx: &mut RequestContext| {
        let body = if ctx.connection().secure { "secure" } else { "plain" };
        Some(simple_response(StatusCode::OK, body))
    }))
}

#[tokio::test]
async fn tls_enabled_after_bind_is_served() {
    let mut server = Server::new(test_config(), transport_pipeline());
    server.bind("127.0.0.1:0").await.unwrap();
    server
        .enable_tls(&fixture("localhost.crt"), &fixture("localhost.key"))
        .unwrap();

    let server = spawn_server(server).await;
    let mut client = tls_client(&server).await;
    let response = client.roundtrip(&get("/", "close")).await;
    assert_eq!(response.status, 200);
    assert_eq!(&response.body[..], b"secure");

    server.shutdown().await;
}

#[tokio::test]
async fn plain_listener_reports_insecure_connections() {
    let server = common::start_server(transport_pipeline()).await;
    let mut client = Client::connect(server.addr).await;
    assert_eq!(&client.roundtrip(&get("/", "close")).await.body[..], b"plain");

    server.shutdown().await;
}
