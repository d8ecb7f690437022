//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;

/// Protocols offered during ALPN negotiation.
const ALPN_PROTOCOLS: &[&[u8]] = &[b"http/1.1"];

/// Error type for loading TLS credentials.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{kind} file not found: {path:?}")]
    NotFound { kind: &'static str, path: PathBuf },
    #[error("failed to read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),
    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),
    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Load TLS configuration from certificate and key files.
///
/// The configuration uses the `ring` provider, whose CSPRNG backs every
/// handshake, and negotiates `http/1.1` only.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    // Basic validation
    if !cert_path.exists() {
        return Err(TlsError::NotFound {
            kind: "Certificate",
            path: cert_path.to_path_buf(),
        });
    }
    if !key_path.exists() {
        return Err(TlsError::NotFound {
            kind: "Private key",
            path: key_path.to_path_buf(),
        });
    }

    let read_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| TlsError::Read { path, source }
    };

    let mut cert_reader = BufReader::new(File::open(cert_path).map_err(read_err(cert_path))?);
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(read_err(cert_path))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let mut key_reader = BufReader::new(File::open(key_path).map_err(read_err(key_path))?);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(read_err(key_path))?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("conveyor-tls-{}-{}", std::process::id(), name));
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn missing_certificate_is_reported() {
        let err = load_tls_config(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"))
            .unwrap_err();
        assert!(matches!(err, TlsError::NotFound { kind: "Certificate", .. }));
    }

    #[test]
    fn missing_key_is_reported() {
        let cert = scratch_file("only-cert.pem", "not a pem file\n");
        let err = load_tls_config(&cert, Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, TlsError::NotFound { kind: "Private key", .. }));
    }

    #[test]
    fn file_without_pem_blocks_has_no_certificates() {
        let cert = scratch_file("garbage-cert.pem", "hello world\n");
        let key = scratch_file("garbage-key.pem", "hello world\n");
        let err = load_tls_config(&cert, &key).unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates(_)));
    }

    #[test]
    fn loads_fixture_pair() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let config = load_tls_config(&dir.join("localhost.crt"), &dir.join("localhost.key")).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn certificate_as_key_is_rejected() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        let err = load_tls_config(&dir.join("localhost.crt"), &dir.join("localhost.crt")).unwrap_err();
        assert!(matches!(err, TlsError::NoPrivateKey(_)));
    }
}
