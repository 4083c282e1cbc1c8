//! TLS configuration, certificate loading and session snapshots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::{self, pki_types::CertificateDer, ServerConfig};
use tokio_rustls::server::TlsStream;

/// Errors raised while building the server TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0:?}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("invalid certificate/key pair: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Settings applied on top of the loaded certificate.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// ALPN protocols offered during the handshake, most preferred first.
    pub alpn_protocols: Vec<String>,
}

/// Load a PEM certificate chain and private key into a server configuration.
pub async fn load_tls_config(cert_path: &Path, key_path: &Path, settings: &TlsSettings) -> Result<Arc<ServerConfig>, TlsError> {
    let cert_pem = read_pem(cert_path).await?;
    let key_pem = read_pem(key_path).await?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|source| TlsError::Io {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(cert_path.to_path_buf()));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|source| TlsError::Io {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(key_path.to_path_buf()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = settings
        .alpn_protocols
        .iter()
        .map(|p| p.as_bytes().to_vec())
        .collect();

    tracing::info!(
        cert = ?cert_path,
        alpn = ?settings.alpn_protocols,
        "TLS configuration loaded"
    );
    Ok(Arc::new(config))
}

async fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    tokio::fs::read(path).await.map_err(|source| TlsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Snapshot of a completed TLS handshake.
#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub protocol_version: Option<rustls::ProtocolVersion>,
    pub cipher_suite: Option<rustls::CipherSuite>,
    pub alpn_protocol: Option<Vec<u8>>,
    /// SNI host name sent by the peer.
    pub server_name: Option<String>,
    pub peer_certificates: Vec<CertificateDer<'static>>,
}

impl TlsInfo {
    /// Capture the negotiated parameters of a server-side session.
    pub fn capture<IO>(stream: &TlsStream<IO>) -> Self {
        let (_, session) = stream.get_ref();
        Self {
            protocol_version: session.protocol_version(),
            cipher_suite: session.negotiated_cipher_suite().map(|s| s.suite()),
            alpn_protocol: session.alpn_protocol().map(|p| p.to_vec()),
            server_name: session.server_name().map(str::to_owned),
            peer_certificates: session
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn missing_certificate_file() {
        let err = load_tls_config(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
            &TlsSettings::default(),
        )
        .await
        .unwrap_err();
        match err {
            TlsError::Io { path, source } => {
                assert_eq!(path, PathBuf::from("/nonexistent/cert.pem"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_certificate_file() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(b"not a pem file\n").unwrap();
        let key = tempfile::NamedTempFile::new().unwrap();

        let err = load_tls_config(cert.path(), key.path(), &TlsSettings::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TlsError::NoCertificates(_)));
    }
}
