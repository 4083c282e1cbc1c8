//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use diam_server::lifecycle::Shutdown;
use diam_server::protocol::{flags, Header, HEADER_SIZE};
use diam_server::{ServeError, Server};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, pki_types::ServerName, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// A server running on an ephemeral loopback port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<Server>,
    pub shutdown: Shutdown,
    pub task: JoinHandle<Result<(), ServeError>>,
}

impl TestServer {
    /// Stop accepting and wait for the accept loop to return.
    pub async fn stop(self) -> Result<(), ServeError> {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("accept loop did not stop")
            .expect("accept loop panicked")
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Connect and complete a TLS handshake for `localhost`, trusting the
    /// fixture CA.
    pub async fn connect_tls(&self, alpn: &[&str]) -> TlsStream<TcpStream> {
        let pem = std::fs::read(fixture("ca.pem")).unwrap();
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        let tcp = self.connect().await;
        let name = ServerName::try_from("localhost").unwrap();
        tokio::time::timeout(Duration::from_secs(5), TlsConnector::from(Arc::new(config)).connect(name, tcp))
            .await
            .expect("TLS handshake timed out")
            .unwrap()
    }
}

/// Path of a file under `tests/fixtures`.
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Start `server` on `127.0.0.1:0`.
pub async fn start_server(server: Server) -> TestServer {
    let listener = diam_server::net::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let shutdown = Shutdown::new();

    let task = {
        let server = Arc::clone(&server);
        let signal = shutdown.signalled();
        tokio::spawn(async move { server.serve_with_shutdown(listener, signal).await })
    };

    TestServer {
        addr,
        server,
        shutdown,
        task,
    }
}

/// Wire bytes of a request with an opaque payload.
pub fn request(application_id: u32, command_code: u32, hop_by_hop_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = Header::new(flags::REQUEST, command_code, application_id, hop_by_hop_id, hop_by_hop_id);
    header.set_message_length(payload.len()).unwrap();
    let mut bytes = header.encode().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

/// Read one message; `None` on EOF before a header.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> Option<(Header, Vec<u8>)> {
    let mut buf = [0u8; HEADER_SIZE];
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for a message");
    if read.is_err() {
        return None;
    }
    let header = Header::decode(&buf).unwrap();
    let mut payload = vec![0u8; header.payload_length().unwrap()];
    stream.read_exact(&mut payload).await.unwrap();
    Some((header, payload))
}

/// Wait for the peer to close the connection.
pub async fn expect_closed<S: AsyncRead + Unpin>(stream: &mut S) {
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("connection was not closed")
        .ok();
    assert!(rest.is_empty(), "unexpected bytes before close: {:?}", rest);
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}
