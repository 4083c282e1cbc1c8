//! Server subsystem: accept loop and entry points.
//!
//! # Data Flow
//! ```text
//! Server (address, handler, dictionary, codec, timeouts, TLS, admission)
//!     → bind (listen_and_serve*) or caller-provided Accept
//!     → accept loop
//!         ok         → reset backoff, spawn connection task
//!         temporary  → sleep 5ms, 10ms, ... 1s, retry
//!         permanent  → close listener, return error
//!     → shutdown signal → stop accepting, return Ok
//! ```
//!
//! # Design Decisions
//! - One task per connection; no cap unless admission is bounded
//! - TLS material is loaded before any socket is bound
//! - A server holding a TLS configuration serves TLS on every entry point
//! - Defaults: `0.0.0.0:3868`, a fresh `ServeMux`, `BaseDictionary`, `RawCodec`

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::{ConfigError, DiameterConfig};
use crate::config::schema::DEFAULT_BIND_ADDRESS;
use crate::mux::{ErrorReports, Handler, ServeMux};
use crate::net::connection::{ConnectionState, ConnectionTracker};
use crate::net::endpoint::{serve_accepted, EndpointConfig};
use crate::net::listener::{self, is_temporary, Accept, Admission, ListenerError};
use crate::net::tls::{load_tls_config, TlsSettings};
use crate::observability::metrics;
use crate::protocol::{BaseDictionary, Dictionary, MessageCodec, RawCodec};
use crate::resilience::AcceptBackoff;

/// Errors that end `serve`.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Diameter server configuration.
///
/// # TLS
/// A server that holds a TLS configuration, from `with_tls_config` or
/// `load_tls`, serves TLS from every entry point. Without one it serves plain
/// TCP, except `listen_and_serve_tls`, which always serves TLS. Loading a
/// certificate (`load_tls`, `listen_and_serve_tls`) keeps every setting of a
/// held configuration and only replaces its certificate. With no held
/// configuration, one is built from `TlsSettings`.
pub struct Server {
    addr: String,
    handler: Arc<dyn Handler>,
    dictionary: Arc<dyn Dictionary>,
    codec: Arc<dyn MessageCodec>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    tls_settings: TlsSettings,
    tls_config: Option<Arc<ServerConfig>>,
    admission: Admission,
    tracker: ConnectionTracker,
}

impl Server {
    pub fn new() -> Self {
        Self {
            addr: DEFAULT_BIND_ADDRESS.to_string(),
            handler: Arc::new(ServeMux::new()),
            dictionary: Arc::new(BaseDictionary::new()),
            codec: Arc::new(RawCodec),
            read_timeout: None,
            write_timeout: None,
            tls_settings: TlsSettings::default(),
            tls_config: None,
            admission: Admission::Unbounded,
            tracker: ConnectionTracker::new(),
        }
    }

    /// Server built from a loaded configuration file. TLS material named in
    /// the configuration is not read until `load_tls`.
    pub fn from_config(config: &DiameterConfig) -> Self {
        let listener = &config.listener;
        let mut server = Self::new()
            .with_addr(&listener.bind_address)
            .with_admission(Admission::from_limit(listener.max_connections));
        server.read_timeout = config.timeouts.read_timeout();
        server.write_timeout = config.timeouts.write_timeout();
        if let Some(tls) = &listener.tls {
            server.tls_settings.alpn_protocols = tls.alpn_protocols.clone();
        }
        server
    }

    /// Listen address. Empty means `0.0.0.0:3868`.
    pub fn with_addr(mut self, addr: &str) -> Self {
        self.addr = if addr.is_empty() {
            DEFAULT_BIND_ADDRESS.to_string()
        } else {
            addr.to_string()
        };
        self
    }

    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_dictionary(mut self, dictionary: Arc<dyn Dictionary>) -> Self {
        self.dictionary = dictionary;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Deadline for reading one message. Zero disables it.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Deadline for one write. Zero disables it.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn with_tls_settings(mut self, settings: TlsSettings) -> Self {
        self.tls_settings = settings;
        self
    }

    /// Serve TLS with an already built configuration.
    pub fn with_tls_config(mut self, config: Arc<ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn with_admission(mut self, admission: Admission) -> Self {
        self.admission = admission;
        self
    }

    /// Read the PEM certificate chain and key into the TLS configuration;
    /// later serves use TLS.
    pub async fn load_tls(&mut self, cert_path: &Path, key_path: &Path) -> Result<(), ConfigError> {
        let config = self.tls_with_certificate(cert_path, key_path).await?;
        self.tls_config = Some(config);
        Ok(())
    }

    /// The held TLS configuration with the certificate at `cert_path`, or a
    /// new configuration from `TlsSettings` when none is held.
    async fn tls_with_certificate(&self, cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, ConfigError> {
        let loaded = load_tls_config(cert_path, key_path, &self.tls_settings).await?;
        Ok(match &self.tls_config {
            Some(base) => {
                let mut config = ServerConfig::clone(base);
                config.cert_resolver = Arc::clone(&loaded.cert_resolver);
                Arc::new(config)
            }
            None => loaded,
        })
    }

    fn tls_acceptor(&self) -> Option<TlsAcceptor> {
        self.tls_config.clone().map(TlsAcceptor::from)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    /// Error reports of the handler, if it can report errors.
    pub fn error_reports(&self) -> Option<ErrorReports> {
        self.handler.error_reporter().map(|r| r.error_reports())
    }

    /// Live connection accounting.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<tokio::net::TcpListener, ServeError> {
        Ok(listener::bind(&self.addr).await?)
    }

    /// Bind the configured address and serve until a permanent accept
    /// error.
    pub async fn listen_and_serve(&self) -> Result<(), ServeError> {
        let listener = self.bind().await?;
        self.run(listener, self.tls_acceptor(), std::future::pending()).await
    }

    /// Load the certificate and key, then bind and serve TLS. Nothing is
    /// bound if loading fails.
    pub async fn listen_and_serve_tls(&self, cert_path: &Path, key_path: &Path) -> Result<(), ServeError> {
        let tls = self.tls_with_certificate(cert_path, key_path).await?;
        let listener = self.bind().await?;
        self.run(listener, Some(TlsAcceptor::from(tls)), std::future::pending())
            .await
    }

    /// Accept connections on `listener` until a permanent accept error.
    pub async fn serve<A: Accept>(&self, listener: A) -> Result<(), ServeError> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves or a permanent accept
    /// error. Connections already being served are not interrupted.
    pub async fn serve_with_shutdown<A, F>(&self, listener: A, shutdown: F) -> Result<(), ServeError>
    where
        A: Accept,
        F: Future<Output = ()>,
    {
        self.run(listener, self.tls_acceptor(), shutdown).await
    }

    async fn run<A, F>(&self, mut listener: A, tls: Option<TlsAcceptor>, shutdown: F) -> Result<(), ServeError>
    where
        A: Accept,
        F: Future<Output = ()>,
    {
        let config = Arc::new(EndpointConfig {
            handler: Arc::clone(&self.handler),
            dictionary: Arc::clone(&self.dictionary),
            codec: Arc::clone(&self.codec),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        });

        match listener.local_addr() {
            Ok(addr) => tracing::info!(
                address = %addr,
                tls = tls.is_some(),
                max_connections = ?self.admission.available(),
                "Diameter server starting"
            ),
            Err(e) => tracing::debug!(error = %e, "Listener has no local address"),
        }

        let mut backoff = AcceptBackoff::default();
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                permit = self.admission.acquire() => permit?,
            };

            let accepted = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                res = listener.accept() => res,
            };

            let accepted = match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_temporary(&e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        attempt = backoff.attempt(),
                        "Accept failed, retrying"
                    );
                    metrics::record_accept_retry();
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Accept failed, closing listener");
                    drop(listener);
                    return Err(ListenerError::Accept(e).into());
                }
            };
            backoff.reset();

            let guard = self.tracker.track();
            metrics::record_connection_accepted();
            tracing::debug!(
                connection_id = %guard.id(),
                peer_addr = %accepted.peer_addr,
                state = ?ConnectionState::Accepted,
                active = self.tracker.active_count(),
                "Connection accepted"
            );

            let config = Arc::clone(&config);
            let tls = tls.clone();
            tokio::spawn(async move {
                serve_accepted(accepted.stream, accepted.local_addr, accepted.peer_addr, tls, config, guard).await;
                drop(permit);
            });
        }

        tracing::info!(active = self.tracker.active_count(), "Diameter server stopped accepting");
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("dictionary", &self.dictionary)
            .field("codec", &self.codec)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("tls", &self.tls_config.is_some())
            .field("admission", &self.admission)
            .finish()
    }
}

fn server_with(handler: Option<Arc<dyn Handler>>, dictionary: Option<Arc<dyn Dictionary>>) -> Server {
    let mut server = Server::new();
    if let Some(handler) = handler {
        server = server.with_handler(handler);
    }
    if let Some(dictionary) = dictionary {
        server = server.with_dictionary(dictionary);
    }
    server
}

/// Serve `listener` with `handler`, or a fresh `ServeMux` when `None`.
pub async fn serve<A: Accept>(listener: A, handler: Option<Arc<dyn Handler>>) -> Result<(), ServeError> {
    server_with(handler, None).serve(listener).await
}

/// Bind `addr` (empty for `0.0.0.0:3868`) and serve plain TCP.
pub async fn listen_and_serve(
    addr: &str,
    handler: Option<Arc<dyn Handler>>,
    dictionary: Option<Arc<dyn Dictionary>>,
) -> Result<(), ServeError> {
    server_with(handler, dictionary)
        .with_addr(addr)
        .listen_and_serve()
        .await
}

/// Load `cert_path`/`key_path`, bind `addr` and serve TLS.
pub async fn listen_and_serve_tls(
    addr: &str,
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    handler: Option<Arc<dyn Handler>>,
    dictionary: Option<Arc<dyn Dictionary>>,
) -> Result<(), ServeError> {
    server_with(handler, dictionary)
        .with_addr(addr)
        .listen_and_serve_tls(cert_path.as_ref(), key_path.as_ref())
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::listener::Accepted;
    use crate::protocol::BoxFuture;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Accept source that replays a script, then waits forever.
    struct Scripted {
        script: VecDeque<io::Result<Accepted>>,
        calls: Arc<Mutex<Vec<Instant>>>,
    }

    impl Scripted {
        fn new(script: Vec<io::Result<Accepted>>) -> (Self, Arc<Mutex<Vec<Instant>>>) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let scripted = Self {
                script: script.into(),
                calls: Arc::clone(&calls),
            };
            (scripted, calls)
        }
    }

    impl Accept for Scripted {
        fn accept(&mut self) -> BoxFuture<'_, io::Result<Accepted>> {
            self.calls.lock().unwrap().push(Instant::now());
            let next = self.script.pop_front();
            Box::pin(async move {
                match next {
                    Some(res) => res,
                    None => std::future::pending().await,
                }
            })
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 3868)))
        }
    }

    fn temporary() -> io::Result<Accepted> {
        Err(io::ErrorKind::ConnectionAborted.into())
    }

    fn permanent() -> io::Result<Accepted> {
        Err(io::ErrorKind::PermissionDenied.into())
    }

    fn accepted() -> io::Result<Accepted> {
        let (_peer, local) = tokio::io::duplex(64);
        Ok(Accepted {
            stream: Box::new(local),
            local_addr: SocketAddr::from(([127, 0, 0, 1], 3868)),
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 40000)),
        })
    }

    fn gaps(calls: &[Instant]) -> Vec<u64> {
        calls
            .windows(2)
            .map(|w| (w[1] - w[0]).as_millis() as u64)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn temporary_errors_back_off_then_permanent_returns() {
        let (listener, calls) = Scripted::new(vec![temporary(), temporary(), temporary(), permanent()]);

        let err = Server::new().serve(listener).await.unwrap_err();
        assert!(matches!(err, ServeError::Listener(ListenerError::Accept(ref e)) if e.kind() == io::ErrorKind::PermissionDenied));
        assert_eq!(gaps(&calls.lock().unwrap()), vec![5, 10, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_returns_immediately() {
        let (listener, calls) = Scripted::new(vec![permanent()]);
        let start = Instant::now();

        assert!(Server::new().serve(listener).await.is_err());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_backoff() {
        let (listener, calls) = Scripted::new(vec![temporary(), temporary(), accepted(), temporary(), permanent()]);

        let server = Server::new();
        assert!(server.serve(listener).await.is_err());
        assert_eq!(gaps(&calls.lock().unwrap()), vec![5, 10, 0, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_accepting() {
        let (listener, calls) = Scripted::new(vec![]);
        let server = Server::new();

        server
            .serve_with_shutdown(listener, tokio::time::sleep(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff_sleep() {
        let (listener, _calls) = Scripted::new(vec![temporary()]);
        let server = Server::new();
        let start = Instant::now();

        server
            .serve_with_shutdown(listener, tokio::time::sleep(Duration::from_millis(2)))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(2));
    }

    #[tokio::test]
    async fn tls_load_failure_binds_nothing() {
        let err = listen_and_serve_tls(
            "127.0.0.1:0",
            "/nonexistent/cert.pem",
            "/nonexistent/key.pem",
            None,
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ServeError::Config(ConfigError::Tls(_))));
    }

    fn fixture(name: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
    }

    fn tls_settings(alpn: &str) -> TlsSettings {
        TlsSettings {
            alpn_protocols: vec![alpn.to_string()],
        }
    }

    #[tokio::test]
    async fn loading_a_certificate_keeps_held_tls_settings() {
        let base = load_tls_config(&fixture("server.pem"), &fixture("server.key"), &tls_settings("base"))
            .await
            .unwrap();
        let mut server = Server::new()
            .with_tls_config(Arc::clone(&base))
            .with_tls_settings(tls_settings("ignored"));

        server
            .load_tls(&fixture("server.pem"), &fixture("server.key"))
            .await
            .unwrap();
        let config = server.tls_config.clone().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"base".to_vec()]);
        assert!(!Arc::ptr_eq(&config, &base));
    }

    #[tokio::test]
    async fn certificate_without_held_config_uses_settings() {
        let mut server = Server::new().with_tls_settings(tls_settings("diameter"));
        assert!(server.tls_acceptor().is_none());

        server
            .load_tls(&fixture("server.pem"), &fixture("server.key"))
            .await
            .unwrap();
        assert!(server.tls_acceptor().is_some());
        let config = server.tls_config.clone().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"diameter".to_vec()]);
    }

    #[tokio::test]
    async fn failed_certificate_load_keeps_held_config() {
        let base = load_tls_config(&fixture("server.pem"), &fixture("server.key"), &tls_settings("base"))
            .await
            .unwrap();
        let mut server = Server::new().with_tls_config(Arc::clone(&base));

        let err = server
            .load_tls(Path::new("/nonexistent/cert.pem"), &fixture("server.key"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Tls(_)));
        assert!(Arc::ptr_eq(server.tls_config.as_ref().unwrap(), &base));
    }

    #[test]
    fn from_config_applies_listener_and_timeouts() {
        let mut config = DiameterConfig::default();
        config.listener.bind_address = "127.0.0.1:13868".to_string();
        config.listener.max_connections = Some(8);
        config.timeouts.read_ms = 1500;

        let server = Server::from_config(&config);
        assert_eq!(server.addr(), "127.0.0.1:13868");
        assert_eq!(server.read_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(server.write_timeout, None);
        assert_eq!(server.admission.available(), Some(8));
        assert!(server.error_reports().is_some());
    }

    #[test]
    fn empty_address_uses_default_port() {
        assert_eq!(Server::new().with_addr("").addr(), "0.0.0.0:3868");
        assert_eq!(
            Server::new().with_read_timeout(Duration::ZERO).read_timeout,
            None
        );
    }
}
