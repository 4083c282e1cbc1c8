//! Listening sockets and connection admission.
//!
//! # Responsibilities
//! - Bind TCP listeners
//! - Abstract the accept call so the accept loop can run over any source
//! - Classify accept errors as temporary or permanent
//! - Optionally bound concurrent connections via semaphore

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::net::endpoint::BoxedIo;
use crate::protocol::BoxFuture;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to accept: {0}")]
    Accept(#[source] io::Error),

    #[error("admission limit closed")]
    AdmissionClosed,
}

/// One accepted socket.
pub struct Accepted {
    pub stream: BoxedIo,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Source of inbound connections.
pub trait Accept: Send {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Accepted>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> BoxFuture<'_, io::Result<Accepted>> {
        Box::pin(async move {
            let (stream, peer_addr) = TcpListener::accept(self).await?;
            let local_addr = stream.local_addr().or_else(|_| TcpListener::local_addr(self))?;
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
            Ok(Accepted {
                stream: Box::new(stream),
                local_addr,
                peer_addr,
            })
        })
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Bind a TCP listener on `addr`.
pub async fn bind(addr: &str) -> Result<TcpListener, ListenerError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ListenerError::Bind {
        addr: addr.to_string(),
        source,
    })?;

    match listener.local_addr() {
        Ok(local) => tracing::info!(address = %local, "Listener bound"),
        Err(e) => tracing::debug!(error = %e, "Bound listener has no local address"),
    }
    Ok(listener)
}

#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;

/// True for accept errors worth retrying after a pause: aborted or reset
/// handshakes, interruptions, timeouts and descriptor or buffer exhaustion.
pub fn is_temporary(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::OutOfMemory => true,
        _ => matches!(err.raw_os_error(), Some(EMFILE | ENFILE | ENOBUFS)),
    }
}

/// How many connections may be served at once.
#[derive(Debug, Clone, Default)]
pub enum Admission {
    /// No limit.
    #[default]
    Unbounded,
    /// At most this many; accepting waits for a free slot.
    Bounded(Arc<Semaphore>),
}

impl Admission {
    pub fn bounded(max_connections: usize) -> Self {
        Admission::Bounded(Arc::new(Semaphore::new(max_connections)))
    }

    pub fn from_limit(max_connections: Option<usize>) -> Self {
        max_connections.map_or(Admission::Unbounded, Self::bounded)
    }

    /// Wait for a connection slot.
    pub async fn acquire(&self) -> Result<AdmissionPermit, ListenerError> {
        match self {
            Admission::Unbounded => Ok(AdmissionPermit { _permit: None }),
            Admission::Bounded(limit) => {
                let permit = Arc::clone(limit)
                    .acquire_owned()
                    .await
                    .map_err(|_| ListenerError::AdmissionClosed)?;
                Ok(AdmissionPermit { _permit: Some(permit) })
            }
        }
    }

    /// Free slots, or `None` when unbounded.
    pub fn available(&self) -> Option<usize> {
        match self {
            Admission::Unbounded => None,
            Admission::Bounded(limit) => Some(limit.available_permits()),
        }
    }
}

/// A connection slot. Dropping it releases the slot, even if the connection
/// task panicked.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_temporary_errors() {
        assert!(is_temporary(&io::ErrorKind::ConnectionAborted.into()));
        assert!(is_temporary(&io::ErrorKind::Interrupted.into()));
        assert!(is_temporary(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_temporary(&io::Error::from_raw_os_error(ENFILE)));
        assert!(!is_temporary(&io::ErrorKind::InvalidInput.into()));
        assert!(!is_temporary(&io::ErrorKind::PermissionDenied.into()));
    }

    #[tokio::test]
    async fn bounded_admission_releases_on_drop() {
        let admission = Admission::bounded(1);
        let permit = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), Some(0));

        let waiting = tokio::time::timeout(std::time::Duration::from_millis(20), admission.acquire()).await;
        assert!(waiting.is_err());

        drop(permit);
        assert_eq!(admission.available(), Some(1));
    }

    #[tokio::test]
    async fn unbounded_admission_never_waits() {
        let admission = Admission::from_limit(None);
        let _a = admission.acquire().await.unwrap();
        let _b = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), None);
    }

    #[tokio::test]
    async fn tcp_accept_through_trait() {
        let mut listener = bind("127.0.0.1:0").await.unwrap();
        let addr = Accept::local_addr(&listener).unwrap();
        let client = tokio::spawn(tokio::net::TcpStream::connect(addr));

        let accepted = Accept::accept(&mut listener).await.unwrap();
        let client = client.await.unwrap().unwrap();
        assert_eq!(accepted.peer_addr, client.local_addr().unwrap());
        assert_eq!(accepted.local_addr, addr);
    }

    #[tokio::test]
    async fn bind_failure_names_address() {
        let err = bind("127.0.0.1:70000").await.unwrap_err();
        assert!(err.to_string().contains("127.0.0.1:70000"));
    }
}
