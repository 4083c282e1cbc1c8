//! Connection endpoint: one accepted socket and its serving loop.
//!
//! # States
//! ```text
//! Accepted → [Handshaking] → Serving (read → dispatch, repeat) → Closed
//! ```
//!
//! # Responsibilities
//! - Optional TLS handshake before serving
//! - Strictly sequential read/dispatch of messages
//! - Serialized writes with per-write deadline
//! - Peer-disconnect detection on request
//! - Contain panics to the connection that raised them

use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Once, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, WriteHalf};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use crate::mux::handler::{ErrorReport, Handler};
use crate::net::connection::{ConnectionGuard, ConnectionId, ConnectionState};
use crate::net::context::Context;
use crate::net::switch_reader::{wait_closed, CloseNotifier, PeerGone, SwitchReader};
use crate::net::tls::TlsInfo;
use crate::observability::metrics;
use crate::protocol::{Dictionary, Message, MessageCodec, ProtocolError, ProtocolResult, ReadFailure};

/// Byte stream an endpoint can serve.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Boxed socket, plain or TLS.
pub type BoxedIo = Box<dyn Io>;

/// Settings shared by every connection of one server.
pub struct EndpointConfig {
    pub handler: Arc<dyn Handler>,
    pub dictionary: Arc<dyn Dictionary>,
    pub codec: Arc<dyn MessageCodec>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("dictionary", &self.dictionary)
            .field("codec", &self.codec)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .finish()
    }
}

/// Write half of a connection.
struct WriteSide {
    stream: Option<BufWriter<WriteHalf<BoxedIo>>>,
    /// Set while a write is in flight and kept if it does not finish. Once
    /// set, a partial frame may be on the wire and nothing more is sent.
    fault: Option<WriteFault>,
}

#[derive(Debug, Clone)]
enum WriteFault {
    Interrupted,
    Timeout(Duration),
    Io(std::io::ErrorKind, String),
}

impl WriteFault {
    fn from_error(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::WriteTimeout(limit) => WriteFault::Timeout(*limit),
            ProtocolError::Io(e) => WriteFault::Io(e.kind(), e.to_string()),
            _ => WriteFault::Interrupted,
        }
    }

    fn to_error(&self) -> ProtocolError {
        match self {
            WriteFault::Interrupted => ProtocolError::Io(std::io::Error::other("an earlier write was interrupted")),
            WriteFault::Timeout(limit) => ProtocolError::WriteTimeout(*limit),
            WriteFault::Io(kind, message) => ProtocolError::Io(std::io::Error::new(*kind, message.clone())),
        }
    }
}

struct ConnInner {
    id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    tls: Option<TlsInfo>,
    write_timeout: Option<Duration>,
    writer: tokio::sync::Mutex<WriteSide>,
    /// Local close signal, observed by the read loop, writes and the copy task.
    closed: watch::Sender<bool>,
    switch: SwitchReader,
    notifier: CloseNotifier,
    context: Mutex<Option<Context>>,
}

/// Handle to a connection, given to handlers.
///
/// Cloning is cheap; all clones refer to the same connection.
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl Conn {
    /// Write `buf` to the peer and flush.
    ///
    /// Writes are serialized. Failures are returned to the caller and do not
    /// close the connection, so reads carry on. A write that fails or is
    /// cancelled partway leaves the write side broken: every later write
    /// returns the same error without sending anything.
    pub async fn write(&self, buf: &[u8]) -> ProtocolResult<usize> {
        let mut closed = self.inner.closed.subscribe();
        if *closed.borrow() {
            return Err(ProtocolError::ConnectionClosed);
        }

        let mut side = self.inner.writer.lock().await;
        let WriteSide { stream, fault } = &mut *side;
        if let Some(fault) = fault.as_ref() {
            return Err(fault.to_error());
        }
        let writer = stream.as_mut().ok_or(ProtocolError::ConnectionClosed)?;
        *fault = Some(WriteFault::Interrupted);

        let write = async {
            writer.write_all(buf).await?;
            writer.flush().await?;
            Ok::<usize, ProtocolError>(buf.len())
        };
        let write = async {
            match self.inner.write_timeout {
                Some(limit) => tokio::time::timeout(limit, write)
                    .await
                    .unwrap_or(Err(ProtocolError::WriteTimeout(limit))),
                None => write.await,
            }
        };

        let result = tokio::select! {
            res = write => res,
            _ = wait_closed(&mut closed) => Err(ProtocolError::ConnectionClosed),
        };
        match &result {
            Ok(_) => {
                *fault = None;
                metrics::record_message("out");
            }
            Err(e) => {
                *fault = Some(WriteFault::from_error(e));
                tracing::debug!(connection_id = %self.inner.id, error = %e, "Write failed");
            }
        }
        result
    }

    /// Serialize and write a message.
    pub async fn write_message(&self, message: &Message) -> ProtocolResult<usize> {
        self.write(&message.to_bytes()).await
    }

    /// Close the connection. The serving loop stops and the socket is
    /// released once the loop exits.
    pub async fn close(&self) {
        if !self.inner.closed.send_replace(true) {
            tracing::debug!(connection_id = %self.inner.id, "Connection closing");
        }
        let writer = self.inner.writer.lock().await.stream.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        // Release the read half too, unless the copy task holds it.
        drop(self.inner.switch.switch(Box::new(tokio::io::empty())));
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    /// Handshake snapshot, or `None` for plain TCP.
    pub fn tls(&self) -> Option<&TlsInfo> {
        self.inner.tls.as_ref()
    }

    /// Notification that fires once the peer has gone away.
    pub fn close_notify(&self) -> PeerGone {
        self.inner.notifier.subscribe()
    }

    /// True once a requested close notification has fired.
    pub fn is_peer_gone(&self) -> bool {
        self.inner.notifier.is_gone()
    }

    /// The connection's value store, created empty on first use.
    pub fn context(&self) -> Context {
        let mut ctx = self.inner.context.lock().unwrap_or_else(PoisonError::into_inner);
        ctx.get_or_insert_with(Context::background).clone()
    }

    /// Replace the connection's value store.
    pub fn set_context(&self, context: Context) {
        *self.inner.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(context);
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("tls", &self.inner.tls.is_some())
            .finish()
    }
}

/// Owns the read side of one connection and runs its serving loop.
pub struct Endpoint {
    conn: Conn,
    reader: BufReader<SwitchReader>,
    closed: watch::Receiver<bool>,
    config: Arc<EndpointConfig>,
}

impl Endpoint {
    pub fn new(
        io: BoxedIo,
        id: ConnectionId,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        tls: Option<TlsInfo>,
        config: Arc<EndpointConfig>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(io);
        let switch = SwitchReader::new(Box::new(read_half));
        let (closed_tx, closed_rx) = watch::channel(false);
        let notifier = CloseNotifier::new(switch.clone(), closed_rx.clone());

        let conn = Conn {
            inner: Arc::new(ConnInner {
                id,
                local_addr,
                remote_addr,
                tls,
                write_timeout: config.write_timeout,
                writer: tokio::sync::Mutex::new(WriteSide {
                    stream: Some(BufWriter::new(write_half)),
                    fault: None,
                }),
                closed: closed_tx,
                switch: switch.clone(),
                notifier,
                context: Mutex::new(None),
            }),
        };

        Self {
            conn,
            reader: BufReader::new(switch),
            closed: closed_rx,
            config,
        }
    }

    /// The handle given to handlers.
    pub fn conn(&self) -> &Conn {
        &self.conn
    }

    /// Run the serving loop to completion. The socket is closed on every
    /// exit path.
    pub async fn serve(mut self) {
        let conn = self.conn.clone();
        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %conn.remote_addr(),
            state = ?ConnectionState::Serving,
            "Serving connection"
        );

        install_panic_trace();
        if let Err(panic) = AssertUnwindSafe(self.serve_loop()).catch_unwind().await {
            let backtrace = take_panic_trace()
                .map(|trace| trace.to_string())
                .unwrap_or_else(|| "unavailable".to_string());
            tracing::error!(
                connection_id = %conn.id(),
                peer_addr = %conn.remote_addr(),
                panic = %panic_message(panic.as_ref()),
                backtrace = %backtrace,
                "Panic serving connection"
            );
            metrics::record_handler_panic();
        }

        conn.close().await;
        tracing::debug!(
            connection_id = %conn.id(),
            peer_addr = %conn.remote_addr(),
            state = ?ConnectionState::Closed,
            "Connection finished"
        );
    }

    async fn serve_loop(&mut self) {
        loop {
            match self.read_message().await {
                Ok(message) => {
                    metrics::record_message("in");
                    tracing::trace!(
                        connection_id = %self.conn.id(),
                        message = %message,
                        "Message received"
                    );
                    let handler = Arc::clone(&self.config.handler);
                    handler.serve_message(self.conn.clone(), Arc::new(message)).await;
                }
                Err(failure) => {
                    self.conn.close().await;
                    self.report(failure);
                    return;
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<Message, ReadFailure> {
        let Self {
            reader, closed, config, ..
        } = self;

        let read = config.codec.read_message(reader, Arc::clone(&config.dictionary));
        let read = async {
            match config.read_timeout {
                Some(limit) => tokio::time::timeout(limit, read)
                    .await
                    .unwrap_or_else(|_| Err(ProtocolError::ReadTimeout(limit).into())),
                None => read.await,
            }
        };

        tokio::select! {
            biased;
            _ = wait_closed(closed) => Err(ProtocolError::ConnectionClosed.into()),
            res = read => res,
        }
    }

    fn report(&self, failure: ReadFailure) {
        let ReadFailure { message, error } = failure;
        if error.is_clean_eof() {
            tracing::debug!(connection_id = %self.conn.id(), "Peer closed connection");
            return;
        }
        if matches!(error, ProtocolError::ConnectionClosed) {
            return;
        }

        match self.config.handler.error_reporter() {
            Some(reporter) => reporter.report_error(ErrorReport {
                conn: self.conn.clone(),
                message: message.map(Arc::new),
                error,
            }),
            None => tracing::warn!(
                connection_id = %self.conn.id(),
                peer_addr = %self.conn.remote_addr(),
                error = %error,
                "Read failed, closing connection"
            ),
        }
    }
}

/// Serve one accepted socket: handshake if TLS is configured, then run the
/// endpoint. Dropping `guard` at the end releases the connection slot.
pub async fn serve_accepted(
    io: BoxedIo,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    config: Arc<EndpointConfig>,
    guard: ConnectionGuard,
) {
    let id = guard.id();
    let (io, tls_info) = match tls {
        Some(acceptor) => {
            tracing::trace!(connection_id = %id, state = ?ConnectionState::Handshaking, "TLS handshake");
            let handshake = acceptor.accept(io);
            let handshake = match config.read_timeout {
                Some(limit) => match tokio::time::timeout(limit, handshake).await {
                    Ok(res) => res,
                    Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
                },
                None => handshake.await,
            };
            match handshake {
                Ok(stream) => {
                    let info = TlsInfo::capture(&stream);
                    (Box::new(stream) as BoxedIo, Some(info))
                }
                Err(e) => {
                    tracing::debug!(
                        connection_id = %id,
                        peer_addr = %remote_addr,
                        error = %e,
                        "TLS handshake failed"
                    );
                    return;
                }
            }
        }
        None => (io, None),
    };

    Endpoint::new(io, id, local_addr, remote_addr, tls_info, config)
        .serve()
        .await;
}

thread_local! {
    static PANIC_TRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Chain a panic hook that records the panicking thread's backtrace.
///
/// The unwind is caught within the same poll, so the trace is still in this
/// thread's slot when `take_panic_trace` runs.
fn install_panic_trace() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            PANIC_TRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

fn take_panic_trace() -> Option<Backtrace> {
    PANIC_TRACE.with(|slot| slot.borrow_mut().take())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "unknown panic payload".to_string()
    }
}
