//! Handler contract and the optional error-reporting capability.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::mux::reports::ErrorReports;
use crate::net::endpoint::Conn;
use crate::protocol::{BoxFuture, Message, ProtocolError};

/// Serves inbound messages on a connection.
///
/// `serve_message` writes zero or more messages to `conn` and then returns.
/// Returning means the handler is done with the message; the connection does
/// not read the next message until then.
pub trait Handler: Send + Sync {
    fn serve_message<'a>(&'a self, conn: Conn, message: Arc<Message>) -> BoxFuture<'a, ()>;

    /// The handler's error-reporting capability, if it has one.
    fn error_reporter(&self) -> Option<&dyn ErrorReporter> {
        None
    }
}

/// Implemented by handlers that accept reports of connection and dispatch
/// failures.
pub trait ErrorReporter: Send + Sync {
    /// Submit a report. Must not block.
    fn report_error(&self, report: ErrorReport);

    /// Receiver view of submitted reports.
    fn error_reports(&self) -> ErrorReports;
}

/// A failure attributable to a peer and, optionally, one of its messages.
pub struct ErrorReport {
    /// Peer that caused the error.
    pub conn: Conn,
    /// Message that caused the error, if it was identified.
    pub message: Option<Arc<Message>>,
    pub error: ProtocolError,
}

impl fmt::Debug for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReport")
            .field("conn", &self.conn)
            .field("message", &self.message)
            .field("error", &self.error)
            .finish()
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{} ({}): {}", self.conn.remote_addr(), m.header.command_name().abbrev, self.error),
            None => write!(f, "{}: {}", self.conn.remote_addr(), self.error),
        }
    }
}

/// Adapter that lets a closure serve messages.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a `Handler`.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Conn, Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Conn, Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn serve_message<'a>(&'a self, conn: Conn, message: Arc<Message>) -> BoxFuture<'a, ()> {
        Box::pin((self.f)(conn, message))
    }
}

impl<F> fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFn")
    }
}
