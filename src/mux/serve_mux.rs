//! Command multiplexer.
//!
//! # Dispatch
//! ```text
//! message (app id, code, R flag)
//!     → message.dictionary().find_command(app id, code)
//!         ok(short)  → key = short + "R" | "A"
//!         err        → key = "ALL"
//!     → entries[key]
//!         found      → handler.serve_message(conn, message)
//!         missing    → ErrorReport "unhandled message"
//! ```
//!
//! # Design Decisions
//! - Registration happens at configuration time; dispatch only reads
//! - The handler is cloned out of the table so no lock is held while it runs
//! - The multiplexer never generates answers on its own

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::ConfigError;
use crate::mux::handler::{handler_fn, ErrorReport, ErrorReporter, Handler};
use crate::mux::reports::{ErrorMailbox, ErrorReports};
use crate::net::endpoint::Conn;
use crate::protocol::{BoxFuture, Message, ProtocolError};

/// Reserved key for the catch-all handler.
pub const CATCH_ALL: &str = "ALL";

/// What `register` does with a key that already has a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Silently replace the previous handler.
    #[default]
    Replace,
    /// Refuse the registration.
    Reject,
}

/// Routes messages to handlers by command short name and direction.
pub struct ServeMux {
    entries: RwLock<HashMap<String, Arc<dyn Handler>>>,
    mailbox: ErrorMailbox,
    duplicates: DuplicatePolicy,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::with_duplicate_policy(DuplicatePolicy::default())
    }

    pub fn with_duplicate_policy(duplicates: DuplicatePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            mailbox: ErrorMailbox::new(),
            duplicates,
        }
    }

    /// Register `handler` under `key` (e.g. `"CER"`, `"DWA"`, `"ALL"`).
    ///
    /// A missing handler is a configuration error and leaves the table
    /// untouched.
    pub fn register(&self, key: impl Into<String>, handler: Option<Arc<dyn Handler>>) -> Result<(), ConfigError> {
        let key = key.into();
        let handler = handler.ok_or_else(|| ConfigError::NilHandler(key.clone()))?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if self.duplicates == DuplicatePolicy::Reject && entries.contains_key(&key) {
            return Err(ConfigError::DuplicateHandler(key));
        }
        if entries.insert(key.clone(), handler).is_some() {
            tracing::debug!(key = %key, "Handler replaced");
        } else {
            tracing::debug!(key = %key, "Handler registered");
        }
        Ok(())
    }

    /// Register a handler object.
    pub fn handle<H: Handler + 'static>(&self, key: impl Into<String>, handler: H) -> Result<(), ConfigError> {
        self.register(key, Some(Arc::new(handler)))
    }

    /// Register a closure.
    pub fn handle_fn<F, Fut>(&self, key: impl Into<String>, f: F) -> Result<(), ConfigError>
    where
        F: Fn(Conn, Arc<Message>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle(key, handler_fn(f))
    }

    /// Handler registered under `key`, if any.
    pub fn handler(&self, key: &str) -> Option<Arc<dyn Handler>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Registered keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Dispatch key for `message`, or `ALL` if the dictionary cannot
    /// resolve it.
    pub fn dispatch_key(message: &Message) -> String {
        let header = &message.header;
        match message
            .dictionary()
            .find_command(header.application_id, header.command_code)
        {
            Ok(short) => {
                let direction = if header.is_request() { "R" } else { "A" };
                format!("{}{}", short, direction)
            }
            Err(_) => CATCH_ALL.to_string(),
        }
    }

    /// Reports dropped because the mailbox was full.
    pub fn dropped_reports(&self) -> u64 {
        self.mailbox.dropped()
    }
}

impl Default for ServeMux {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServeMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServeMux")
            .field("keys", &self.keys())
            .field("duplicates", &self.duplicates)
            .finish()
    }
}

impl Handler for ServeMux {
    fn serve_message<'a>(&'a self, conn: Conn, message: Arc<Message>) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let key = Self::dispatch_key(&message);
            match self.handler(&key) {
                Some(handler) => handler.serve_message(conn, message).await,
                None => {
                    tracing::debug!(
                        connection_id = %conn.id(),
                        key = %key,
                        command = %message.header.command_name().abbrev,
                        "No handler for message"
                    );
                    self.report_error(ErrorReport {
                        conn,
                        message: Some(message),
                        error: ProtocolError::UnhandledMessage,
                    });
                }
            }
        })
    }

    fn error_reporter(&self) -> Option<&dyn ErrorReporter> {
        Some(self)
    }
}

impl ErrorReporter for ServeMux {
    fn report_error(&self, report: ErrorReport) {
        self.mailbox.submit(report);
    }

    fn error_reports(&self) -> ErrorReports {
        self.mailbox.reports()
    }
}
