//! Message dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! Endpoint read loop
//!     → handler.rs (Handler::serve_message)
//!     → serve_mux.rs (dictionary lookup → key → registered handler)
//!     → on miss or read fault: reports.rs (single-slot mailbox)
//!     → out-of-band monitor via ErrorReports
//! ```
//!
//! # Design Decisions
//! - Handlers are trait objects; closures adapt through `handler_fn`
//! - Error reporting is an optional capability discovered on the handler
//! - The mailbox never blocks a producer; overflow is counted, not queued

pub mod handler;
pub mod reports;
pub mod serve_mux;

pub use handler::{handler_fn, ErrorReport, ErrorReporter, Handler, HandlerFn};
pub use reports::{ErrorMailbox, ErrorReports};
pub use serve_mux::{DuplicatePolicy, ServeMux, CATCH_ALL};
