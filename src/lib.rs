//! Diameter connection and dispatch core.
//!
//! Accepts Diameter peers over TCP or TLS, reads length-delimited messages,
//! and routes each one to a handler chosen by command short name and
//! request/answer direction.
//!
//! ```text
//!   peer ──▶ net::listener ──▶ net::endpoint ──▶ mux::ServeMux ──▶ handler
//!              (backoff)        (read loop,        (dictionary       (writes
//!                                TLS, panics)       lookup)           answers)
//!                                                     │
//!                                                     ▼
//!                                               error mailbox ──▶ monitor
//! ```

// Wire format
pub mod protocol;

// Core subsystems
pub mod mux;
pub mod net;
pub mod server;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::{ConfigError, DiameterConfig};
pub use lifecycle::Shutdown;
pub use mux::{handler_fn, ErrorReport, ErrorReporter, Handler, ServeMux};
pub use net::{Conn, Context};
pub use protocol::{BaseDictionary, Dictionary, Header, Message, ProtocolError, RawCodec};
pub use server::{listen_and_serve, listen_and_serve_tls, serve, ServeError, Server};
