//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, admission, error classification)
//!     → tls.rs (optional TLS handshake)
//!     → endpoint.rs (read loop, write path, panic containment)
//!         → switch_reader.rs (peer-gone detection without losing bytes)
//!         → context.rs (per-connection value store)
//!     → Hand off to the handler
//!
//! Connection States:
//!     Accepted → [Handshaking] → Serving → Closed
//! ```
//!
//! # Design Decisions
//! - Unbounded admission by default; a semaphore bound is opt-in
//! - Each connection tracked for graceful shutdown
//! - TLS is optional and handled transparently

pub mod connection;
pub mod context;
pub mod endpoint;
pub mod listener;
pub mod switch_reader;
pub mod tls;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionState, ConnectionTracker};
pub use context::Context;
pub use endpoint::{BoxedIo, Conn, Endpoint, EndpointConfig, Io};
pub use listener::{bind, is_temporary, Accept, Accepted, Admission, AdmissionPermit, ListenerError};
pub use switch_reader::PeerGone;
pub use tls::{load_tls_config, TlsError, TlsInfo, TlsSettings};
