//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Accept loop:
//!     → accept error classified temporary
//!     → backoff.rs (sleep 5ms, 10ms, ... capped at 1s)
//!     → retry accept; success resets the delay
//! ```
//!
//! # Design Decisions
//! - Deterministic delays; no jitter on a single listener
//! - Permanent errors are never retried

pub mod backoff;

pub use backoff::{calculate_backoff, AcceptBackoff};
