//! Diameter protocol subsystem.
//!
//! # Data Flow
//! ```text
//! Socket bytes
//!     → header.rs (20-byte fixed header, version check)
//!     → message.rs (frame by length, payload kept opaque)
//!     → Message { header, payload, dictionary }
//!
//! Dispatch:
//!     Message.dictionary()
//!     → dictionary.rs find_command(app id, code) → short name
//! ```
//!
//! # Design Decisions
//! - Header codec has no dependencies and never allocates
//! - Dictionary and message codec are traits so callers can plug in a full
//!   AVP stack; the defaults only frame messages
//! - The static command table in header.rs is for display only

pub mod dictionary;
pub mod error;
pub mod header;
pub mod message;

pub use dictionary::{BaseDictionary, Dictionary};
pub use error::{ProtocolError, ProtocolResult};
pub use header::{flags, Command, Header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::{BoxFuture, Message, MessageCodec, RawCodec, ReadFailure};
