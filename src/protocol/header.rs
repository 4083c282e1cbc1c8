//! Diameter message header codec.
//!
//! Fixed 20-byte header, all multi-byte fields Big Endian:
//! ```text
//! ┌─────────┬──────────────────┬───────┬──────────────────┐
//! │ Version │ Message Length   │ Flags │ Command Code     │
//! │ 1 byte  │ 3 bytes (uint24) │ 1 byte│ 3 bytes (uint24) │
//! ├─────────┴──────────────────┴───────┴──────────────────┤
//! │ Application-ID (uint32)                               │
//! │ Hop-by-Hop Identifier (uint32)                        │
//! │ End-to-End Identifier (uint32)                        │
//! └───────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::error::{ProtocolError, ProtocolResult};

/// Header size in bytes (fixed, exactly 20).
pub const HEADER_SIZE: usize = 20;

/// The only protocol version this codec accepts.
pub const VERSION: u8 = 1;

/// Largest value a 24-bit field can carry.
pub const MAX_UINT24: u32 = 0x00FF_FFFF;

/// Largest payload a 24-bit length field can describe.
pub const MAX_PAYLOAD_SIZE: usize = MAX_UINT24 as usize - HEADER_SIZE;

/// Command flag bits.
pub mod flags {
    /// Message is a request (clear for answers).
    pub const REQUEST: u8 = 0b1000_0000;
    /// Message may be proxied, relayed or redirected.
    pub const PROXIABLE: u8 = 0b0100_0000;
    /// Message carries a protocol error.
    pub const ERROR: u8 = 0b0010_0000;
    /// Message is a potential retransmission.
    pub const RETRANSMITTED: u8 = 0b0001_0000;

    /// Reserved bits, must be zero.
    pub const RESERVED_MASK: u8 = 0b0000_1111;
}

/// Decoded Diameter header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Total message length including this header (24-bit).
    pub message_length: u32,
    pub command_flags: u8,
    /// Command code (24-bit).
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
}

impl Header {
    /// Create a header for a message with no payload yet.
    pub fn new(command_flags: u8, command_code: u32, application_id: u32, hop_by_hop_id: u32, end_to_end_id: u32) -> Self {
        Self {
            version: VERSION,
            message_length: HEADER_SIZE as u32,
            command_flags,
            command_code: command_code & MAX_UINT24,
            application_id,
            hop_by_hop_id,
            end_to_end_id,
        }
    }

    /// Decode a header from the first 20 bytes of `buf`.
    pub fn decode(buf: &[u8]) -> ProtocolResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("header needs {} bytes, got {}", HEADER_SIZE, buf.len()),
            )));
        }
        if buf[0] != VERSION {
            return Err(ProtocolError::InvalidVersion(buf[0]));
        }

        Ok(Self {
            version: buf[0],
            message_length: read_uint24(&buf[1..4]),
            command_flags: buf[4],
            command_code: read_uint24(&buf[5..8]),
            application_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            hop_by_hop_id: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            end_to_end_id: u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]),
        })
    }

    /// Read exactly one header from an async stream.
    ///
    /// A stream that ends before 20 bytes, including one that is already at
    /// EOF, fails with an `UnexpectedEof` I/O error.
    pub async fn read_from<R>(reader: &mut R) -> ProtocolResult<Self>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf).await?;
        Self::decode(&buf)
    }

    /// Encode the header to its wire representation.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode the header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is smaller than `HEADER_SIZE`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0] = self.version;
        write_uint24(&mut buf[1..4], self.message_length);
        buf[4] = self.command_flags;
        write_uint24(&mut buf[5..8], self.command_code);
        buf[8..12].copy_from_slice(&self.application_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.hop_by_hop_id.to_be_bytes());
        buf[16..20].copy_from_slice(&self.end_to_end_id.to_be_bytes());
    }

    /// Set the length field for a payload of `payload_length` bytes.
    ///
    /// Fails with `InvalidLength` when the total does not fit in 24 bits;
    /// the header is left unchanged in that case.
    pub fn set_message_length(&mut self, payload_length: usize) -> ProtocolResult<()> {
        if payload_length > MAX_PAYLOAD_SIZE {
            let total = payload_length.saturating_add(HEADER_SIZE);
            return Err(ProtocolError::InvalidLength(u32::try_from(total).unwrap_or(u32::MAX)));
        }
        self.message_length = (HEADER_SIZE + payload_length) as u32;
        Ok(())
    }

    /// Number of payload bytes that follow the header on the wire.
    pub fn payload_length(&self) -> ProtocolResult<usize> {
        if self.message_length < HEADER_SIZE as u32 {
            return Err(ProtocolError::InvalidLength(self.message_length));
        }
        Ok((self.message_length - HEADER_SIZE as u32) as usize)
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        self.command_flags & flags::REQUEST != 0
    }

    #[inline]
    pub fn is_proxiable(&self) -> bool {
        self.command_flags & flags::PROXIABLE != 0
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.command_flags & flags::ERROR != 0
    }

    #[inline]
    pub fn is_retransmitted(&self) -> bool {
        self.command_flags & flags::RETRANSMITTED != 0
    }

    /// Human-readable command name for this header.
    ///
    /// Known codes get a `-Request`/`R` or `-Answer`/`A` suffix depending on
    /// the request bit. Unknown codes always yield `Unknown`/`?`.
    pub fn command_name(&self) -> Command {
        let (name_suffix, abbrev_suffix) = if self.is_request() {
            ("-Request", "R")
        } else {
            ("-Answer", "A")
        };

        match lookup_command(self.command_code) {
            Some((name, abbrev)) => Command {
                name: format!("{}{}", name, name_suffix),
                abbrev: format!("{}{}", abbrev, abbrev_suffix),
            },
            None => Command::unknown(),
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cmd = self.command_name();
        write!(
            f,
            "{} ({}) Header{{Code={},Version={},MessageLength={},CommandFlags={{r={},p={},e={},t={}}},ApplicationId={},HopByHopId={:#x},EndToEndId={:#x}}}",
            cmd.name,
            cmd.abbrev,
            self.command_code,
            self.version,
            self.message_length,
            self.is_request(),
            self.is_proxiable(),
            self.is_error(),
            self.is_retransmitted(),
            self.application_id,
            self.hop_by_hop_id,
            self.end_to_end_id,
        )
    }
}

/// Display name and abbreviation of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub name: String,
    pub abbrev: String,
}

impl Command {
    /// Sentinel for codes missing from the static table.
    pub fn unknown() -> Self {
        Self {
            name: "Unknown".to_string(),
            abbrev: "?".to_string(),
        }
    }
}

// Display only; dispatch goes through the dictionary.
const COMMAND_CODES: &[(u32, &str, &str)] = &[
    (257, "Capabilities-Exchange", "CE"),
    (258, "Re-Auth", "RA"),
    (271, "Accounting", "AC"),
    (274, "Abort-Session", "AS"),
    (275, "Session-Termination", "ST"),
    (280, "Device-Watchdog", "DW"),
    (282, "Disconnect-Peer", "DP"),
];

fn lookup_command(code: u32) -> Option<(&'static str, &'static str)> {
    COMMAND_CODES
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, abbrev)| (*name, *abbrev))
}

fn read_uint24(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

fn write_uint24(b: &mut [u8], v: u32) {
    b[0] = (v >> 16) as u8;
    b[1] = (v >> 8) as u8;
    b[2] = v as u8;
}
