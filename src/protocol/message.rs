//! Message collaborator: a header plus an opaque AVP payload.
//!
//! AVP decoding is not done here. `RawCodec` frames messages by the header
//! length field and hands the payload through untouched.

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::protocol::dictionary::Dictionary;
use crate::protocol::error::{ProtocolError, ProtocolResult};
use crate::protocol::header::{flags, Header, HEADER_SIZE};

/// Boxed future used by the object-safe traits in this crate.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// One framed Diameter message.
#[derive(Clone)]
pub struct Message {
    pub header: Header,
    payload: Bytes,
    dictionary: Arc<dyn Dictionary>,
}

impl Message {
    /// Build a message, fixing up the header length for `payload`.
    ///
    /// Payloads larger than `MAX_PAYLOAD_SIZE` are rejected.
    pub fn new(mut header: Header, payload: Bytes, dictionary: Arc<dyn Dictionary>) -> ProtocolResult<Self> {
        header.set_message_length(payload.len())?;
        Ok(Self {
            header,
            payload,
            dictionary,
        })
    }

    /// Raw AVP bytes following the header.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Dictionary the message was decoded against.
    pub fn dictionary(&self) -> &Arc<dyn Dictionary> {
        &self.dictionary
    }

    /// Serialize header and payload for the wire.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_slice(&self.header.encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Answer skeleton for this request: same ids and code, request bit
    /// cleared, error bit cleared, proxiable bit kept.
    pub fn answer(&self, payload: Bytes) -> ProtocolResult<Message> {
        let mut header = self.header;
        header.command_flags &= !(flags::REQUEST | flags::ERROR | flags::RETRANSMITTED);
        Message::new(header, payload, Arc::clone(&self.dictionary))
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("header", &self.header)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.header)
    }
}

/// A failed read, with whatever part of the message was identified.
#[derive(Debug)]
pub struct ReadFailure {
    /// Message whose header was read before the failure, if any.
    pub message: Option<Message>,
    pub error: ProtocolError,
}

impl From<ProtocolError> for ReadFailure {
    fn from(error: ProtocolError) -> Self {
        Self { message: None, error }
    }
}

/// Reads one message from a byte stream.
pub trait MessageCodec: Send + Sync + fmt::Debug {
    fn read_message<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
        dictionary: Arc<dyn Dictionary>,
    ) -> BoxFuture<'a, Result<Message, ReadFailure>>;
}

/// Length-delimited codec that keeps the AVP payload opaque.
#[derive(Debug, Clone, Default)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    fn read_message<'a>(
        &'a self,
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
        dictionary: Arc<dyn Dictionary>,
    ) -> BoxFuture<'a, Result<Message, ReadFailure>> {
        Box::pin(async move {
            let header = Header::read_from(&mut *reader).await?;
            let partial = |error: ProtocolError| ReadFailure {
                message: Some(Message {
                    header,
                    payload: Bytes::new(),
                    dictionary: Arc::clone(&dictionary),
                }),
                error,
            };

            let len = header.payload_length().map_err(|e| partial(e))?;
            let mut payload = BytesMut::zeroed(len);
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| partial(ProtocolError::Io(e)))?;

            Ok(Message {
                header,
                payload: payload.freeze(),
                dictionary,
            })
        })
    }
}
