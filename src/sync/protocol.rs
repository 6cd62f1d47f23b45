//! Binary frame format exchanged between clients through the relay.
//!
//! Every frame is `[version u8][type u8][len u24][payload]`. The relay never
//! looks inside; only client-side document and presence channels decode them.
//! Document payloads are raw Automerge bytes, presence payloads are bincode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Header length: version, type and a 24-bit payload length
pub const HEADER_LEN: usize = 5;

/// Largest payload a u24 length can describe (16MB)
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

/// Message type identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Document sync (Automerge payloads)
    SyncStep1 = 0x10,
    SyncStep2 = 0x11,
    Update = 0x12,

    // Presence (bincode payloads)
    Awareness = 0x40,
    AwarenessQuery = 0x41,
}

impl MessageType {
    pub fn is_document(self) -> bool {
        matches!(
            self,
            MessageType::SyncStep1 | MessageType::SyncStep2 | MessageType::Update
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x10 => Ok(MessageType::SyncStep1),
            0x11 => Ok(MessageType::SyncStep2),
            0x12 => Ok(MessageType::Update),
            0x40 => Ok(MessageType::Awareness),
            0x41 => Ok(MessageType::AwarenessQuery),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: MessageType) -> Self {
        Self::new(kind, Bytes::new())
    }

    /// Serialize to wire bytes
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                self.payload.len() + HEADER_LEN,
                MAX_PAYLOAD_SIZE + HEADER_LEN,
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u24(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }

    /// Parse wire bytes; trailing bytes beyond the declared length are ignored
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let kind = MessageType::try_from(cursor.get_u8())?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < HEADER_LEN + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                HEADER_LEN + payload_len,
                data.len()
            )));
        }

        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..HEADER_LEN + payload_len]),
        })
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
