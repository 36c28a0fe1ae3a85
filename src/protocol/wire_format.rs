//! Wire format encoding and decoding.
//!
//! Implements the 12-byte header format:
//! ```text
//! ┌─────────────┬──────┬──────────┬───────────┐
//! │ Header size │ Type │ Reserved │ Data size │
//! │ 2 bytes     │ 1    │ 1        │ 8 bytes   │
//! │ uint16 LE   │      │ (0)      │ uint64 LE │
//! └─────────────┴──────┴──────────┴───────────┘
//! ```
//!
//! All multi-byte integers are Little Endian.
//!
//! The header is self-describing: `header_size` is the number of header
//! bytes the *sender* wrote, including the size field itself. A receiver
//! reads only the size field first and then uses [`HeaderReadPlan`] to read
//! the part of the header it understands and skip any trailing fields added
//! by a newer peer.

use crate::error::{PubSubError, Result};

/// Local header size in bytes (exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Size of the leading `header_size` field.
pub const HEADER_SIZE_FIELD_LEN: usize = 2;

/// Default maximum payload size accepted by the decoder (1 GB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 1_073_741_824;

/// Protocol version announced in the handshake.
pub const PROTOCOL_VERSION: u8 = 0;

/// Frame content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// User payload fanned out by the publisher.
    RegularPayload = 0,
    /// Handshake request (subscriber) or response (publisher).
    ProtocolHandshake = 1,
}

impl MessageType {
    /// Map a raw type byte, `None` for types this peer does not know.
    #[inline]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MessageType::RegularPayload),
            1 => Some(MessageType::ProtocolHandshake),
            _ => None,
        }
    }
}

/// Decoded header.
///
/// `message_type` is kept raw so that frames of unknown type survive
/// decoding; use [`Header::kind`] to interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Header length as sent by the peer, including this field.
    pub header_size: u16,
    /// Raw content type byte.
    pub message_type: u8,
    /// Reserved, must be 0 when sending.
    pub reserved: u8,
    /// Payload length in bytes.
    pub data_size: u64,
}

impl Header {
    /// Create a local-sized header for a frame of the given type.
    pub fn new(kind: MessageType, data_size: u64) -> Self {
        Self {
            header_size: HEADER_SIZE as u16,
            message_type: kind as u8,
            reserved: 0,
            data_size,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use tcp_pubsub::protocol::{Header, MessageType};
    ///
    /// let bytes = Header::new(MessageType::RegularPayload, 4).encode();
    /// assert_eq!(bytes.len(), 12);
    /// assert_eq!(&bytes[0..2], &[12, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..2].copy_from_slice(&self.header_size.to_le_bytes());
        buf[2] = self.message_type;
        buf[3] = self.reserved;
        buf[4..12].copy_from_slice(&self.data_size.to_le_bytes());
    }

    /// Decode a full local-sized header.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        let mut data_size = [0u8; 8];
        data_size.copy_from_slice(&buf[4..12]);
        Some(Self {
            header_size: u16::from_le_bytes([buf[0], buf[1]]),
            message_type: buf[2],
            reserved: buf[3],
            data_size: u64::from_le_bytes(data_size),
        })
    }

    /// Build a header from what a peer actually sent.
    ///
    /// `body` holds the header bytes that followed the size field, already
    /// truncated to what this peer understands. They are laid over a zeroed
    /// local header, so any field the peer did not send keeps its default.
    pub fn from_received(header_size: u16, body: &[u8]) -> Self {
        let mut raw = [0u8; HEADER_SIZE];
        let len = body.len().min(HEADER_SIZE - HEADER_SIZE_FIELD_LEN);
        raw[HEADER_SIZE_FIELD_LEN..HEADER_SIZE_FIELD_LEN + len].copy_from_slice(&body[..len]);

        let mut header = Self::decode(&raw).unwrap_or_default();
        header.header_size = header_size;
        header
    }

    /// Interpret the type byte.
    #[inline]
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.message_type)
    }

    /// Check if this is a handshake frame.
    #[inline]
    pub fn is_handshake(&self) -> bool {
        self.kind() == Some(MessageType::ProtocolHandshake)
    }
}

/// How many header bytes to read and how many to skip after the size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderReadPlan {
    /// Header bytes to read after the size field.
    pub read: usize,
    /// Trailing header bytes from a newer peer to throw away.
    pub discard: usize,
}

impl HeaderReadPlan {
    /// Plan the second decoding phase.
    ///
    /// Fails if the remote header is shorter than its own size field.
    pub fn new(remote_header_size: u16, local_header_size: usize) -> Result<Self> {
        let remote = remote_header_size as usize;
        if remote < HEADER_SIZE_FIELD_LEN {
            return Err(PubSubError::Protocol(format!(
                "Received header length of {}, which is less than the minimal header size",
                remote
            )));
        }
        Ok(Self {
            read: remote.min(local_header_size) - HEADER_SIZE_FIELD_LEN,
            discard: remote.saturating_sub(local_header_size),
        })
    }
}

/// Payload of a `ProtocolHandshake` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandshakeMessage {
    pub protocol_version: u8,
}

impl HandshakeMessage {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1;

    /// Handshake carrying this build's protocol version.
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        [self.protocol_version]
    }

    /// Decode leniently: missing bytes keep defaults, extra bytes are ignored.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            protocol_version: buf.first().copied().unwrap_or_default(),
        }
    }
}
