//! Frame struct and frame builders.
//!
//! Represents a complete protocol frame with header and payload. Received
//! payloads live in pooled buffers so they can be handed to user callbacks
//! without another copy.
//!
//! # Example
//!
//! ```
//! use tcp_pubsub::protocol::{build_frame, MessageType, HEADER_SIZE};
//!
//! let bytes = build_frame(MessageType::RegularPayload, b"hello");
//! assert_eq!(bytes.len(), HEADER_SIZE + 5);
//! ```

use super::wire_format::{HandshakeMessage, Header, MessageType, HEADER_SIZE};
use crate::buffer_pool::{PooledBuffer, SharedBuffer};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header (as the peer sent it, truncated to the local layout).
    pub header: Header,
    /// Payload bytes.
    pub payload: SharedBuffer,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: SharedBuffer) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[inline]
    pub fn kind(&self) -> Option<MessageType> {
        self.header.kind()
    }

    #[inline]
    pub fn is_handshake(&self) -> bool {
        self.header.is_handshake()
    }
}

/// Build a complete frame as a single byte vector.
///
/// Used for small control frames; fan-out sends go through
/// [`encode_frame_into`] instead.
pub fn build_frame(kind: MessageType, payload: &[u8]) -> Vec<u8> {
    let header = Header::new(kind, payload.len() as u64);
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

/// Build a handshake frame carrying this build's protocol version.
pub fn handshake_frame() -> Vec<u8> {
    build_frame(
        MessageType::ProtocolHandshake,
        &HandshakeMessage::current().encode(),
    )
}

/// Encode one frame whose payload is the concatenation of `parts`.
///
/// The buffer is resized to fit exactly. Empty parts are skipped.
pub fn encode_frame_into(buf: &mut PooledBuffer, kind: MessageType, parts: &[&[u8]]) {
    let payload_len: usize = parts.iter().map(|part| part.len()).sum();
    buf.resize_for(HEADER_SIZE + payload_len);

    Header::new(kind, payload_len as u64).encode_into(&mut buf[..HEADER_SIZE]);

    let mut position = HEADER_SIZE;
    for part in parts.iter().filter(|part| !part.is_empty()) {
        buf[position..position + part.len()].copy_from_slice(part);
        position += part.len();
    }
}
