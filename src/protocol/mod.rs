//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing shared by both sides:
//! - 12-byte self-describing header encoding/decoding
//! - Two-phase header decoding tolerant of older and newer peers
//! - Incremental frame decoder for accumulating partial reads

mod frame;
mod frame_decoder;
mod wire_format;

pub use frame::{build_frame, encode_frame_into, handshake_frame, Frame};
pub use frame_decoder::FrameDecoder;
pub use wire_format::{
    HandshakeMessage, Header, HeaderReadPlan, MessageType, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
    HEADER_SIZE_FIELD_LEN, PROTOCOL_VERSION,
};
