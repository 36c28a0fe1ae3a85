//! Incremental decoder for the self-describing frame format.
//!
//! Uses `bytes::BytesMut` to accumulate socket reads and a state machine to
//! survive arbitrary fragmentation:
//! - `HeaderSize`: need the 2-byte `header_size` field
//! - `HeaderBody`: need the part of the remote header this peer understands
//! - `Discard`: skipping trailing header bytes sent by a newer peer
//! - `Payload`: copying payload bytes into a pooled buffer
//!
//! # Example
//!
//! ```
//! use tcp_pubsub::protocol::{build_frame, FrameDecoder, MessageType};
//! use tcp_pubsub::BufferPool;
//!
//! let mut decoder = FrameDecoder::new(BufferPool::new());
//! let bytes = build_frame(MessageType::RegularPayload, b"ping");
//!
//! assert!(decoder.push(&bytes[..5]).unwrap().is_empty());
//! let frames = decoder.push(&bytes[5..]).unwrap();
//! assert_eq!(frames[0].payload(), b"ping");
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{
    Header, HeaderReadPlan, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE, HEADER_SIZE_FIELD_LEN,
};
use super::Frame;
use crate::buffer_pool::{BufferPool, PooledBuffer};
use crate::error::{PubSubError, Result};

/// Initial capacity of the accumulation buffer.
const INITIAL_CAPACITY: usize = 16 * 1024;

/// State machine for frame parsing.
enum State {
    /// Waiting for the header size field.
    HeaderSize,
    /// Header size known, waiting for the header fields we understand.
    HeaderBody { header_size: u16, plan: HeaderReadPlan },
    /// Skipping header bytes this peer does not know about.
    Discard { header: Header, remaining: usize },
    /// Header complete, filling the payload buffer.
    Payload {
        header: Header,
        buffer: PooledBuffer,
        filled: usize,
    },
}

/// Decoder turning a byte stream into frames.
///
/// Payload buffers are taken from the injected [`BufferPool`].
pub struct FrameDecoder {
    /// Bytes received but not consumed yet.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Source of payload buffers.
    pool: BufferPool,
    /// Maximum accepted `data_size`.
    max_payload_size: u64,
}

impl FrameDecoder {
    /// Create a decoder with the default payload limit (1GB).
    pub fn new(pool: BufferPool) -> Self {
        Self::with_max_payload(pool, DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Create a decoder with a custom payload limit.
    pub fn with_max_payload(pool: BufferPool, max_payload_size: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::HeaderSize,
            pool,
            max_payload_size,
        }
    }

    /// Push data into the decoder and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a header is shorter than its own size field or
    /// announces a payload above the limit. The decoder must be discarded
    /// afterwards; the stream cannot be resynchronized.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Advance the state machine until one frame is complete or input runs out.
    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &mut self.state {
                State::HeaderSize => {
                    if self.buffer.len() < HEADER_SIZE_FIELD_LEN {
                        return Ok(None);
                    }
                    let header_size = self.buffer.get_u16_le();
                    let plan = HeaderReadPlan::new(header_size, HEADER_SIZE)?;
                    self.state = State::HeaderBody { header_size, plan };
                }

                State::HeaderBody { header_size, plan } => {
                    let (header_size, plan) = (*header_size, *plan);
                    if self.buffer.len() < plan.read {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(plan.read);
                    let header = Header::from_received(header_size, &body);

                    if header.data_size > self.max_payload_size {
                        return Err(PubSubError::Protocol(format!(
                            "Payload size {} exceeds maximum {}",
                            header.data_size, self.max_payload_size
                        )));
                    }

                    self.state = if plan.discard > 0 {
                        State::Discard {
                            header,
                            remaining: plan.discard,
                        }
                    } else {
                        begin_payload(&self.pool, header)
                    };
                }

                State::Discard { header, remaining } => {
                    let n = (*remaining).min(self.buffer.len());
                    self.buffer.advance(n);
                    *remaining -= n;
                    if *remaining > 0 {
                        return Ok(None);
                    }
                    let header = *header;
                    self.state = begin_payload(&self.pool, header);
                }

                State::Payload { buffer, filled, .. } => {
                    let n = (buffer.len() - *filled).min(self.buffer.len());
                    buffer[*filled..*filled + n].copy_from_slice(&self.buffer[..n]);
                    self.buffer.advance(n);
                    *filled += n;
                    if *filled < buffer.len() {
                        return Ok(None);
                    }

                    if let State::Payload { header, buffer, .. } =
                        std::mem::replace(&mut self.state, State::HeaderSize)
                    {
                        return Ok(Some(Frame::new(header, buffer.share())));
                    }
                }
            }
        }
    }

    /// Get the number of buffered, unconsumed bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if no unconsumed bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether the decoder sits between frames.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::HeaderSize) && self.buffer.is_empty()
    }

    /// Drop buffered bytes and any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::HeaderSize;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::HeaderSize => "HeaderSize",
            State::HeaderBody { .. } => "HeaderBody",
            State::Discard { .. } => "Discard",
            State::Payload { .. } => "Payload",
        }
    }
}

fn begin_payload(pool: &BufferPool, header: Header) -> State {
    let mut buffer = pool.allocate();
    // data_size was checked against the limit, which fits in usize.
    buffer.resize_for(header.data_size as usize);
    State::Payload {
        header,
        buffer,
        filled: 0,
    }
}
