//! Length-prefixed framing for byte-stream channels.
//!
//! Each frame is a 4-byte big-endian payload length followed by the payload
//! (one MsgPack-encoded envelope):
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| payload (length bytes)    |
//! +----------------+---------------------------+
//! ```
//!
//! [`FrameBuffer`] accumulates partial reads with a two-state machine:
//! - `WaitingForLength`: need at least 4 bytes
//! - `WaitingForPayload`: length parsed, need N more bytes

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum payload size (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForLength,
    WaitingForPayload { remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a frame buffer with the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame payloads.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a frame announces more than the maximum size.
    /// The buffer is unusable afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let length = self.buffer.get_u32();
                    if length > self.max_frame_size {
                        return Err(RpcError::Protocol(format!(
                            "frame size {} exceeds maximum {}",
                            length, self.max_frame_size
                        )));
                    }

                    self.state = State::WaitingForPayload { remaining: length };
                }

                State::WaitingForPayload { remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForLength;
                    return Ok(Some(payload));
                }
            }
        }
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is pending, length prefix included.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForLength)
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Prefix a payload with its length.
///
/// # Errors
///
/// Returns `Protocol` if the payload does not fit a u32 length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let length = u32::try_from(payload.len()).map_err(|_| {
        RpcError::Protocol(format!("payload of {} bytes is too large", payload.len()))
    })?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.put_u32(length);
    frame.extend_from_slice(payload);
    Ok(frame.freeze())
}
