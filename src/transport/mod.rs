//! Transport module - byte-stream channels.
//!
//! Provides:
//! - [`FrameBuffer`] / [`encode_frame`] - length-prefixed framing
//! - [`StreamChannel`] - framed MsgPack channel over any `AsyncRead`/`AsyncWrite`
//! - [`fork`] - spawn a child process and talk to it over its stdio

mod frame_buffer;
mod process;
mod stream;

pub use frame_buffer::{encode_frame, FrameBuffer, DEFAULT_MAX_FRAME_SIZE, LENGTH_PREFIX_SIZE};
pub use process::fork;
pub use stream::{StreamChannel, StreamConfig, DEFAULT_READ_BUFFER_SIZE};
