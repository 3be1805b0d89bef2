//! Error types for event-invoke.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all invoke/callee operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// A registration entry had no usable name.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// `listen()` was called a second time on the same callee.
    #[error("callee is already listening")]
    AlreadyListening,

    /// The method name passed to `invoke()` was empty.
    #[error("bad method name to invoke")]
    InvalidMethodName,

    /// The channel reported itself disconnected, or the invoker was destroyed.
    #[error("channel is not connected")]
    NotConnected,

    /// The remote side has no function under the requested name.
    #[error("{0}")]
    UnregisteredFunction(String),

    /// The remote function failed; only its message crosses the channel.
    #[error("{0}")]
    RemoteInvocationFailure(String),

    /// No response arrived before the call's deadline.
    #[error("method \"{name}\" timed out after {}ms", timeout.as_millis())]
    Timeout { name: String, timeout: Duration },

    /// The invoker was destroyed while the call was still outstanding.
    #[error("call to \"{name}\" rejected by destroy()")]
    DestroyedWhilePending { name: String },

    /// Transport-level failure reported by the channel.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error during pipe/process operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON value conversion error (arguments or results).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (oversized frame, broken framing).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Failure reported through a channel's error event.
///
/// `Clone` because a channel fans each event out to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The link was already closed when it was used.
    #[error("channel closed")]
    ChannelClosed,

    /// The peer went away mid-write.
    #[error("broken pipe")]
    BrokenPipe,

    /// Any other I/O failure.
    #[error("I/O error ({kind:?}): {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The byte stream violated the framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the default error policy swallows this error.
    ///
    /// Only "already closed" and "broken pipe" class errors are benign.
    pub fn is_benign(&self) -> bool {
        matches!(self, TransportError::ChannelClosed | TransportError::BrokenPipe)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match err.kind() {
            ErrorKind::BrokenPipe => TransportError::BrokenPipe,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof => {
                TransportError::ChannelClosed
            }
            kind => TransportError::Io {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl From<RpcError> for TransportError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Transport(e) => e,
            RpcError::Io(e) => e.into(),
            RpcError::Protocol(msg) => TransportError::Protocol(msg),
            other => TransportError::Codec(other.to_string()),
        }
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
