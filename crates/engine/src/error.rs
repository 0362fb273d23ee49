//! Engine error types.

use crate::channel::ChannelId;
use crate::time::ChannelTime;
use thiserror::Error;

/// Engine error type.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Source payload type does not match the destination.
    #[error("payload type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    /// Update timestamp is earlier than the channel's last applied update.
    #[error("out-of-order update: {update} is earlier than {last}")]
    OutOfOrder {
        update: ChannelTime,
        last: ChannelTime,
    },

    /// Router lookup miss.
    #[error("no such channel: {0}")]
    NoSuchChannel(ChannelId),

    /// Sender lacks publish/subscribe rights.
    #[error("not authorized to {0}")]
    NotAuthorized(&'static str),

    /// Operation arrived after the channel began closing.
    #[error("channel {0} is closing")]
    ChannelClosing(ChannelId),

    /// InitData was called on a channel that already has data.
    #[error("channel {0} already has data")]
    AlreadyInitialized(ChannelId),

    /// Underlying marshal/unmarshal failure.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl EngineError {
    /// Stable error code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::TypeMismatch { .. } => "TYPE_MISMATCH",
            EngineError::OutOfOrder { .. } => "OUT_OF_ORDER",
            EngineError::NoSuchChannel(_) => "NO_SUCH_CHANNEL",
            EngineError::NotAuthorized(_) => "NOT_AUTHORIZED",
            EngineError::ChannelClosing(_) => "CHANNEL_CLOSING",
            EngineError::AlreadyInitialized(_) => "ALREADY_INITIALIZED",
            EngineError::Codec(_) => "CODEC_FAILURE",
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
