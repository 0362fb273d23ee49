//! Gateway error types.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Engine-level failure.
    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Outbound connection queue closed.
    #[error("connection send queue closed")]
    ChannelSend,
}

impl GatewayError {
    /// Stable error code for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Engine(err) => err.code(),
            GatewayError::Json(_) => "BAD_MESSAGE",
            GatewayError::ChannelSend => "SEND_FAILED",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
