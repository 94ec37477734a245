//! Gateway error types.

use axum::extract::ws::Message;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Store read or change feed error.
    #[error("Store error: {0}")]
    Store(#[from] cart_store::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or missing configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound channel closed or full.
    #[error("Channel send error")]
    ChannelSend,
}

impl From<TrySendError<Message>> for GatewayError {
    fn from(_: TrySendError<Message>) -> Self {
        GatewayError::ChannelSend
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
