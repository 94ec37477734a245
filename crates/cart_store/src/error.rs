//! Error types for the cart store.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend cannot provide a change feed at all.
    #[error("Change feed unsupported: {0}")]
    FeedUnsupported(String),

    /// An open change feed broke.
    #[error("Change feed failed: {0}")]
    Feed(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
