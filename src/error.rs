//! Error types for the order book synchronization engine

use thiserror::Error;

/// Order book synchronization errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BookSyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error frame (code {code:?}): {msg}")]
    ProtocolError { code: Option<i64>, msg: String },

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Malformed diff: {0}")]
    MalformedDiff(String),

    #[error("Precision {precision} outside of [{min}, {max}]")]
    PrecisionOutOfRange { precision: u8, min: u8, max: u8 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Sync engine is no longer running")]
    EngineStopped,
}

impl From<tokio_tungstenite::tungstenite::Error> for BookSyncError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BookSyncError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for BookSyncError {
    fn from(err: serde_json::Error) -> Self {
        BookSyncError::ParseError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BookSyncError>;
