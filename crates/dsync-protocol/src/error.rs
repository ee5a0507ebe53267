//! Protocol error types

use thiserror::Error;

/// Envelope encoding and decoding errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Compression error: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] dsync_core::Error),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
