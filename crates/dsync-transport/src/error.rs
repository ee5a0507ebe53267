//! Transport error types

use dsync_core::ErrorCode;
use dsync_protocol::ProtocolError;
use thiserror::Error;

/// Shared-map send/receive errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Shared map is disconnected")]
    Disconnected,

    #[error("Shared map error: {0}")]
    Map(String),

    #[error("Send failed after {attempts} attempts: {message}")]
    RetriesExhausted { attempts: u32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport closed")]
    Closed,
}

impl TransportError {
    /// Taxonomy code; malformed payloads are validation errors, everything else is transport
    pub fn code(&self) -> ErrorCode {
        match self {
            TransportError::Protocol(_) | TransportError::Json(_) => ErrorCode::Validation,
            _ => ErrorCode::Transport,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::Map(_))
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
