//! Error types for the sync engine

use dsync_core::ErrorCode;
use dsync_protocol::ProtocolError;
use dsync_transport::TransportError;
use thiserror::Error;

/// Engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Plugin already registered: {0}")]
    DuplicatePlugin(String),

    #[error("Plugin {name} failed to initialize: {message}")]
    Plugin { name: String, message: String },

    #[error("Engine is stopped")]
    Stopped,

    #[error("Core error: {0}")]
    Core(#[from] dsync_core::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl EngineError {
    /// Taxonomy code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidOptions(_) | EngineError::DuplicatePlugin(_) | EngineError::Plugin { .. } => {
                ErrorCode::Validation
            }
            EngineError::Stopped => ErrorCode::Application,
            EngineError::Core(e) => e.code(),
            EngineError::Protocol(_) => ErrorCode::Validation,
            EngineError::Transport(e) => e.code(),
        }
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
