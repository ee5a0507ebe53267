//! Error types for DSync Core

use crate::element::ElementId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Element not found: {0}")]
    NotFound(ElementId),

    #[error("Model rejected {operation} on {element_id}: {message}")]
    Application {
        element_id: ElementId,
        operation: Operation,
        message: String,
    },

    #[error("Extraction failed for {element_id}: {message}")]
    Extraction { element_id: ElementId, message: String },

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Taxonomy code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Validation(_) | Error::Serialization(_) => ErrorCode::Validation,
            Error::NotFound(_) => ErrorCode::NotFound,
            Error::Application { .. } | Error::Model(_) => ErrorCode::Application,
            Error::Extraction { .. } => ErrorCode::Extraction,
        }
    }
}

/// Result type alias for DSync Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by a diagram model's mutation primitives
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Element not found: {0}")]
    NotFound(ElementId),

    #[error("Element already exists: {0}")]
    AlreadyExists(ElementId),

    #[error("Invalid operation on {id}: {reason}")]
    Invalid { id: ElementId, reason: String },

    #[error("Mutation rejected for {0}")]
    Rejected(ElementId),
}

/// Result type alias for diagram model primitives
pub type ModelResult<T> = std::result::Result<T, ModelError>;

/// Error taxonomy shared by every layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Malformed diff or context; never retried
    Validation,
    /// Missing target, parent or endpoint
    NotFound,
    /// A model mutation primitive failed
    Application,
    /// Shared-map send/receive failure
    Transport,
    /// Snapshot extraction failure
    Extraction,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Validation => "VALIDATION_ERROR",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Application => "APPLICATION_ERROR",
            ErrorCode::Transport => "TRANSPORT_ERROR",
            ErrorCode::Extraction => "EXTRACTION_ERROR",
        }
    }

    /// Whether callers may retry an operation that failed with this code
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorCode::NotFound | ErrorCode::Transport)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The operation an error or warning refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Validate,
    Add,
    Modify,
    Remove,
    Retry,
    Rollback,
    Extract,
    Calculate,
    Send,
    Receive,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Validate => "validate",
            Operation::Add => "add",
            Operation::Modify => "modify",
            Operation::Remove => "remove",
            Operation::Retry => "retry",
            Operation::Rollback => "rollback",
            Operation::Extract => "extract",
            Operation::Calculate => "calculate",
            Operation::Send => "send",
            Operation::Receive => "receive",
        };
        f.write_str(s)
    }
}

/// One failed operation, as reported in a `SyncResult`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationError {
    pub code: ErrorCode,
    pub message: String,
    pub element_id: Option<ElementId>,
    pub operation: Operation,
    pub recoverable: bool,
}

impl OperationError {
    pub fn new(code: ErrorCode, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            element_id: None,
            operation,
            recoverable: code.is_recoverable(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, Operation::Validate, message)
    }

    pub fn with_element(mut self, id: impl Into<ElementId>) -> Self {
        self.element_id = Some(id.into());
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    /// Build the record for a failed model primitive
    pub fn from_model(err: &ModelError, operation: Operation, id: &ElementId) -> Self {
        let code = match err {
            ModelError::NotFound(_) => ErrorCode::NotFound,
            _ => ErrorCode::Application,
        };
        Self::new(code, operation, err.to_string()).with_element(id.clone())
    }
}

impl std::fmt::Display for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.element_id {
            Some(id) => write!(f, "[{}] {} {}: {}", self.code, self.operation, id, self.message),
            None => write!(f, "[{}] {}: {}", self.code, self.operation, self.message),
        }
    }
}

impl From<&Error> for OperationError {
    fn from(err: &Error) -> Self {
        let (element_id, operation) = match err {
            Error::NotFound(id) => (Some(id.clone()), Operation::Modify),
            Error::Application { element_id, operation, .. } => (Some(element_id.clone()), *operation),
            Error::Extraction { element_id, .. } => (Some(element_id.clone()), Operation::Extract),
            _ => (None, Operation::Validate),
        };
        let mut op = OperationError::new(err.code(), operation, err.to_string());
        op.element_id = element_id;
        op
    }
}

/// A skipped operation that did not fail the call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncWarning {
    pub code: ErrorCode,
    pub message: String,
    pub element_id: Option<ElementId>,
    pub operation: Operation,
}

impl SyncWarning {
    pub fn not_found(operation: Operation, id: &ElementId, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: message.into(),
            element_id: Some(id.clone()),
            operation,
        }
    }

    pub fn skipped(operation: Operation, id: &ElementId, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Validation,
            message: message.into(),
            element_id: Some(id.clone()),
            operation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::Validation.as_str(), "VALIDATION_ERROR");
        assert!(!ErrorCode::Validation.is_recoverable());
        assert!(ErrorCode::NotFound.is_recoverable());
        assert!(ErrorCode::Transport.is_recoverable());
    }

    #[test]
    fn test_operation_error_from_model() {
        let id = ElementId::from("s1");
        let err = OperationError::from_model(&ModelError::Rejected(id.clone()), Operation::Add, &id);
        assert_eq!(err.code, ErrorCode::Application);
        assert_eq!(err.element_id, Some(id));
        assert!(!err.recoverable);

        let missing = OperationError::from_model(
            &ModelError::NotFound("s2".into()),
            Operation::Modify,
            &"s2".into(),
        );
        assert_eq!(missing.code, ErrorCode::NotFound);
        assert!(missing.recoverable);
    }
}
