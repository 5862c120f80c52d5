//! Error taxonomy
//!
//! Every failure that crosses a component boundary is translated into a
//! [`MediaError`]. The UI layer receives one message per failed operation
//! plus a machine-readable [`ErrorKind`] for conditional handling.

use crate::s3::StorageError;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Machine-readable error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    UploadInit,
    StorageUnavailable,
    StorageRejected,
    IncompleteUpload,
    PartTooSmall,
    Transfer,
    NotFound,
    Timeout,
}

impl ErrorKind {
    /// Stable label used in logs, metrics and API payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_error",
            ErrorKind::UploadInit => "upload_init_error",
            ErrorKind::StorageUnavailable => "storage_unavailable",
            ErrorKind::StorageRejected => "storage_rejected",
            ErrorKind::IncompleteUpload => "incomplete_upload",
            ErrorKind::PartTooSmall => "part_too_small",
            ErrorKind::Transfer => "transfer_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media upload errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Upload session not found: {0}")]
    SessionNotFound(String),

    #[error("Upload session {key} is {status} and accepts no further changes")]
    SessionClosed { key: String, status: String },

    #[error("Failed to initialize multipart upload: {0}")]
    UploadInit(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Storage rejected request ({code}): {message}")]
    StorageRejected { code: String, message: String },

    #[error("Upload incomplete: missing parts {missing:?}")]
    IncompleteUpload { missing: Vec<u32> },

    #[error("Part too small: {0}")]
    PartTooSmall(String),

    #[error("Transfer of part {part_number} failed after {attempts} attempt(s): {message}")]
    Transfer {
        part_number: u32,
        attempts: u32,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl MediaError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MediaError::Validation(_)
            | MediaError::InvalidArgument(_)
            | MediaError::SessionClosed { .. } => ErrorKind::Validation,
            MediaError::SessionNotFound(_) | MediaError::NotFound(_) => ErrorKind::NotFound,
            MediaError::UploadInit(_) => ErrorKind::UploadInit,
            MediaError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            MediaError::StorageRejected { .. } => ErrorKind::StorageRejected,
            MediaError::IncompleteUpload { .. } => ErrorKind::IncompleteUpload,
            MediaError::PartTooSmall(_) => ErrorKind::PartTooSmall,
            MediaError::Transfer { .. } => ErrorKind::Transfer,
            MediaError::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether a caller may sensibly offer "retry" for this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UploadInit
                | ErrorKind::StorageUnavailable
                | ErrorKind::IncompleteUpload
                | ErrorKind::Transfer
                | ErrorKind::Timeout
        )
    }

    /// Whether the failure is transient and safe to retry locally for
    /// idempotent operations
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::StorageUnavailable | ErrorKind::Transfer
        )
    }
}

impl From<StorageError> for MediaError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => MediaError::NotFound(key),
            StorageError::Unavailable(msg) => MediaError::StorageUnavailable(msg),
            StorageError::Rejected { code, message } if code == "EntityTooSmall" => {
                MediaError::PartTooSmall(message)
            }
            StorageError::Rejected { code, message } => {
                MediaError::StorageRejected { code, message }
            }
            StorageError::Signing(msg) => MediaError::StorageRejected {
                code: "SigningFailed".into(),
                message: msg,
            },
            StorageError::Config(msg) => MediaError::Validation(msg),
        }
    }
}

/// Result alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            MediaError::InvalidArgument("x".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            MediaError::SessionNotFound("k".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            MediaError::IncompleteUpload { missing: vec![3] }.kind(),
            ErrorKind::IncompleteUpload
        );
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(MediaError::StorageUnavailable("down".into()).is_retryable());
        assert!(MediaError::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(!MediaError::Validation("bad".into()).is_retryable());
        assert!(!MediaError::PartTooSmall("tiny".into()).is_retryable());
    }

    #[test]
    fn test_transient_only_for_idempotent_retries() {
        assert!(MediaError::StorageUnavailable("down".into()).is_transient());
        assert!(MediaError::Transfer {
            part_number: 1,
            attempts: 1,
            message: "reset".into()
        }
        .is_transient());
        assert!(!MediaError::IncompleteUpload { missing: vec![1] }.is_transient());
        assert!(!MediaError::Timeout(Duration::from_secs(1)).is_transient());
    }

    #[test]
    fn test_entity_too_small_becomes_part_too_small() {
        let err: MediaError = StorageError::Rejected {
            code: "EntityTooSmall".into(),
            message: "Your proposed upload is smaller than the minimum allowed size".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::PartTooSmall);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(ErrorKind::Transfer.as_str(), "transfer_error");
        assert_eq!(
            serde_json::to_string(&ErrorKind::IncompleteUpload).unwrap(),
            "\"incomplete_upload\""
        );
    }
}
