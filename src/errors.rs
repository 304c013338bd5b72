use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;
use uuid::Uuid;

/// Failures raised by the upload core. Every variant is scoped to a single
/// session or a single file; none of them is fatal to the process.
#[derive(Debug, Error)]
pub enum UploadError {
    /// Unknown or expired session. Callers cannot tell the two apart.
    #[error("upload session `{0}` not found")]
    SessionNotFound(Uuid),
    #[error("upload session `{0}` is already completed")]
    SessionCompleted(Uuid),
    /// Chunks are frozen while the session is being assembled.
    #[error("upload session `{0}` is being assembled")]
    AssemblyInProgress(Uuid),
    #[error("chunk index {index} out of range (total chunks: {total})")]
    ChunkIndexOutOfRange { index: u32, total: u32 },
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("missing chunks: {0:?}")]
    MissingChunks(Vec<u32>),
    #[error("invalid size {size}: {reason}")]
    InvalidSize { size: u64, reason: String },
    #[error("file `{0}` not found")]
    FileNotFound(Uuid),
    #[error("invalid list cursor `{0}`")]
    InvalidCursor(String),
    #[error("file `{id}` is suspended: {reason}")]
    FileSuspended { id: Uuid, reason: String },
    /// Underlying filesystem error. Always safe to retry.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

impl UploadError {
    pub(crate) fn invalid_size(size: u64, reason: impl Into<String>) -> Self {
        Self::InvalidSize {
            size,
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AssemblyInProgress(_) | Self::StorageFailure(_) | Self::Database(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_) | Self::FileNotFound(_) => StatusCode::NOT_FOUND,
            Self::SessionCompleted(_) | Self::AssemblyInProgress(_) => StatusCode::CONFLICT,
            Self::ChunkIndexOutOfRange { .. }
            | Self::MissingChunks(_)
            | Self::InvalidCursor(_) => StatusCode::BAD_REQUEST,
            Self::InvalidSize { size, .. } if *size > 0 => StatusCode::PAYLOAD_TOO_LARGE,
            Self::InvalidSize { .. } => StatusCode::BAD_REQUEST,
            Self::SizeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::FileSuspended { .. } => StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS,
            Self::StorageFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = err.status_code();
        if status.is_server_error() {
            tracing::error!(error = %err, "upload request failed");
        }
        AppError::new(status, err.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let id = Uuid::new_v4();
        assert_eq!(
            UploadError::SessionNotFound(id).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            UploadError::MissingChunks(vec![2]).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            UploadError::invalid_size(0, "empty").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            UploadError::invalid_size(10, "too large").status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }

    #[test]
    fn test_only_infrastructure_errors_are_retryable() {
        let io_err = io::Error::new(io::ErrorKind::Other, "disk full");
        assert!(UploadError::from(io_err).is_retryable());
        assert!(UploadError::AssemblyInProgress(Uuid::new_v4()).is_retryable());
        assert!(!UploadError::MissingChunks(vec![0]).is_retryable());
        assert!(
            !UploadError::SizeMismatch {
                expected: 3,
                actual: 2
            }
            .is_retryable()
        );
    }
}
