use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::{fmt, io};
use thiserror::Error;
use uuid::Uuid;

/// Every failure the metadata engine can report.
///
/// All variants are local to the failing call; nothing is retried internally
/// and the enclosing transaction is rolled back when the error propagates.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("bucket `{0}` is locked")]
    BucketLocked(Uuid),
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("file instance already set")]
    FileInstanceAlreadySet,
    #[error("file instance `{0}` is not readable")]
    FileInstanceUnreadable(Uuid),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("uniqueness violation: {0}")]
    UniqueViolation(String),
    #[error("no location `{0}`")]
    LocationNotFound(String),
    #[error("bucket `{0}` not found")]
    BucketNotFound(Uuid),
    #[error("file instance `{0}` not found")]
    FileNotFound(Uuid),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: Uuid, key: String },
    #[error("file of {size} bytes exceeds the bucket limit of {limit} bytes")]
    FileSizeLimitExceeded { size: i64, limit: i64 },
    #[error("bucket quota of {quota} bytes exceeded")]
    QuotaExceeded { quota: i64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Return true if SQLx error indicates a unique constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Lift unique constraint failures into [`StorageError::UniqueViolation`].
pub(crate) fn map_unique(err: sqlx::Error, what: impl Into<String>) -> StorageError {
    if is_unique_violation(&err) {
        StorageError::UniqueViolation(what.into())
    } else {
        StorageError::Sqlx(err)
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

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
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

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        let status = match &err {
            StorageError::Validation(_)
            | StorageError::InvalidKey(_)
            | StorageError::InvalidOperation(_)
            | StorageError::Precondition(_) => StatusCode::BAD_REQUEST,
            StorageError::BucketLocked(_) => StatusCode::FORBIDDEN,
            StorageError::FileInstanceAlreadySet | StorageError::UniqueViolation(_) => {
                StatusCode::CONFLICT
            }
            StorageError::FileInstanceUnreadable(_) => StatusCode::SERVICE_UNAVAILABLE,
            StorageError::LocationNotFound(_)
            | StorageError::BucketNotFound(_)
            | StorageError::FileNotFound(_)
            | StorageError::ObjectNotFound { .. } => StatusCode::NOT_FOUND,
            StorageError::FileSizeLimitExceeded { .. } | StorageError::QuotaExceeded { .. } => {
                StatusCode::PAYLOAD_TOO_LARGE
            }
            StorageError::Sqlx(_) | StorageError::Io(_) => {
                tracing::error!("storage failure: {}", err);
                return AppError::internal("internal storage error");
            }
        };
        AppError::new(status, err.to_string())
    }
}
