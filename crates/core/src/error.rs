//! Unified error types for quire.
//!
//! Every failure that crosses the engine boundary is classified into an
//! [`ErrorKind`] so retry decisions never depend on inspecting messages.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rusqlite::rusqlite::{self, ErrorCode};

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The requested record does not exist.
    NotFound,
    /// Network or connection problem that may succeed on a later attempt.
    Transient,
    /// The caller supplied invalid input. Retrying will not help.
    Validation,
    /// The operation exceeded its deadline.
    Timeout,
    /// Anything that could not be classified.
    Unknown,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may be retried.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient | ErrorKind::Timeout)
    }

    /// Upper-case code used in error messages and logs.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Transient => "TRANSIENT",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

/// Unified error type for the engine.
///
/// `Clone` so that one in-flight fetch can hand the same failure to all of
/// its joiners.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Record not found at the data source.
    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Retryable network/connection failure.
    #[error("TRANSIENT: {0}")]
    Transient(String),

    /// Caller input rejected by the data source.
    #[error("VALIDATION: {0}")]
    Validation(String),

    /// Deadline exceeded.
    #[error("TIMEOUT: {0}")]
    Timeout(String),

    /// Unclassified failure.
    #[error("UNKNOWN: {0}")]
    Unknown(String),

    /// SQLite operation failed.
    #[error("DATABASE: {0}")]
    Database(Arc<rusqlite::Error>),
}

impl Error {
    /// Build an error of the given kind.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::NotFound => Error::NotFound(message),
            ErrorKind::Transient => Error::Transient(message),
            ErrorKind::Validation => Error::Validation(message),
            ErrorKind::Timeout => Error::Timeout(message),
            ErrorKind::Unknown => Error::Unknown(message),
        }
    }

    /// Classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Validation(_) => ErrorKind::Validation,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Unknown(_) => ErrorKind::Unknown,
            Error::Database(e) => classify_sqlite(e),
        }
    }

    /// Shorthand for `self.kind().is_retryable()`.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

fn classify_sqlite(err: &rusqlite::Error) -> ErrorKind {
    match err {
        rusqlite::Error::QueryReturnedNoRows => return ErrorKind::NotFound,
        rusqlite::Error::InvalidParameterName(_)
        | rusqlite::Error::InvalidParameterCount(_, _)
        | rusqlite::Error::InvalidColumnName(_)
        | rusqlite::Error::InvalidColumnIndex(_)
        | rusqlite::Error::InvalidColumnType(_, _, _)
        | rusqlite::Error::ExecuteReturnedResults
        | rusqlite::Error::MultipleStatement => return ErrorKind::Validation,
        _ => {}
    }

    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => ErrorKind::Transient,
        Some(ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig) => ErrorKind::Validation,
        Some(ErrorCode::NotFound) => ErrorKind::NotFound,
        _ => ErrorKind::Unknown,
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(Arc::new(err))
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Unknown("database connection closed".into()),
            tokio_rusqlite::Error::Close((_, e)) => Error::from(e),
            _ => Error::Unknown("database connection closed".into()),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => Error::from(e),
            tokio_rusqlite::Error::ConnectionClosed => Error::Unknown("database connection closed".into()),
            tokio_rusqlite::Error::Close((_, e)) => Error::from(e),
            _ => Error::Unknown("database connection closed".into()),
        }
    }
}
