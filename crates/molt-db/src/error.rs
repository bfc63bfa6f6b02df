//! Error taxonomy for the DB subsystem, mirroring the terminal statuses a
//! dispatcher response can carry.

use thiserror::Error;

/// A single-line, transport-safe error. Never carries a backtrace or the
/// underlying driver's `Display` verbatim when that could leak connection
/// strings or query text.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("pool busy: no connection available within max_wait_ms")]
    Busy,
    #[error("query timed out")]
    Timeout,
    #[error("query cancelled")]
    Cancelled,
    #[error("internal db error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        DbError::Internal(err.to_string())
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            DbError::Internal("connection closed".to_string())
        } else {
            DbError::Internal(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::ExecuteReturnedResults => {
                DbError::InvalidInput("query returned rows via exec".to_string())
            }
            other => DbError::Internal(other.to_string()),
        }
    }
}
