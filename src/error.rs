//! Unified error handling for the nodescope crate
//!
//! Every storage failure is wrapped together with the name of the operation
//! that produced it, so a log line such as
//! `TakeCandidates failed: database is locked` is enough to tell which call
//! site hit contention.
//!
//! # Classification
//!
//! - Lookups that find nothing are not errors; they return `Ok(None)`.
//! - [`Error::is_conflict`] recognises transient storage contention
//!   (`SQLITE_BUSY` / `SQLITE_LOCKED`). Callers may retry the whole
//!   operation with backoff when it holds.
//! - Everything else is a hard failure at this layer.

use std::io;
use thiserror::Error;

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transient lock contention, retryable with backoff
    Conflict,
    /// Storage engine and I/O errors
    Storage,
    /// Persisted data that cannot be decoded
    Data,
    /// Operation abandoned by its caller
    Cancelled,
    /// Configuration and validation errors
    Config,
}

/// Unified error type for the nodescope crate
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite failure, tagged with the failing operation
    #[error("{op} failed: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Stored data could not be decoded
    #[error("{op} failed: malformed stored data: {reason}")]
    MalformedData { op: &'static str, reason: String },

    /// The caller dropped the operation before it committed
    #[error("{op} cancelled before commit")]
    Cancelled { op: &'static str },

    /// No pooled connection could be checked out
    #[error("{op} failed to get a connection: {source}")]
    Pool {
        op: &'static str,
        #[source]
        source: deadpool_sqlite::PoolError,
    },

    /// The connection pool could not be built
    #[error("Pool build error: {0}")]
    PoolBuild(#[from] deadpool_sqlite::BuildError),

    /// A blocking storage worker panicked or was aborted
    #[error("{op} worker failed: {reason}")]
    Interact { op: &'static str, reason: String },

    /// A lock protecting in-memory state was poisoned
    #[error("{op} failed: store lock poisoned")]
    Poisoned { op: &'static str },

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TOML parse errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap a database error with the name of the failing operation
    pub fn database(op: &'static str, source: rusqlite::Error) -> Self {
        Self::Database { op, source }
    }

    /// Create a malformed-data error
    pub fn malformed(op: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedData {
            op,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Wrap a failed pool checkout
    pub fn pool(op: &'static str, source: deadpool_sqlite::PoolError) -> Self {
        Self::Pool { op, source }
    }

    /// Wrap a worker that panicked or was aborted before returning
    pub fn interact(op: &'static str, err: deadpool_sqlite::InteractError) -> Self {
        Self::Interact {
            op,
            reason: err.to_string(),
        }
    }

    /// Check whether this is the storage engine's "too busy / locked" signal
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Database { source, .. }
            | Self::Pool {
                source: deadpool_sqlite::PoolError::Backend(source),
                ..
            }
            | Self::Pool {
                source:
                    deadpool_sqlite::PoolError::PostCreateHook(deadpool_sqlite::HookError::Backend(
                        source,
                    )),
                ..
            } => is_busy(source),
            _ => false,
        }
    }

    /// Check if this error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        self.is_conflict()
    }

    /// Get the error category for handling strategies
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Database { .. } if self.is_conflict() => ErrorCategory::Conflict,
            Self::Pool { .. } if self.is_conflict() => ErrorCategory::Conflict,
            Self::Database { .. }
            | Self::Pool { .. }
            | Self::PoolBuild(_)
            | Self::Interact { .. }
            | Self::Poisoned { .. }
            | Self::Io(_) => ErrorCategory::Storage,
            Self::MalformedData { .. } | Self::Json(_) => ErrorCategory::Data,
            Self::Cancelled { .. } => ErrorCategory::Cancelled,
            Self::Config(_) | Self::Toml(_) => ErrorCategory::Config,
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::ffi;

    fn sqlite_failure(code: i32) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn test_busy_is_conflict() {
        let err = Error::database("TakeCandidates", sqlite_failure(ffi::SQLITE_BUSY));
        assert!(err.is_conflict());
        assert!(err.is_recoverable());
        assert_eq!(err.category(), ErrorCategory::Conflict);
    }

    #[test]
    fn test_locked_is_conflict() {
        let err = Error::database("MarkTakenNodes", sqlite_failure(ffi::SQLITE_LOCKED));
        assert!(err.is_conflict());
    }

    #[test]
    fn test_other_database_errors_are_not_conflicts() {
        let err = Error::database("FindNodeAddr", sqlite_failure(ffi::SQLITE_CORRUPT));
        assert!(!err.is_conflict());
        assert_eq!(err.category(), ErrorCategory::Storage);

        let err = Error::database("FindNodeAddr", rusqlite::Error::QueryReturnedNoRows);
        assert!(!err.is_conflict());
    }

    #[test]
    fn test_busy_while_connecting_is_conflict() {
        let err = Error::pool(
            "TakeCandidates",
            deadpool_sqlite::PoolError::Backend(sqlite_failure(ffi::SQLITE_BUSY)),
        );
        assert!(err.is_conflict());
        assert_eq!(err.category(), ErrorCategory::Conflict);

        let err = Error::pool(
            "TakeCandidates",
            deadpool_sqlite::PoolError::PostCreateHook(deadpool_sqlite::HookError::Backend(
                sqlite_failure(ffi::SQLITE_LOCKED),
            )),
        );
        assert!(err.is_conflict());

        let err = Error::pool("TakeCandidates", deadpool_sqlite::PoolError::Closed);
        assert!(!err.is_conflict());
        assert_eq!(err.category(), ErrorCategory::Storage);
    }

    #[test]
    fn test_non_database_errors_are_not_conflicts() {
        assert!(!Error::malformed("FindNodeAddr", "bad ip").is_conflict());
        assert!(!Error::Cancelled { op: "TakeCandidates" }.is_conflict());
        assert!(!Error::config("empty path").is_recoverable());
    }

    #[test]
    fn test_message_names_operation() {
        let err = Error::database("UpdatePingError", sqlite_failure(ffi::SQLITE_BUSY));
        assert!(err.to_string().starts_with("UpdatePingError failed"));

        let err = Error::malformed("FindNodeAddr", "unparsable IPv4 'x'");
        assert_eq!(
            err.to_string(),
            "FindNodeAddr failed: malformed stored data: unparsable IPv4 'x'"
        );
    }
}
