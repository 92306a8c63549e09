//! Error taxonomy for the storage engine (spec §7).
//!
//! Mirrors the teacher crate's `DataStoreError`: a flat enum with a
//! human-readable `Display`, a `std::error::Error` impl, and a `From<sqlx::Error>`
//! conversion, so callers can `?` straight out of a `sqlx` call.

use thiserror::Error;

/// Errors surfaced by entity, query, cache, and hook operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Empty/malformed id, unknown component, or an incompatible filter operator.
    #[error("validation error: {0}")]
    Validation(String),

    /// The requested entity or component does not exist.
    #[error("not found")]
    NotFound,

    /// A component insert would violate the single-live-per-type invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Connection loss or serialization failure; safe to retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// The operation exceeded `save_timeout_ms` or a statement deadline.
    #[error("operation timed out")]
    Timeout,

    /// The operation was canceled via its deadline/cancellation signal.
    #[error("operation canceled")]
    Canceled,

    /// The cache provider failed; callers should fall through to the database.
    #[error("cache error: {0}")]
    Cache(String),

    /// One or more lifecycle hooks failed; never fails the originating write.
    #[error("{successful}/{total} hooks succeeded ({failed} failed)")]
    Hook {
        /// Total hooks dispatched.
        total: usize,
        /// Hooks that completed successfully.
        successful: usize,
        /// Hooks that failed or timed out.
        failed: usize,
    },

    /// Registry mismatch or partitioning DDL failure during startup.
    #[error("fatal startup error: {0}")]
    Fatal(String),
}

impl EngineError {
    /// True for errors a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_) | EngineError::Timeout)
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => EngineError::NotFound,
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                EngineError::Conflict(db_err.to_string())
            }
            sqlx::Error::PoolTimedOut => EngineError::Timeout,
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => EngineError::Transient(e.to_string()),
            other => EngineError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Validation(format!("invalid component payload: {e}"))
    }
}

impl From<crate::id::IdParseError> for EngineError {
    fn from(e: crate::id::IdParseError) -> Self {
        EngineError::Validation(e.to_string())
    }
}

/// Crate-wide result alias.
pub type EngineResult<T> = Result<T, EngineError>;
