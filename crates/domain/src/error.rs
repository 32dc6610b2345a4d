/// Shared error type used across all kernel crates.
///
/// Variants map onto the behavior taxonomy, not onto individual failure
/// sites: callers match on `kind()` (or the variant directly) to decide
/// whether to retry, surface verbatim, or classify a task as `cancelled`
/// vs `failed`.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("deadline exceeded: {0}")]
    Deadline(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for errors the §7 taxonomy classifies as retryable store
    /// contention (`Busy`), as opposed to everything else which is
    /// surfaced verbatim.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
            || matches!(self, Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::DatabaseBusy)
    }

    /// True for errors that should classify an in-flight task as
    /// `cancelled` rather than `failed`.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled(_) | Error::Deadline(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
