//! Error types for BeaverDB
//!
//! This module defines the unified error type used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ### Error Categories
//!
//! - **Invalid Argument**: empty names, non-positive TTLs, bad slice steps
//! - **Not Found**: dict/blob key misses, list indices out of bounds
//! - **Timeout / Empty**: blocking operations that ran out of time or items
//! - **Vector**: dimension drift and corrupted vector bytes
//! - **Lifecycle**: closed handles, in-memory handles crossing threads
//! - **Storage**: any substrate error, surfaced verbatim
//!
//! Version skew on reopen is a `tracing` warning, not an error; the handle
//! keeps working.

use thiserror::Error;

/// Result type alias for BeaverDB operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the BeaverDB store
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid caller input: empty name, non-positive TTL or poll interval,
    /// unsupported slice step, non-byte blob payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A dict or blob key required to exist does not.
    #[error("key '{key}' not found in '{namespace}'")]
    KeyNotFound {
        /// Namespace (dict or blob store name) that was consulted
        namespace: String,
        /// The missing key
        key: String,
    },

    /// List index beyond the current bounds.
    #[error("index {index} out of range for list of length {len}")]
    IndexOutOfRange {
        /// The offending index as given by the caller
        index: i64,
        /// Length of the list at the time of the access
        len: usize,
    },

    /// Non-blocking queue retrieval found no items.
    #[error("queue '{0}' is empty")]
    Empty(String),

    /// A blocking operation (lock acquire, queue get) exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A vector write or query did not match the collection's dimension.
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch {
        /// Dimension inferred from the first vector seen
        expected: usize,
        /// Dimension of the offending vector
        got: usize,
    },

    /// Stored bytes cannot be decoded (vector blob length not a multiple
    /// of 4, metadata JSON that fails to parse).
    #[error("corrupted data: {0}")]
    Corruption(String),

    /// Operation attempted on a closed database handle.
    #[error("database handle is closed")]
    Closed,

    /// An in-memory database used from a thread other than its creator.
    #[error("misuse: {0}")]
    Misuse(String),

    /// Substrate error, surfaced verbatim.
    #[error("storage error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True when the error is an integrity-constraint violation from the
    /// substrate. The log and lock managers use this to drive their
    /// timestamp-collision retries.
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}
