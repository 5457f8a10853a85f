//! Error types and result aliases for Landfall.
//!
//! This module defines the shared error type used by the storage layer and
//! everything built on it. Errors carry enough context to decide whether a
//! call is worth retrying.

use std::fmt;

/// The result type used throughout Landfall.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Landfall storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A path or object was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A precondition for the operation was not met.
    #[error("precondition failed: {message}")]
    PreconditionFailed {
        /// Description of the failed precondition.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// Whether the failure is worth retrying (throttling, 5xx, connection reset).
        transient: bool,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new (non-transient) storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: false,
            source: None,
        }
    }

    /// Creates a transient storage error that callers may retry.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            transient: true,
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        transient: bool,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            transient,
            source: Some(Box::new(source)),
        }
    }

    /// Creates a not-found error for an object key.
    #[must_use]
    pub fn not_found(key: impl fmt::Display) -> Self {
        Self::NotFound(format!("object not found: {key}"))
    }

    /// Returns true if the failed call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                transient: true,
                ..
            }
        )
    }

    /// Returns true if this error reports a missing object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Classifies an HTTP status code as transient for retry purposes.
///
/// Request timeouts, throttling and server-side failures are transient;
/// everything else is a caller error and is surfaced immediately.
#[must_use]
pub const fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
