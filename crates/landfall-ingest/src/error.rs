//! Error types for the ingest engine.
//!
//! Every failure an invocation can end with maps to one variant here. The
//! dispatcher's caller uses [`IngestError::is_recoverable`] to decide between
//! a clean exit and a reported failure.

use crate::warehouse::WarehouseError;

/// The result type used throughout landfall-ingest.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors that can end the handling of one notification.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The marker was already claimed by another invocation.
    #[error("duplicate notification: {claim} already exists")]
    Duplicate {
        /// Key of the claim object that already exists.
        claim: String,
    },

    /// The key cannot be resolved to a destination table.
    #[error("key {key} does not match the destination pattern: {reason}")]
    PatternMismatch {
        /// Object key that failed to resolve.
        key: String,
        /// What was missing.
        reason: String,
    },

    /// A required config file is missing.
    #[error("missing config: {message}")]
    ConfigMissing {
        /// Description of what is missing.
        message: String,
    },

    /// More than one wildcard config matched in a single `_config/` directory.
    #[error("conflicting config files in {directory}: {matches:?}")]
    ConfigConflict {
        /// The `_config/` directory with multiple matches.
        directory: String,
        /// The matching object keys.
        matches: Vec<String>,
    },

    /// The success marker's prefix holds no loadable data.
    #[error("no input files found under {prefix}")]
    NoInput {
        /// Prefix that was enumerated.
        prefix: String,
    },

    /// The warehouse reported a failure for a job this engine submitted.
    #[error("job {job_id} failed: {message}")]
    JobFailedFast {
        /// Warehouse job identifier.
        job_id: String,
        /// Error payload or zero-DML description.
        message: String,
    },

    /// The table lock changed under the subscriber.
    #[error("table lock {lock} changed concurrently: {message}")]
    BacklogConflict {
        /// Key of the `_bqlock` object.
        lock: String,
        /// What was observed.
        message: String,
    },

    /// A backlog pointer names a success marker that no longer exists.
    #[error("backlog pointer {pointer} refers to missing success marker {marker}")]
    BacklogInvariantViolation {
        /// Backlog pointer key.
        pointer: String,
        /// Success marker key it refers to.
        marker: String,
    },

    /// The notification could not be classified or arrived at the wrong place.
    #[error("unexpected trigger: {message}")]
    UnexpectedTrigger {
        /// Description of the trigger.
        message: String,
    },

    /// The engine configuration is unusable.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the problem.
        message: String,
    },

    /// A warehouse API call failed after retries.
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    /// An object-store call failed after retries.
    #[error(transparent)]
    Core(#[from] landfall_core::Error),
}

impl IngestError {
    /// Creates a configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates an unexpected-trigger error.
    #[must_use]
    pub fn unexpected_trigger(message: impl Into<String>) -> Self {
        Self::UnexpectedTrigger {
            message: message.into(),
        }
    }

    /// Returns true if the invocation should end cleanly without reporting.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Duplicate { .. } | Self::BacklogConflict { .. })
    }

    /// Short machine-readable name, used as a metrics label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "duplicate",
            Self::PatternMismatch { .. } => "pattern_mismatch",
            Self::ConfigMissing { .. } => "config_missing",
            Self::ConfigConflict { .. } => "config_conflict",
            Self::NoInput { .. } => "no_input",
            Self::JobFailedFast { .. } => "job_failed",
            Self::BacklogConflict { .. } => "backlog_conflict",
            Self::BacklogInvariantViolation { .. } => "backlog_invariant_violation",
            Self::UnexpectedTrigger { .. } => "unexpected_trigger",
            Self::Configuration { .. } => "configuration",
            Self::Warehouse(_) => "warehouse",
            Self::Core(_) => "storage",
        }
    }
}
