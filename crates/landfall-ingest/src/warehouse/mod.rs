//! The warehouse contract consumed by the engine.
//!
//! The engine submits two kinds of jobs and polls them by id. Job
//! configurations are opaque JSON built from producer config files and are
//! passed through untouched.
//!
//! Implementations:
//! - [`InMemoryWarehouse`]: scriptable in-process warehouse for tests
//! - [`BigQueryWarehouse`]: BigQuery REST client (feature `gcp`)

pub mod bigquery;
pub mod memory;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::paths::TableRef;

pub use bigquery::{BigQueryConfig, BigQueryWarehouse};
pub use memory::{InMemoryWarehouse, JobScript};

/// Name of the temporary external table attached to transform queries.
pub const EXTERNAL_TABLE_NAME: &str = "temp_ext";

/// Statement type of a multi-statement query.
pub const SCRIPT_STATEMENT_TYPE: &str = "SCRIPT";

/// Statement types that report DML-affected rows.
pub const DML_STATEMENT_TYPES: &[&str] = &["INSERT", "UPDATE", "DELETE", "MERGE"];

/// Errors returned by a warehouse client.
#[derive(Debug, thiserror::Error)]
pub enum WarehouseError {
    /// The API rejected or failed the request.
    #[error("warehouse API error: {message}")]
    Api {
        /// Description of the failure.
        message: String,
        /// Whether the failure is worth retrying.
        transient: bool,
    },

    /// The API response could not be interpreted.
    #[error("warehouse response error: {message}")]
    Response {
        /// Description of the problem.
        message: String,
    },
}

impl WarehouseError {
    /// Creates a non-transient API error.
    #[must_use]
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            transient: false,
        }
    }

    /// Returns true if the failed call may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Api {
                transient: true,
                ..
            }
        )
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Queued.
    Pending,
    /// Executing.
    Running,
    /// Finished, successfully or not.
    Done,
}

/// Observed status of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    /// Job identifier.
    pub job_id: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Error payload of a failed job.
    pub error: Option<String>,
    /// Statement type classifier of a query job.
    pub statement_type: Option<String>,
    /// Rows affected by a DML statement.
    pub dml_affected_rows: Option<u64>,
}

impl JobStatus {
    /// Returns a status in the given state with no statistics.
    #[must_use]
    pub fn new(job_id: impl Into<String>, state: JobState) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            error: None,
            statement_type: None,
            dml_affected_rows: None,
        }
    }

    /// Returns true once the job reached its terminal state.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }

    /// Returns true if the job is done and reported no error.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.is_done() && self.error.is_none()
    }

    /// Returns true if the statement type reports DML-affected rows.
    #[must_use]
    pub fn is_dml(&self) -> bool {
        self.statement_type
            .as_deref()
            .is_some_and(|t| DML_STATEMENT_TYPES.contains(&t))
    }

    /// Returns true for multi-statement queries.
    #[must_use]
    pub fn is_script(&self) -> bool {
        self.statement_type.as_deref() == Some(SCRIPT_STATEMENT_TYPE)
    }
}

/// A load job: source URIs appended into a table.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadJob {
    /// Job identifier.
    pub job_id: String,
    /// Destination table.
    pub destination: TableRef,
    /// Source `gs://` URIs.
    pub source_uris: Vec<String>,
    /// Merged `load.json` (without labels).
    pub config: Value,
    /// Job labels.
    pub labels: Map<String, Value>,
}

/// A query job over a temporary external table.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryJob {
    /// Job identifier.
    pub job_id: String,
    /// Table the rendered SQL writes to.
    pub destination: TableRef,
    /// Rendered SQL.
    pub sql: String,
    /// Name of the external table referenced by the SQL.
    pub external_table: String,
    /// Merged `external.json` table definition.
    pub external_config: Value,
    /// Source `gs://` URIs bound to the external table.
    pub source_uris: Vec<String>,
    /// Job labels.
    pub labels: Map<String, Value>,
}

/// A job submission.
#[derive(Debug, Clone, PartialEq)]
pub enum JobRequest {
    /// Load URIs into a table.
    Load(LoadJob),
    /// Run a transform query.
    Query(QueryJob),
}

impl JobRequest {
    /// Job identifier.
    #[must_use]
    pub fn job_id(&self) -> &str {
        match self {
            Self::Load(job) => &job.job_id,
            Self::Query(job) => &job.job_id,
        }
    }

    /// Destination table.
    #[must_use]
    pub fn destination(&self) -> &TableRef {
        match self {
            Self::Load(job) => &job.destination,
            Self::Query(job) => &job.destination,
        }
    }

    /// Source URIs.
    #[must_use]
    pub fn source_uris(&self) -> &[String] {
        match self {
            Self::Load(job) => &job.source_uris,
            Self::Query(job) => &job.source_uris,
        }
    }

    /// `load` or `query`, used as a metrics label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Query(_) => "query",
        }
    }
}

/// Client for the analytical warehouse.
#[async_trait]
pub trait Warehouse: Send + Sync + 'static {
    /// Submits a job and returns its initial status.
    async fn submit(&self, job: JobRequest) -> Result<JobStatus, WarehouseError>;

    /// Fetches a job by id; `None` if the warehouse does not know it.
    async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>, WarehouseError>;

    /// Lists the child jobs of a multi-statement query.
    async fn list_child_jobs(&self, parent_job_id: &str) -> Result<Vec<JobStatus>, WarehouseError>;
}
