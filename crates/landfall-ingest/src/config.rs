//! Engine configuration.
//!
//! Every knob has a documented default and an environment variable that
//! overrides it. [`IngestConfig::from_env`] reads the process environment;
//! [`IngestConfig::from_lookup`] takes any lookup function so tests never touch
//! process-global state.

use std::time::Duration;

use landfall_core::RetryPolicy;

use crate::error::{IngestError, Result};
use crate::paths::{DEFAULT_DESTINATION_REGEX, DEFAULT_SUCCESS_FILENAME, DestinationPattern};

/// Default invocation budget granted by the hosting runtime.
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default slack kept before the invocation timeout for the `_BACKFILL` re-post.
pub const DEFAULT_RESTART_BUFFER: Duration = Duration::from_secs(30);

/// Default window for waiting on a job (fast-fail poll and subscriber wait).
pub const DEFAULT_WAIT_FOR_JOB: Duration = Duration::from_secs(5);

/// Default interval between job status polls.
pub const DEFAULT_JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default wait used by the subscriber monitor.
pub const DEFAULT_ENSURE_SUBSCRIBER: Duration = Duration::from_secs(5);

/// Default byte bound of one load batch (15 TB).
pub const DEFAULT_MAX_BATCH_BYTES: u64 = 15 * 1_000_000_000_000;

/// Default URI bound of one load batch.
pub const DEFAULT_MAX_SOURCE_URIS: usize = 10_000;

/// Default prefix of every job id this engine submits.
pub const DEFAULT_JOB_PREFIX: &str = "gcf-ingest-";

/// Default function name carried in job labels.
pub const DEFAULT_FUNCTION_NAME: &str = "landfall";

/// Configuration of the ingest engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Named-capture regex resolving keys to destination tables.
    pub destination_regex: String,
    /// Basename of the success marker.
    pub success_filename: String,
    /// Basename of the optional start-backfill gate.
    pub start_backfill_filename: Option<String>,
    /// Forces ordered mode for every table.
    pub order_per_table: bool,
    /// Wall-clock budget of one invocation.
    pub invocation_timeout: Duration,
    /// Slack left before the invocation timeout.
    pub restart_buffer: Duration,
    /// How long to wait on a job per poll window.
    pub wait_for_job: Duration,
    /// Interval between job status polls.
    pub job_poll_interval: Duration,
    /// Monitor sleep and poll window.
    pub ensure_subscriber: Duration,
    /// Byte bound of one load batch.
    pub max_batch_bytes: u64,
    /// URI bound of one load batch.
    pub max_source_uris: usize,
    /// Prefix identifying jobs owned by this engine.
    pub job_prefix: String,
    /// Fails query jobs whose DML touched zero rows.
    pub fail_on_zero_dml_rows_affected: bool,
    /// Retry bound for transient warehouse and object-store failures.
    pub max_retries: u32,
    /// Destination project when the pattern does not capture one.
    pub default_project: Option<String>,
    /// Value of the `function-name` job label.
    pub function_name: String,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            destination_regex: DEFAULT_DESTINATION_REGEX.to_string(),
            success_filename: DEFAULT_SUCCESS_FILENAME.to_string(),
            start_backfill_filename: None,
            order_per_table: false,
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            restart_buffer: DEFAULT_RESTART_BUFFER,
            wait_for_job: DEFAULT_WAIT_FOR_JOB,
            job_poll_interval: DEFAULT_JOB_POLL_INTERVAL,
            ensure_subscriber: DEFAULT_ENSURE_SUBSCRIBER,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_source_uris: DEFAULT_MAX_SOURCE_URIS,
            job_prefix: DEFAULT_JOB_PREFIX.to_string(),
            fail_on_zero_dml_rows_affected: true,
            max_retries: landfall_core::retry::DEFAULT_MAX_RETRIES,
            default_project: None,
            function_name: DEFAULT_FUNCTION_NAME.to_string(),
        }
    }
}

impl IngestConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration from an arbitrary variable lookup.
    ///
    /// Unset and blank variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to an unparseable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };
        let mut config = Self::default();

        if let Some(regex) = env.string("DESTINATION_REGEX") {
            config.destination_regex = regex;
        }
        if let Some(name) = env.string("SUCCESS_FILENAME") {
            config.success_filename = name;
        }
        config.start_backfill_filename = env.string("START_BACKFILL_FILENAME");
        if let Some(order) = env.bool("ORDER_PER_TABLE")? {
            config.order_per_table = order;
        }
        if let Some(secs) = env.u64("FUNCTION_TIMEOUT_SEC")? {
            config.invocation_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("RESTART_BUFFER_SECONDS")? {
            config.restart_buffer = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("WAIT_FOR_JOB_SECONDS")? {
            config.wait_for_job = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("JOB_POLL_INTERVAL_SECONDS")? {
            config.job_poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("ENSURE_SUBSCRIBER_SECONDS")? {
            config.ensure_subscriber = Duration::from_secs(secs);
        }
        if let Some(bytes) = env.u64("MAX_BATCH_BYTES")? {
            config.max_batch_bytes = bytes;
        }
        if let Some(uris) = env.u64("MAX_SOURCE_URIS_PER_LOAD")? {
            config.max_source_uris = usize::try_from(uris).map_err(|_| {
                IngestError::configuration("MAX_SOURCE_URIS_PER_LOAD is out of range")
            })?;
        }
        if let Some(prefix) = env.string("JOB_PREFIX") {
            config.job_prefix = prefix;
        }
        if let Some(fail) = env.bool("FAIL_ON_ZERO_DML_ROWS_AFFECTED")? {
            config.fail_on_zero_dml_rows_affected = fail;
        }
        if let Some(retries) = env.u64("BQ_API_MAX_RETRIES")? {
            config.max_retries = u32::try_from(retries)
                .map_err(|_| IngestError::configuration("BQ_API_MAX_RETRIES is out of range"))?;
        }
        config.default_project = env.string("BQ_PROJECT");
        if let Some(name) = env.string("FUNCTION_NAME") {
            config.function_name = name;
        }

        Ok(config)
    }

    /// Validates the configuration and compiles the destination pattern.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Configuration`] if the pattern is invalid, a
    /// bound is zero, or the invocation budget leaves no room for one poll
    /// window after the restart buffer.
    pub fn validate(&self) -> Result<DestinationPattern> {
        let pattern = DestinationPattern::new(&self.destination_regex)?;

        if self.success_filename.is_empty() || self.success_filename.contains('/') {
            return Err(IngestError::configuration(
                "SUCCESS_FILENAME must be a non-empty basename",
            ));
        }
        if let Some(gate) = &self.start_backfill_filename {
            if gate.contains('/') {
                return Err(IngestError::configuration(
                    "START_BACKFILL_FILENAME must be a basename",
                ));
            }
        }
        if self.job_prefix.is_empty() {
            return Err(IngestError::configuration("JOB_PREFIX must not be empty"));
        }
        if self.max_batch_bytes == 0 || self.max_source_uris == 0 {
            return Err(IngestError::configuration(
                "MAX_BATCH_BYTES and MAX_SOURCE_URIS_PER_LOAD must be positive",
            ));
        }
        if self.job_poll_interval.is_zero() {
            return Err(IngestError::configuration(
                "JOB_POLL_INTERVAL_SECONDS must be positive",
            ));
        }
        self.subscriber_budget()?;

        Ok(pattern)
    }

    /// Returns how long a subscriber may run before handing off.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Configuration`] if the budget does not exceed
    /// one poll window.
    pub fn subscriber_budget(&self) -> Result<Duration> {
        let budget = self
            .invocation_timeout
            .checked_sub(self.restart_buffer)
            .unwrap_or_default();
        if budget <= self.wait_for_job {
            return Err(IngestError::configuration(format!(
                "invocation timeout {}s minus restart buffer {}s must exceed the job wait window {}s",
                self.invocation_timeout.as_secs(),
                self.restart_buffer.as_secs(),
                self.wait_for_job.as_secs(),
            )));
        }
        Ok(budget)
    }

    /// Retry policy applied to warehouse and object-store calls.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_retries(self.max_retries)
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| IngestError::configuration(format!("{name} must be a u64: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        parse_bool(name, &v).map(Some)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(IngestError::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}
