//! Metrics for the ingest engine.
//!
//! Recorded through the `metrics` facade; the hosting binary installs a
//! Prometheus recorder and serves them at `/metrics`.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `landfall_notifications_total` | Counter | `trigger` |
//! | `landfall_jobs_submitted_total` | Counter | `kind` |
//! | `landfall_job_failures_total` | Counter | `reason` |
//! | `landfall_duplicates_total` | Counter | - |
//! | `landfall_backlog_operations_total` | Counter | `operation` |
//! | `landfall_subscriber_outcomes_total` | Counter | `outcome` |
//! | `landfall_monitor_reposts_total` | Counter | `reason` |
//! | `landfall_errors_total` | Counter | `kind` |
//! | `landfall_invocation_duration_seconds` | Histogram | `trigger` |

use std::time::Duration;

use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: notifications by classification.
    pub const NOTIFICATIONS_TOTAL: &str = "landfall_notifications_total";
    /// Counter: warehouse jobs submitted.
    pub const JOBS_SUBMITTED_TOTAL: &str = "landfall_jobs_submitted_total";
    /// Counter: warehouse jobs that failed or violated the zero-DML guard.
    pub const JOB_FAILURES_TOTAL: &str = "landfall_job_failures_total";
    /// Counter: duplicate notifications suppressed.
    pub const DUPLICATES_TOTAL: &str = "landfall_duplicates_total";
    /// Counter: backlog pushes and pops.
    pub const BACKLOG_OPERATIONS_TOTAL: &str = "landfall_backlog_operations_total";
    /// Counter: subscriber exits by outcome.
    pub const SUBSCRIBER_OUTCOMES_TOTAL: &str = "landfall_subscriber_outcomes_total";
    /// Counter: `_BACKFILL` re-posts by the monitor.
    pub const MONITOR_REPOSTS_TOTAL: &str = "landfall_monitor_reposts_total";
    /// Counter: invocations ending in an error.
    pub const ERRORS_TOTAL: &str = "landfall_errors_total";
    /// Histogram: invocation duration in seconds.
    pub const INVOCATION_DURATION_SECONDS: &str = "landfall_invocation_duration_seconds";
}

/// Label keys used across metrics.
pub mod labels {
    /// Notification classification.
    pub const TRIGGER: &str = "trigger";
    /// Job kind (load, query).
    pub const KIND: &str = "kind";
    /// Failure reason.
    pub const REASON: &str = "reason";
    /// Backlog operation (push, pop).
    pub const OPERATION: &str = "operation";
    /// Subscriber outcome.
    pub const OUTCOME: &str = "outcome";
}

/// Registers descriptions for every ingest metric with the installed recorder.
///
/// Call once after installing a recorder; without one this is a no-op.
pub fn describe_metrics() {
    describe_counter!(names::NOTIFICATIONS_TOTAL, "Notifications received, by classification");
    describe_counter!(names::JOBS_SUBMITTED_TOTAL, "Warehouse jobs submitted");
    describe_counter!(names::JOB_FAILURES_TOTAL, "Warehouse jobs that failed");
    describe_counter!(names::DUPLICATES_TOTAL, "Duplicate notifications suppressed");
    describe_counter!(names::BACKLOG_OPERATIONS_TOTAL, "Backlog pushes and pops");
    describe_counter!(names::SUBSCRIBER_OUTCOMES_TOTAL, "Subscriber exits, by outcome");
    describe_counter!(names::MONITOR_REPOSTS_TOTAL, "Backfill markers re-posted by the monitor");
    describe_counter!(names::ERRORS_TOTAL, "Invocations that ended in an error");
    describe_histogram!(
        names::INVOCATION_DURATION_SECONDS,
        "Duration of one notification invocation in seconds"
    );
}

/// Recorder for ingest metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestMetrics;

impl IngestMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a classified notification.
    pub fn record_notification(&self, trigger: &'static str) {
        counter!(names::NOTIFICATIONS_TOTAL, labels::TRIGGER => trigger).increment(1);
    }

    /// Records a job submission.
    pub fn record_job_submitted(&self, kind: &'static str) {
        counter!(names::JOBS_SUBMITTED_TOTAL, labels::KIND => kind).increment(1);
    }

    /// Records a failed job.
    pub fn record_job_failure(&self, reason: &'static str) {
        counter!(names::JOB_FAILURES_TOTAL, labels::REASON => reason).increment(1);
    }

    /// Records a suppressed duplicate.
    pub fn record_duplicate(&self) {
        counter!(names::DUPLICATES_TOTAL).increment(1);
    }

    /// Records a backlog push or pop.
    pub fn record_backlog(&self, operation: &'static str) {
        counter!(names::BACKLOG_OPERATIONS_TOTAL, labels::OPERATION => operation).increment(1);
    }

    /// Records how a subscriber exited.
    pub fn record_subscriber_outcome(&self, outcome: &'static str) {
        counter!(names::SUBSCRIBER_OUTCOMES_TOTAL, labels::OUTCOME => outcome).increment(1);
    }

    /// Records a monitor re-post of `_BACKFILL`.
    pub fn record_monitor_repost(&self, reason: &'static str) {
        counter!(names::MONITOR_REPOSTS_TOTAL, labels::REASON => reason).increment(1);
    }

    /// Records an invocation that ended in an error.
    pub fn record_error(&self, kind: &'static str) {
        counter!(names::ERRORS_TOTAL, labels::KIND => kind).increment(1);
    }

    /// Records the duration of one invocation.
    pub fn observe_invocation(&self, trigger: &'static str, elapsed: Duration) {
        histogram!(names::INVOCATION_DURATION_SECONDS, labels::TRIGGER => trigger)
            .record(elapsed.as_secs_f64());
    }
}
