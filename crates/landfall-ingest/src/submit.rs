//! Job construction, submission and outcome checks.
//!
//! A success marker is applied either as one or more load jobs over the
//! files next to it, or, when a SQL transform is configured, as a single query
//! over a temporary external table bound to all of those files.

use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;

use landfall_core::StorageBackend;

use crate::batch::{Batch, BatchLimits, gather_batches};
use crate::config_resolver::{ConfigResolver, base_load_config, render_sql};
use crate::context::IngestContext;
use crate::error::{IngestError, Result};
use crate::job_id::{default_labels, part_job_id};
use crate::paths::{Destination, dirname};
use crate::table_lock::TableLock;
use crate::warehouse::{
    EXTERNAL_TABLE_NAME, JobRequest, JobStatus, LoadJob, QueryJob, Warehouse,
};

/// What [`apply`] submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedJob {
    /// Id of the last job submitted; in ordered mode the one recorded in the
    /// table lock.
    pub job_id: String,
    /// `load` or `query`.
    pub kind: &'static str,
    /// Number of jobs the marker's batches split into.
    pub parts: usize,
}

/// Result of waiting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobWait {
    /// The job reached its terminal state.
    Done(JobStatus),
    /// The window elapsed first.
    Running,
    /// The warehouse does not know the job.
    NotFound,
}

/// Builds and submits the job(s) for the success marker `marker_key`.
///
/// With a `lock`, the table is in ordered mode: only the first part of a
/// multi-batch load is submitted, the lock is claimed for it beforehand, and
/// any failure is written into the lock so the table stays paused until an
/// operator intervenes. The subscriber submits the remaining parts with
/// [`apply_from`] once the part in the lock is done.
///
/// # Errors
///
/// Returns [`IngestError::NoInput`] if there is nothing to load,
/// [`IngestError::JobFailedFast`] if a job fails within the fast-poll window,
/// [`IngestError::BacklogConflict`] if the lock changed under us, or a
/// resolution, config, storage or warehouse error.
pub async fn apply(
    ctx: &IngestContext,
    storage: &dyn StorageBackend,
    marker_key: &str,
    job_id: &str,
    lock: Option<&mut TableLock<'_>>,
) -> Result<AppliedJob> {
    apply_from(ctx, storage, marker_key, job_id, 0, lock).await
}

/// Like [`apply`], starting at part `first_part` of the load `job_id`.
///
/// # Errors
///
/// As [`apply`]; a `first_part` past the last batch fails the job, since the
/// files under the marker changed after its first part was submitted.
pub async fn apply_from(
    ctx: &IngestContext,
    storage: &dyn StorageBackend,
    marker_key: &str,
    job_id: &str,
    first_part: usize,
    mut lock: Option<&mut TableLock<'_>>,
) -> Result<AppliedJob> {
    let result = submit_jobs(
        ctx,
        storage,
        marker_key,
        job_id,
        first_part,
        lock.as_deref_mut(),
    )
    .await;
    if let (Err(err), Some(lock)) = (&result, lock) {
        if let Err(record_err) = lock.record_error(&err.to_string()).await {
            tracing::error!(
                lock = %lock.path(),
                error = %record_err,
                "failed to record job error in table lock"
            );
        }
    }
    result
}

async fn submit_jobs(
    ctx: &IngestContext,
    storage: &dyn StorageBackend,
    marker_key: &str,
    job_id: &str,
    first_part: usize,
    mut lock: Option<&mut TableLock<'_>>,
) -> Result<AppliedJob> {
    let destination = ctx.parser.destination(marker_key)?;
    let dir = dirname(marker_key);
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    };
    let limits = BatchLimits {
        max_bytes: ctx.config.max_batch_bytes,
        max_uris: ctx.config.max_source_uris,
    };
    let batches = gather_batches(storage, &prefix, ctx.parser.success_filename(), limits).await?;

    let resolver = ConfigResolver::new(storage);
    let labels = default_labels(
        &ctx.config.function_name,
        storage.bucket(),
        destination.batch_id.as_deref(),
    );

    if let Some(sql) = resolver.transform_sql(marker_key).await? {
        let external_config = resolver.external_config(marker_key).await?;
        let request = JobRequest::Query(QueryJob {
            job_id: job_id.to_string(),
            sql: render_sql(&sql, &destination.table.dataset, &destination.table.table_id()),
            destination: destination.table,
            external_table: EXTERNAL_TABLE_NAME.to_string(),
            external_config,
            source_uris: batches.into_iter().flat_map(|b| b.uris).collect(),
            labels,
        });
        if let Some(lock) = lock {
            lock.claim(job_id).await?;
        }
        submit_and_poll(ctx, request).await?;
        return Ok(AppliedJob {
            job_id: job_id.to_string(),
            kind: "query",
            parts: 1,
        });
    }

    let mut config = resolver
        .load_config(marker_key, base_load_config(labels))
        .await?;
    let labels = take_labels(&mut config);
    let parts = batches.len();
    if first_part >= parts {
        return Err(IngestError::JobFailedFast {
            job_id: job_id.to_string(),
            message: format!("batch set changed: no part {first_part} among {parts}"),
        });
    }
    let mut last_id = job_id.to_string();
    for (index, batch) in batches.into_iter().enumerate().skip(first_part) {
        last_id = part_job_id(job_id, index, parts);
        let request = load_request(&last_id, &destination, batch, &config, &labels);
        if let Some(lock) = lock.as_deref_mut() {
            lock.claim(&last_id).await?;
            submit_and_poll(ctx, request).await?;
            break;
        }
        submit_and_poll(ctx, request).await?;
    }
    Ok(AppliedJob {
        job_id: last_id,
        kind: "load",
        parts,
    })
}

fn load_request(
    job_id: &str,
    destination: &Destination,
    batch: Batch,
    config: &Value,
    labels: &Map<String, Value>,
) -> JobRequest {
    JobRequest::Load(LoadJob {
        job_id: job_id.to_string(),
        destination: destination.table.clone(),
        source_uris: batch.uris,
        config: config.clone(),
        labels: labels.clone(),
    })
}

/// Moves the merged `labels` object out of a load configuration.
fn take_labels(config: &mut Value) -> Map<String, Value> {
    match config.as_object_mut().and_then(|c| c.remove("labels")) {
        Some(Value::Object(labels)) => labels,
        _ => Map::new(),
    }
}

async fn submit_and_poll(ctx: &IngestContext, request: JobRequest) -> Result<()> {
    let kind = request.kind();
    let job_id = request.job_id().to_string();
    tracing::info!(
        job_id = %job_id,
        kind,
        destination = %request.destination(),
        uris = request.source_uris().len(),
        "submitting job"
    );
    ctx.warehouse.submit(request).await?;
    ctx.metrics.record_job_submitted(kind);

    match wait_for_job(
        ctx.warehouse.as_ref(),
        &job_id,
        ctx.config.wait_for_job,
        ctx.config.job_poll_interval,
    )
    .await?
    {
        JobWait::Done(status) => check_job_outcome(ctx, &status).await,
        JobWait::Running => {
            tracing::debug!(job_id = %job_id, "job still running after fast-poll window");
            Ok(())
        }
        JobWait::NotFound => {
            tracing::warn!(job_id = %job_id, "submitted job not visible yet");
            Ok(())
        }
    }
}

/// Polls `job_id` every `interval` until it is done or `window` elapses.
///
/// # Errors
///
/// Returns a warehouse error if a status call fails after retries.
pub async fn wait_for_job(
    warehouse: &dyn Warehouse,
    job_id: &str,
    window: Duration,
    interval: Duration,
) -> Result<JobWait> {
    let deadline = Instant::now() + window;
    loop {
        match warehouse.get_job(job_id).await? {
            None => return Ok(JobWait::NotFound),
            Some(status) if status.is_done() => return Ok(JobWait::Done(status)),
            Some(_) => {}
        }
        if Instant::now() + interval > deadline {
            return Ok(JobWait::Running);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Fails a finished job that reported an error or, with the zero-DML guard
/// on, a DML statement that affected no rows.
///
/// For `SCRIPT` statements the guard sums the affected rows of the DML child
/// jobs.
///
/// # Errors
///
/// Returns [`IngestError::JobFailedFast`] describing the failure.
pub async fn check_job_outcome(ctx: &IngestContext, status: &JobStatus) -> Result<()> {
    if let Some(error) = &status.error {
        ctx.metrics.record_job_failure("error_result");
        return Err(IngestError::JobFailedFast {
            job_id: status.job_id.clone(),
            message: error.clone(),
        });
    }
    if !ctx.config.fail_on_zero_dml_rows_affected {
        return Ok(());
    }

    let zero_rows = if status.is_dml() {
        status.dml_affected_rows == Some(0)
    } else if status.is_script() {
        let children = ctx.warehouse.list_child_jobs(&status.job_id).await?;
        let dml: Vec<&JobStatus> = children.iter().filter(|c| c.is_dml()).collect();
        !dml.is_empty()
            && dml
                .iter()
                .map(|c| c.dml_affected_rows.unwrap_or(0))
                .sum::<u64>()
                == 0
    } else {
        false
    };
    if zero_rows {
        ctx.metrics.record_job_failure("zero_dml_rows");
        return Err(IngestError::JobFailedFast {
            job_id: status.job_id.clone(),
            message: "DML statement affected zero rows".to_string(),
        });
    }
    Ok(())
}

/// The error for a job id the warehouse does not know.
pub(crate) fn job_not_found(ctx: &IngestContext, job_id: &str) -> IngestError {
    ctx.metrics.record_job_failure("not_found");
    IngestError::JobFailedFast {
        job_id: job_id.to_string(),
        message: "job not found in warehouse".to_string(),
    }
}
