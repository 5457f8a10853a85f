//! The backlog subscriber.
//!
//! One subscriber runs per `_BACKFILL` generation. It owns the table lock for
//! the length of one invocation and advances the backlog one job at a time:
//!
//! 1. read the lock; wait on the job it names, or sleep on a manual lock
//! 2. pop the backlog head once its job is done
//! 3. claim the lock for the next item (or the next part of a multi-batch
//!    load) and submit it
//!
//! The loop ends when the backlog drains (lock released, `_BACKFILL` deleted)
//! or when the invocation budget runs low (`_BACKFILL` re-posted, lock kept).
//! The head is popped only when the finished job in the lock was derived from
//! the head's success marker. A lock left over from an item that was already
//! popped leaves the head in place, so an item is neither skipped nor
//! submitted twice across restarts.

use std::time::Duration;

use tokio::time::Instant;
use tracing::Instrument;

use landfall_core::observability::subscriber_span;
use landfall_core::{DeleteResult, StorageBackend};

use crate::backlog::{BackfillMarker, Backlog, PostOutcome};
use crate::claim;
use crate::context::IngestContext;
use crate::error::{IngestError, Result};
use crate::job_id::{derived_from, job_id_for, split_part};
use crate::submit::{self, JobWait, check_job_outcome, job_not_found, wait_for_job};
use crate::table_lock::{LockBody, TableLock};

/// Margin kept between the last iteration and the handoff deadline.
const ITERATION_MARGIN: Duration = Duration::from_secs(1);

/// How a subscriber run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberOutcome {
    /// The backlog is empty; lock and `_BACKFILL` are gone.
    Drained,
    /// `_BACKFILL` was re-posted for a fresh invocation to continue.
    Handoff,
    /// The triggering `_BACKFILL` no longer exists.
    Superseded,
}

impl SubscriberOutcome {
    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Drained => "drained",
            Self::Handoff => "handoff",
            Self::Superseded => "superseded",
        }
    }
}

/// Runs the subscriber for the table owning `table_prefix`.
///
/// # Errors
///
/// Returns [`IngestError::Configuration`] if the invocation budget is too
/// short, [`IngestError::Duplicate`] if this `_BACKFILL` generation was
/// already claimed, [`IngestError::BacklogConflict`] if another writer took
/// the lock, [`IngestError::JobFailedFast`] if a job failed (the lock then
/// holds the error), [`IngestError::BacklogInvariantViolation`] for a pointer
/// whose success marker is gone, or any storage or warehouse error.
pub async fn run_subscriber(
    ctx: &IngestContext,
    storage: &dyn StorageBackend,
    table_prefix: &str,
) -> Result<SubscriberOutcome> {
    let span = subscriber_span(storage.bucket(), table_prefix);
    let outcome = Subscriber::new(ctx, storage, table_prefix)?
        .run()
        .instrument(span)
        .await?;
    ctx.metrics.record_subscriber_outcome(outcome.as_str());
    Ok(outcome)
}

struct Subscriber<'a> {
    ctx: &'a IngestContext,
    storage: &'a dyn StorageBackend,
    table_prefix: &'a str,
    marker: BackfillMarker<'a>,
    backlog: Backlog<'a>,
    lock: TableLock<'a>,
    deadline: Instant,
}

impl<'a> Subscriber<'a> {
    fn new(
        ctx: &'a IngestContext,
        storage: &'a dyn StorageBackend,
        table_prefix: &'a str,
    ) -> Result<Self> {
        let budget = ctx.config.subscriber_budget()?;
        Ok(Self {
            ctx,
            storage,
            table_prefix,
            marker: BackfillMarker::new(storage, table_prefix, ctx.parser.gate_filename()),
            backlog: Backlog::new(storage, table_prefix),
            lock: TableLock::new(storage, table_prefix, &ctx.config.job_prefix),
            deadline: Instant::now() + budget,
        })
    }

    async fn run(mut self) -> Result<SubscriberOutcome> {
        let Some(trigger) = self.marker.head().await? else {
            tracing::info!("backfill marker already gone, nothing to do");
            return Ok(SubscriberOutcome::Superseded);
        };
        claim::claim_object(self.storage, &trigger).await?;
        let generation = trigger.version;

        let poll_window = self.ctx.config.wait_for_job;
        let stop_at = self
            .deadline
            .checked_sub(poll_window + ITERATION_MARGIN)
            .unwrap_or(self.deadline);
        let mut last_pop = Instant::now();

        while Instant::now() < stop_at {
            let finished = match self.lock.read().await? {
                Some(LockBody::Job(job_id)) => {
                    if !self.await_job(&job_id).await? {
                        continue;
                    }
                    Some(job_id)
                }
                Some(LockBody::Manual(body)) => {
                    tracing::warn!(lock = %self.lock.path(), body = %body, "table is manually locked, waiting");
                    tokio::time::sleep(poll_window).await;
                    continue;
                }
                None => None,
            };

            let mut head = self.backlog.next().await?;
            if let (Some(job_id), Some(pointer)) = (finished, head.clone()) {
                let marker_key = Backlog::marker_for(&pointer);
                if derived_from(&job_id, &self.ctx.config.job_prefix, &marker_key) {
                    if let (base, Some(index)) = split_part(&job_id) {
                        self.submit_part(&pointer, base, index + 1).await?;
                        continue;
                    }
                    self.backlog.pop_oldest().await?;
                    self.ctx.metrics.record_backlog("pop");
                    tracing::debug!(backlog_item = %pointer, "advanced backlog");
                    last_pop = Instant::now();
                    head = self.backlog.next().await?;
                } else {
                    tracing::info!(
                        job_id = %job_id,
                        backlog_item = %pointer,
                        "finished job is not from the backlog head, keeping head"
                    );
                }
            }

            let Some(pointer) = head else {
                return self.drain(&generation, last_pop).await;
            };
            self.submit_next(&pointer).await?;
        }

        self.handoff(&generation).await
    }

    /// Waits on the job named by the lock; returns true once it succeeded.
    async fn await_job(&mut self, job_id: &str) -> Result<bool> {
        let wait = wait_for_job(
            self.ctx.warehouse.as_ref(),
            job_id,
            self.ctx.config.wait_for_job,
            self.ctx.config.job_poll_interval,
        )
        .await?;
        let result = match wait {
            JobWait::Running => {
                tracing::debug!(job_id, "job still running");
                return Ok(false);
            }
            JobWait::NotFound => Err(job_not_found(self.ctx, job_id)),
            JobWait::Done(status) => check_job_outcome(self.ctx, &status).await,
        };
        if let Err(err) = result {
            if let Err(record_err) = self.lock.record_error(&err.to_string()).await {
                tracing::error!(
                    lock = %self.lock.path(),
                    error = %record_err,
                    "failed to record job error in table lock"
                );
            }
            return Err(err);
        }
        tracing::info!(job_id, "job finished");
        Ok(true)
    }

    async fn marker_of(&self, pointer: &str) -> Result<String> {
        let marker_key = Backlog::marker_for(pointer);
        if self.storage.head(&marker_key).await?.is_none() {
            return Err(IngestError::BacklogInvariantViolation {
                pointer: pointer.to_string(),
                marker: marker_key,
            });
        }
        Ok(marker_key)
    }

    async fn submit_next(&mut self, pointer: &str) -> Result<()> {
        let marker_key = self.marker_of(pointer).await?;
        let job_id = job_id_for(&self.ctx.config.job_prefix, &marker_key);
        tracing::info!(backlog_item = %pointer, job_id = %job_id, "submitting next backlog item");
        submit::apply(
            self.ctx,
            self.storage,
            &marker_key,
            &job_id,
            Some(&mut self.lock),
        )
        .await?;
        Ok(())
    }

    async fn submit_part(&mut self, pointer: &str, job_id: &str, part: usize) -> Result<()> {
        let marker_key = self.marker_of(pointer).await?;
        tracing::info!(backlog_item = %pointer, job_id = %job_id, part, "submitting next part");
        submit::apply_from(
            self.ctx,
            self.storage,
            &marker_key,
            job_id,
            part,
            Some(&mut self.lock),
        )
        .await?;
        Ok(())
    }

    async fn drain(&mut self, generation: &str, last_pop: Instant) -> Result<SubscriberOutcome> {
        self.lock.release().await?;
        if let DeleteResult::PreconditionFailed { current_version } =
            self.marker.delete(generation).await?
        {
            tracing::info!(
                generation = %current_version,
                "backfill marker was re-posted, leaving it to its subscriber"
            );
            return Ok(SubscriberOutcome::Drained);
        }

        if last_pop.elapsed() >= self.ctx.config.ensure_subscriber
            && self.backlog.next().await?.is_some()
        {
            if let PostOutcome::Posted { .. } = self.marker.post().await? {
                tracing::info!("backlog refilled while draining, handing off");
                return Ok(SubscriberOutcome::Handoff);
            }
        }
        tracing::info!(table_prefix = self.table_prefix, "backlog drained");
        Ok(SubscriberOutcome::Drained)
    }

    async fn handoff(&self, generation: &str) -> Result<SubscriberOutcome> {
        match self.marker.repost(generation).await? {
            PostOutcome::Posted { version } => {
                tracing::info!(generation = %version, "invocation budget exhausted, re-posted backfill marker");
            }
            PostOutcome::AlreadyPresent | PostOutcome::GateClosed => {
                tracing::info!("backfill marker changed concurrently, its subscriber continues");
            }
        }
        Ok(SubscriberOutcome::Handoff)
    }
}
