//! Subscriber monitor.
//!
//! An enqueue can lose its item when it runs concurrently with a subscriber
//! that is draining: the subscriber lists an empty backlog, the enqueue writes
//! a pointer and fails to create `_BACKFILL` because it still exists, then the
//! subscriber deletes `_BACKFILL`. The monitor runs after every enqueue and on
//! every backlog pointer notification, and re-posts `_BACKFILL` when the
//! backlog is non-empty but nothing is meant to be draining it.

use chrono::Utc;
use tokio::time::Instant;

use landfall_core::{DeleteResult, StorageBackend};

use crate::backlog::{BackfillMarker, Backlog, PostOutcome};
use crate::context::IngestContext;
use crate::error::Result;

/// What the monitor found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// `_BACKFILL` exists; a subscriber is running or about to.
    Healthy,
    /// `_BACKFILL` was missing or abandoned and has been re-posted.
    Reposted,
    /// `_BACKFILL` is absent and the backlog is empty.
    Idle,
    /// `_BACKFILL` is absent but the start-backfill gate is closed.
    GateClosed,
}

impl MonitorOutcome {
    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Reposted => "reposted",
            Self::Idle => "idle",
            Self::GateClosed => "gate_closed",
        }
    }
}

/// Ensures a subscriber will drain the backlog under `table_prefix`.
///
/// A `_BACKFILL` older than the invocation timeout belonged to a subscriber
/// that died; it is replaced straight away. Otherwise the monitor waits
/// `ensure_subscriber`, then polls for `_BACKFILL` for up to the same time
/// before re-posting it.
///
/// # Errors
///
/// Returns a storage error.
pub async fn ensure_subscriber(
    ctx: &IngestContext,
    storage: &dyn StorageBackend,
    table_prefix: &str,
) -> Result<MonitorOutcome> {
    let marker = BackfillMarker::new(storage, table_prefix, ctx.parser.gate_filename());

    if let Some(existing) = marker.head().await? {
        let age = Utc::now() - existing.created_at;
        let abandoned = age
            .to_std()
            .is_ok_and(|age| age > ctx.config.invocation_timeout);
        if abandoned {
            tracing::warn!(
                backfill = %marker.path(),
                age_secs = age.num_seconds(),
                "backfill marker outlived the invocation timeout, replacing it"
            );
            if let DeleteResult::PreconditionFailed { .. } =
                marker.delete(&existing.version).await?
            {
                return Ok(MonitorOutcome::Healthy);
            }
            return repost(ctx, &marker, "abandoned").await;
        }
    }

    let window = ctx.config.ensure_subscriber;
    tokio::time::sleep(window).await;
    let deadline = Instant::now() + window;
    loop {
        if marker.head().await?.is_some() {
            return Ok(MonitorOutcome::Healthy);
        }
        if Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(ctx.config.job_poll_interval).await;
    }

    if Backlog::new(storage, table_prefix).next().await?.is_none() {
        return Ok(MonitorOutcome::Idle);
    }
    tracing::warn!(
        backfill = %marker.path(),
        "backlog is non-empty but no subscriber is running"
    );
    repost(ctx, &marker, "missing").await
}

async fn repost(
    ctx: &IngestContext,
    marker: &BackfillMarker<'_>,
    reason: &'static str,
) -> Result<MonitorOutcome> {
    match marker.post().await? {
        PostOutcome::Posted { .. } => {
            ctx.metrics.record_monitor_repost(reason);
            Ok(MonitorOutcome::Reposted)
        }
        PostOutcome::AlreadyPresent => Ok(MonitorOutcome::Healthy),
        PostOutcome::GateClosed => Ok(MonitorOutcome::GateClosed),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use landfall_core::{MemoryBackend, WritePrecondition};

    use super::*;
    use crate::config::IngestConfig;
    use crate::warehouse::InMemoryWarehouse;

    fn context(config: IngestConfig) -> IngestContext {
        IngestContext::new(config, Arc::new(InMemoryWarehouse::new())).expect("context")
    }

    async fn touch(backend: &MemoryBackend, key: &str) {
        backend
            .put(key, Bytes::new(), WritePrecondition::None)
            .await
            .expect("put");
    }

    #[tokio::test(start_paused = true)]
    async fn present_marker_is_healthy() {
        let backend = MemoryBackend::new("b");
        touch(&backend, "d/t/_BACKFILL").await;
        let outcome = ensure_subscriber(&context(IngestConfig::default()), &backend, "d/t")
            .await
            .expect("monitor");
        assert_eq!(outcome, MonitorOutcome::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_marker_with_backlog_is_reposted() {
        let backend = MemoryBackend::new("b");
        touch(&backend, "d/t/_backlog/00/_SUCCESS").await;
        let outcome = ensure_subscriber(&context(IngestConfig::default()), &backend, "d/t")
            .await
            .expect("monitor");
        assert_eq!(outcome, MonitorOutcome::Reposted);
        assert!(backend.head("d/t/_BACKFILL").await.expect("head").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_backlog_is_idle() {
        let backend = MemoryBackend::new("b");
        let outcome = ensure_subscriber(&context(IngestConfig::default()), &backend, "d/t")
            .await
            .expect("monitor");
        assert_eq!(outcome, MonitorOutcome::Idle);
        assert!(backend.head("d/t/_BACKFILL").await.expect("head").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_gate_blocks_repost() {
        let backend = MemoryBackend::new("b");
        touch(&backend, "d/t/_backlog/00/_SUCCESS").await;
        let ctx = context(IngestConfig {
            start_backfill_filename: Some("_HISTORYDONE".into()),
            ..IngestConfig::default()
        });
        let outcome = ensure_subscriber(&ctx, &backend, "d/t").await.expect("monitor");
        assert_eq!(outcome, MonitorOutcome::GateClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_marker_is_replaced() {
        let backend = MemoryBackend::new("b");
        touch(&backend, "d/t/_BACKFILL").await;
        backend
            .backdate("d/t/_BACKFILL", chrono::Duration::minutes(10))
            .expect("backdate");
        let before = backend.head("d/t/_BACKFILL").await.expect("head").expect("meta");

        let outcome = ensure_subscriber(&context(IngestConfig::default()), &backend, "d/t")
            .await
            .expect("monitor");
        assert_eq!(outcome, MonitorOutcome::Reposted);
        let after = backend.head("d/t/_BACKFILL").await.expect("head").expect("meta");
        assert_ne!(before.version, after.version);
    }

    #[tokio::test(start_paused = true)]
    async fn marker_appearing_during_poll_is_healthy() {
        let backend = Arc::new(MemoryBackend::new("b"));
        touch(&backend, "d/t/_backlog/00/_SUCCESS").await;
        let ctx = context(IngestConfig::default());

        let writer = Arc::clone(&backend);
        let late = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(7)).await;
            touch(&writer, "d/t/_BACKFILL").await;
        });
        let outcome = ensure_subscriber(&ctx, backend.as_ref(), "d/t")
            .await
            .expect("monitor");
        late.await.expect("writer");
        assert_eq!(outcome, MonitorOutcome::Healthy);
    }
}
