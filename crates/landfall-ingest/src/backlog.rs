//! Per-table backlog queue and the `_BACKFILL` marker.
//!
//! A backlog pointer is a zero-byte object at `<table-prefix>/_backlog/<suffix>`
//! for the success marker `<table-prefix>/<suffix>`. The queue order is the
//! object store's lexicographic list order, so producers control ordering
//! through their key naming.
//!
//! `_BACKFILL` exists while a subscriber is meant to be draining the queue.
//! Its creation is the subscriber's trigger; every create uses
//! `ifGenerationMatch=0` and every delete matches the generation the
//! subscriber was started for.

use bytes::Bytes;
use landfall_core::{DeleteResult, ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

use crate::claim;
use crate::context::IngestContext;
use crate::error::{IngestError, Result};
use crate::paths::{BACKFILL_FILENAME, BACKLOG_DIR, join, strip_backlog};

/// The ordered queue of pending markers of one table.
pub struct Backlog<'a> {
    storage: &'a dyn StorageBackend,
    table_prefix: String,
}

impl<'a> Backlog<'a> {
    /// Creates a handle for the backlog under `table_prefix`.
    #[must_use]
    pub fn new(storage: &'a dyn StorageBackend, table_prefix: impl Into<String>) -> Self {
        Self {
            storage,
            table_prefix: table_prefix.into(),
        }
    }

    /// Listing prefix of the backlog directory.
    #[must_use]
    pub fn dir(&self) -> String {
        format!("{}/", join(&self.table_prefix, BACKLOG_DIR))
    }

    /// Returns the pointer key for a success marker of this table.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::PatternMismatch`] if the marker is not below the
    /// table prefix.
    pub fn pointer_for(&self, marker_key: &str) -> Result<String> {
        let suffix = marker_key
            .strip_prefix(&self.table_prefix)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .ok_or_else(|| IngestError::PatternMismatch {
                key: marker_key.to_string(),
                reason: format!("not below table prefix {}", self.table_prefix),
            })?;
        Ok(format!("{}{suffix}", self.dir()))
    }

    /// Returns the success marker key a pointer refers to.
    #[must_use]
    pub fn marker_for(pointer_key: &str) -> String {
        strip_backlog(pointer_key)
    }

    /// Writes the pointer for `marker_key`. Overwriting an existing pointer is harmless.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker is outside the table or the write fails.
    pub async fn push(&self, marker_key: &str) -> Result<String> {
        let pointer = self.pointer_for(marker_key)?;
        self.storage
            .put(&pointer, Bytes::new(), WritePrecondition::None)
            .await?;
        tracing::info!(pointer = %pointer, "enqueued backlog item");
        Ok(pointer)
    }

    /// Returns the oldest pointer, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn next(&self) -> Result<Option<String>> {
        let listing = self.storage.list(&self.dir(), None).await?;
        Ok(listing.objects.into_iter().next().map(|o| o.path))
    }

    /// Deletes the oldest pointer and returns its key.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn pop_oldest(&self) -> Result<Option<String>> {
        let Some(pointer) = self.next().await? else {
            return Ok(None);
        };
        self.storage
            .delete(&pointer, WritePrecondition::None)
            .await?;
        tracing::info!(pointer = %pointer, "popped backlog item");
        Ok(Some(pointer))
    }
}

/// Result of trying to create `_BACKFILL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// A new generation was written; a subscriber will be triggered.
    Posted {
        /// Generation of the new marker.
        version: String,
    },
    /// Another writer's marker is authoritative.
    AlreadyPresent,
    /// The start-backfill gate does not exist yet.
    GateClosed,
}

impl PostOutcome {
    /// Returns true if this call wrote the marker.
    #[must_use]
    pub const fn is_posted(&self) -> bool {
        matches!(self, Self::Posted { .. })
    }
}

/// The `_BACKFILL` marker of one table.
pub struct BackfillMarker<'a> {
    storage: &'a dyn StorageBackend,
    path: String,
    gate: Option<String>,
}

impl<'a> BackfillMarker<'a> {
    /// Creates a handle for the marker under `table_prefix`.
    ///
    /// With `gate_filename`, the marker may only be posted once
    /// `<table-prefix>/<gate_filename>` exists.
    #[must_use]
    pub fn new(
        storage: &'a dyn StorageBackend,
        table_prefix: &str,
        gate_filename: Option<&str>,
    ) -> Self {
        Self {
            storage,
            path: join(table_prefix, BACKFILL_FILENAME),
            gate: gate_filename.map(|name| join(table_prefix, name)),
        }
    }

    /// Key of the marker.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the marker's metadata if it exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn head(&self) -> Result<Option<ObjectMeta>> {
        Ok(self.storage.head(&self.path).await?)
    }

    /// Returns true if no gate is configured or the gate object exists.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn gate_open(&self) -> Result<bool> {
        match &self.gate {
            None => Ok(true),
            Some(gate) => Ok(self.storage.head(gate).await?.is_some()),
        }
    }

    /// Creates the marker if it is absent and the gate is open.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn post(&self) -> Result<PostOutcome> {
        if !self.gate_open().await? {
            tracing::info!(backfill = %self.path, "start-backfill gate closed, not posting");
            return Ok(PostOutcome::GateClosed);
        }
        self.write(WritePrecondition::DoesNotExist).await
    }

    /// Rewrites the marker at `version`, producing a fresh generation and
    /// therefore a fresh trigger.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn repost(&self, version: &str) -> Result<PostOutcome> {
        self.write(WritePrecondition::MatchesVersion(version.to_string()))
            .await
    }

    /// Deletes the marker if it is still at `version`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn delete(&self, version: &str) -> Result<DeleteResult> {
        Ok(self
            .storage
            .delete(
                &self.path,
                WritePrecondition::MatchesVersion(version.to_string()),
            )
            .await?)
    }

    async fn write(&self, precondition: WritePrecondition) -> Result<PostOutcome> {
        match self
            .storage
            .put(&self.path, Bytes::new(), precondition)
            .await?
        {
            WriteResult::Success { version } => {
                tracing::info!(backfill = %self.path, generation = %version, "posted backfill marker");
                Ok(PostOutcome::Posted { version })
            }
            WriteResult::PreconditionFailed { .. } => Ok(PostOutcome::AlreadyPresent),
        }
    }
}

/// What an enqueue did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    /// Table prefix of the marker.
    pub table_prefix: String,
    /// Pointer written.
    pub pointer: String,
    /// Result of posting `_BACKFILL`.
    pub backfill: PostOutcome,
}

/// Claims a success marker, adds it to its table's backlog and posts `_BACKFILL`.
///
/// # Errors
///
/// Returns [`IngestError::Duplicate`] if the marker was already claimed, or a
/// resolution or storage error.
pub async fn enqueue(
    ctx: &IngestContext,
    storage: &dyn StorageBackend,
    marker_key: &str,
) -> Result<Enqueued> {
    let table_prefix = ctx.parser.table_prefix(marker_key)?;
    claim::claim(storage, marker_key).await?;

    let pointer = Backlog::new(storage, table_prefix.as_str())
        .push(marker_key)
        .await?;
    ctx.metrics.record_backlog("push");

    let backfill = BackfillMarker::new(storage, &table_prefix, ctx.parser.gate_filename())
        .post()
        .await?;
    Ok(Enqueued {
        table_prefix,
        pointer,
        backfill,
    })
}

#[cfg(test)]
mod tests {
    use landfall_core::MemoryBackend;

    use super::*;

    async fn touch(backend: &MemoryBackend, key: &str) {
        backend
            .put(key, Bytes::new(), WritePrecondition::None)
            .await
            .expect("put");
    }

    #[test]
    fn pointer_mirrors_marker_suffix() {
        let backend = MemoryBackend::new("b");
        let backlog = Backlog::new(&backend, "d/t");
        let pointer = backlog.pointer_for("d/t/2020/01/_SUCCESS").expect("pointer");
        assert_eq!(pointer, "d/t/_backlog/2020/01/_SUCCESS");
        assert_eq!(Backlog::marker_for(&pointer), "d/t/2020/01/_SUCCESS");
        assert!(backlog.pointer_for("d/u/_SUCCESS").is_err());
        assert!(backlog.pointer_for("d/tt/_SUCCESS").is_err());
    }

    #[tokio::test]
    async fn backlog_is_fifo_by_key() {
        let backend = MemoryBackend::new("b");
        let backlog = Backlog::new(&backend, "d/t");
        for marker in ["d/t/02/_SUCCESS", "d/t/00/_SUCCESS", "d/t/01/_SUCCESS"] {
            backlog.push(marker).await.expect("push");
        }
        backlog.push("d/t/00/_SUCCESS").await.expect("re-push is harmless");

        let mut popped = Vec::new();
        while let Some(pointer) = backlog.pop_oldest().await.expect("pop") {
            popped.push(Backlog::marker_for(&pointer));
        }
        assert_eq!(
            popped,
            vec!["d/t/00/_SUCCESS", "d/t/01/_SUCCESS", "d/t/02/_SUCCESS"]
        );
        assert_eq!(backlog.next().await.expect("next"), None);
    }

    #[tokio::test]
    async fn backfill_post_is_create_only() {
        let backend = MemoryBackend::new("b");
        let marker = BackfillMarker::new(&backend, "d/t", None);
        let first = marker.post().await.expect("post");
        assert!(first.is_posted());
        assert_eq!(
            marker.post().await.expect("post"),
            PostOutcome::AlreadyPresent
        );

        let PostOutcome::Posted { version } = first else {
            panic!("expected post");
        };
        let reposted = marker.repost(&version).await.expect("repost");
        assert!(reposted.is_posted());
        assert!(matches!(
            marker.delete(&version).await.expect("delete"),
            DeleteResult::PreconditionFailed { .. }
        ));
    }

    #[tokio::test]
    async fn gate_blocks_post_until_present() {
        let backend = MemoryBackend::new("b");
        let marker = BackfillMarker::new(&backend, "d/t", Some("_HISTORYDONE"));
        assert_eq!(marker.post().await.expect("post"), PostOutcome::GateClosed);
        assert!(marker.head().await.expect("head").is_none());

        touch(&backend, "d/t/_HISTORYDONE").await;
        assert!(marker.post().await.expect("post").is_posted());
    }
}
