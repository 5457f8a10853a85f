//! Per-table single-writer lease (`<table-prefix>/_bqlock`).
//!
//! The body is the id of the in-flight job. Every write is conditioned on the
//! generation observed by the last [`TableLock::read`], so a subscriber that
//! lost the lease finds out on its next write instead of clobbering the
//! winner.
//!
//! A body that does not start with the engine's job prefix is a manual lock.
//! Operators use it to pause a table; the engine never writes over it.

use bytes::Bytes;
use landfall_core::{DeleteResult, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{IngestError, Result};
use crate::paths::{LOCK_FILENAME, join};

/// Interpreted lock body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockBody {
    /// A job this engine submitted.
    Job(String),
    /// Anything else: an operator pause or a recorded failure.
    Manual(String),
}

/// Handle on one table's lock.
pub struct TableLock<'a> {
    storage: &'a dyn StorageBackend,
    path: String,
    job_prefix: String,
    version: Option<String>,
}

impl<'a> TableLock<'a> {
    /// Creates a handle for the lock under `table_prefix`.
    #[must_use]
    pub fn new(storage: &'a dyn StorageBackend, table_prefix: &str, job_prefix: &str) -> Self {
        Self {
            storage,
            path: join(table_prefix, LOCK_FILENAME),
            job_prefix: job_prefix.to_string(),
            version: None,
        }
    }

    /// Key of the lock object.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the lock and remembers its generation for the next write.
    ///
    /// Empty and missing bodies both read as `None`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn read(&mut self) -> Result<Option<LockBody>> {
        // Generation first, then body: a change in between fails the next CAS.
        let Some(meta) = self.storage.head(&self.path).await? else {
            self.version = None;
            return Ok(None);
        };
        let body = match self.storage.get(&self.path).await {
            Ok(body) => body,
            Err(e) if e.is_not_found() => {
                self.version = None;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.version = Some(meta.version);

        let text = String::from_utf8_lossy(&body).trim().to_string();
        if text.is_empty() {
            return Ok(None);
        }
        if text.starts_with(&self.job_prefix) {
            Ok(Some(LockBody::Job(text)))
        } else {
            Ok(Some(LockBody::Manual(text)))
        }
    }

    /// Writes `job_id` into the lock.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::BacklogConflict`] if the lock changed since the
    /// last read.
    pub async fn claim(&mut self, job_id: &str) -> Result<()> {
        self.write(job_id.to_string()).await
    }

    /// Replaces the lock body with a failure description.
    ///
    /// The body never starts with the job prefix, so later subscribers treat it
    /// as a manual lock and leave the table paused.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::BacklogConflict`] if the lock changed since the
    /// last read.
    pub async fn record_error(&mut self, message: &str) -> Result<()> {
        let body = if message.starts_with(&self.job_prefix) {
            format!("ERROR: {message}")
        } else {
            message.to_string()
        };
        self.write(body).await
    }

    /// Deletes the lock if it is still at the last observed generation.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::BacklogConflict`] if the lock changed since the
    /// last read or write.
    pub async fn release(&mut self) -> Result<()> {
        let Some(version) = self.version.clone() else {
            return Ok(());
        };
        match self
            .storage
            .delete(&self.path, WritePrecondition::MatchesVersion(version))
            .await?
        {
            DeleteResult::Deleted | DeleteResult::NotFound => {
                self.version = None;
                tracing::debug!(lock = %self.path, "released table lock");
                Ok(())
            }
            DeleteResult::PreconditionFailed { current_version } => {
                Err(self.conflict(&current_version))
            }
        }
    }

    async fn write(&mut self, body: String) -> Result<()> {
        let precondition = WritePrecondition::from_observed(self.version.as_deref());
        match self
            .storage
            .put(&self.path, Bytes::from(body), precondition)
            .await?
        {
            WriteResult::Success { version } => {
                self.version = Some(version);
                Ok(())
            }
            WriteResult::PreconditionFailed { current_version } => {
                Err(self.conflict(&current_version))
            }
        }
    }

    fn conflict(&self, current_version: &str) -> IngestError {
        IngestError::BacklogConflict {
            lock: self.path.clone(),
            message: format!(
                "expected generation {}, found {current_version}",
                self.version.as_deref().unwrap_or("0")
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use landfall_core::MemoryBackend;

    use super::*;

    const PREFIX: &str = "gcf-ingest-";

    #[tokio::test]
    async fn claim_read_release_cycle() {
        let backend = MemoryBackend::new("b");
        let mut lock = TableLock::new(&backend, "d/t", PREFIX);
        assert_eq!(lock.read().await.expect("read"), None);

        lock.claim("gcf-ingest-job-1").await.expect("first claim");
        let mut other = TableLock::new(&backend, "d/t", PREFIX);
        assert_eq!(
            other.read().await.expect("read"),
            Some(LockBody::Job("gcf-ingest-job-1".into()))
        );

        lock.claim("gcf-ingest-job-2").await.expect("second claim");
        lock.release().await.expect("release");
        assert!(backend.head("d/t/_bqlock").await.expect("head").is_none());
    }

    #[tokio::test]
    async fn stale_writer_gets_conflict() {
        let backend = MemoryBackend::new("b");
        let mut first = TableLock::new(&backend, "d/t", PREFIX);
        let mut second = TableLock::new(&backend, "d/t", PREFIX);
        first.read().await.expect("read");
        second.read().await.expect("read");

        first.claim("gcf-ingest-a").await.expect("winner");
        let err = second.claim("gcf-ingest-b").await.expect_err("loser");
        assert!(matches!(err, IngestError::BacklogConflict { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn release_after_concurrent_change_conflicts() {
        let backend = MemoryBackend::new("b");
        let mut lock = TableLock::new(&backend, "d/t", PREFIX);
        lock.read().await.expect("read");
        lock.claim("gcf-ingest-a").await.expect("claim");

        backend
            .put("d/t/_bqlock", Bytes::from("paused"), WritePrecondition::None)
            .await
            .expect("operator write");
        assert!(matches!(
            lock.release().await,
            Err(IngestError::BacklogConflict { .. })
        ));
        assert!(backend.head("d/t/_bqlock").await.expect("head").is_some());
    }

    #[tokio::test]
    async fn non_prefixed_body_is_manual() {
        let backend = MemoryBackend::new("b");
        backend
            .put("d/t/_bqlock", Bytes::from("paused by ops\n"), WritePrecondition::None)
            .await
            .expect("put");
        let mut lock = TableLock::new(&backend, "d/t", PREFIX);
        assert_eq!(
            lock.read().await.expect("read"),
            Some(LockBody::Manual("paused by ops".into()))
        );
    }

    #[tokio::test]
    async fn recorded_errors_read_as_manual() {
        let backend = MemoryBackend::new("b");
        let mut lock = TableLock::new(&backend, "d/t", PREFIX);
        lock.read().await.expect("read");
        lock.claim("gcf-ingest-a").await.expect("claim");
        lock.record_error("gcf-ingest-a failed: Syntax error")
            .await
            .expect("record");

        let mut reader = TableLock::new(&backend, "d/t", PREFIX);
        let Some(LockBody::Manual(body)) = reader.read().await.expect("read") else {
            panic!("expected manual lock");
        };
        assert!(body.contains("Syntax error"));
    }

    #[tokio::test]
    async fn releasing_unclaimed_lock_is_a_noop() {
        let backend = MemoryBackend::new("b");
        let mut lock = TableLock::new(&backend, "d/t", PREFIX);
        lock.read().await.expect("read");
        lock.release().await.expect("noop");
    }
}
