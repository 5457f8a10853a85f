//! Test storage with operation tracing.
//!
//! [`TracingMemoryBackend`] wraps the core in-memory backend, records every
//! call for assertions, can fail calls under injected prefixes, and queues the
//! key of every successful write so tests can replay the object-finalize
//! notifications a real bucket would send.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use landfall_core::error::{Error, Result};
use landfall_core::storage::{
    DeleteResult, Listing, MemoryBackend, ObjectMeta, StorageBackend, StorageProvider,
    WritePrecondition, WriteResult,
};

/// Record of a storage operation for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
    /// Body download.
    Get {
        /// Path that was read.
        path: String,
    },
    /// Metadata lookup.
    Head {
        /// Path that was checked.
        path: String,
    },
    /// Write.
    Put {
        /// Path that was written.
        path: String,
        /// Precondition used.
        precondition: WritePrecondition,
        /// Whether the write happened.
        succeeded: bool,
    },
    /// Delete.
    Delete {
        /// Path that was deleted.
        path: String,
        /// Precondition used.
        precondition: WritePrecondition,
    },
    /// Listing.
    List {
        /// Prefix that was listed.
        prefix: String,
    },
}

impl StorageOp {
    /// Path or prefix the operation touched.
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Get { path }
            | Self::Head { path }
            | Self::Put { path, .. }
            | Self::Delete { path, .. } => path,
            Self::List { prefix } => prefix,
        }
    }
}

/// In-memory storage backend with operation tracing.
#[derive(Debug, Clone)]
pub struct TracingMemoryBackend {
    inner: Arc<MemoryBackend>,
    operations: Arc<Mutex<Vec<StorageOp>>>,
    fail_paths: Arc<Mutex<Vec<String>>>,
    finalized: Arc<Mutex<VecDeque<String>>>,
}

impl TracingMemoryBackend {
    /// Creates an empty bucket.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemoryBackend::new(bucket)),
            operations: Arc::default(),
            fail_paths: Arc::default(),
            finalized: Arc::default(),
        }
    }

    /// The wrapped backend, for writes that should not be traced.
    #[must_use]
    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    /// Returns all recorded operations.
    #[must_use]
    pub fn operations(&self) -> Vec<StorageOp> {
        self.operations.lock().expect("lock").clone()
    }

    /// Clears recorded operations.
    pub fn clear_operations(&self) {
        self.operations.lock().expect("lock").clear();
    }

    /// Paths written successfully, in order.
    #[must_use]
    pub fn written_paths(&self) -> Vec<String> {
        self.operations()
            .into_iter()
            .filter_map(|op| match op {
                StorageOp::Put {
                    path,
                    succeeded: true,
                    ..
                } => Some(path),
                _ => None,
            })
            .collect()
    }

    /// Injects a failure for every path starting with `prefix`.
    pub fn inject_failure(&self, prefix: impl Into<String>) {
        self.fail_paths.lock().expect("lock").push(prefix.into());
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        self.fail_paths.lock().expect("lock").clear();
    }

    /// Takes the keys of all writes since the last call, oldest first.
    #[must_use]
    pub fn drain_finalized(&self) -> Vec<String> {
        self.finalized.lock().expect("lock").drain(..).collect()
    }

    /// Returns every stored key in lexicographic order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.inner.keys().expect("keys")
    }

    /// Returns true if `path` exists.
    #[must_use]
    pub fn contains(&self, path: &str) -> bool {
        self.keys().iter().any(|k| k == path)
    }

    /// Moves the object's creation time into the past.
    pub fn backdate(&self, path: &str, by: chrono::Duration) {
        self.inner.backdate(path, by).expect("backdate");
    }

    fn record(&self, op: StorageOp) {
        self.operations.lock().expect("lock").push(op);
    }

    fn check_failure(&self, path: &str) -> Result<()> {
        let fail_paths = self.fail_paths.lock().expect("lock");
        if fail_paths.iter().any(|p| path.starts_with(p)) {
            return Err(Error::storage(format!("injected failure for path: {path}")));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageBackend for TracingMemoryBackend {
    fn bucket(&self) -> &str {
        self.inner.bucket()
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        self.check_failure(path)?;
        self.record(StorageOp::Get {
            path: path.to_string(),
        });
        self.inner.get(path).await
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        self.check_failure(path)?;
        self.record(StorageOp::Head {
            path: path.to_string(),
        });
        self.inner.head(path).await
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        self.check_failure(path)?;
        let result = self.inner.put(path, data, precondition.clone()).await?;
        let succeeded = result.is_success();
        self.record(StorageOp::Put {
            path: path.to_string(),
            precondition,
            succeeded,
        });
        if succeeded {
            self.finalized
                .lock()
                .expect("lock")
                .push_back(path.to_string());
        }
        Ok(result)
    }

    async fn delete(&self, path: &str, precondition: WritePrecondition) -> Result<DeleteResult> {
        self.check_failure(path)?;
        self.record(StorageOp::Delete {
            path: path.to_string(),
            precondition: precondition.clone(),
        });
        self.inner.delete(path, precondition).await
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        self.check_failure(prefix)?;
        self.record(StorageOp::List {
            prefix: prefix.to_string(),
        });
        self.inner.list(prefix, delimiter).await
    }
}

/// Provider serving one [`TracingMemoryBackend`] for its bucket.
#[derive(Debug, Clone)]
pub struct TracingProvider {
    backend: TracingMemoryBackend,
}

impl TracingProvider {
    /// Wraps `backend`.
    #[must_use]
    pub fn new(backend: TracingMemoryBackend) -> Self {
        Self { backend }
    }
}

impl StorageProvider for TracingProvider {
    fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
        if bucket != self.backend.bucket() {
            return Err(Error::NotFound(format!("bucket {bucket}")));
        }
        Ok(Arc::new(self.backend.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_operations_and_finalized_keys() {
        let storage = TracingMemoryBackend::new("b");
        storage
            .put("d/t/_SUCCESS", Bytes::new(), WritePrecondition::DoesNotExist)
            .await
            .expect("put");
        storage
            .put("d/t/_SUCCESS", Bytes::new(), WritePrecondition::DoesNotExist)
            .await
            .expect("losing put");
        let _ = storage.get("d/t/_SUCCESS").await;
        let _ = storage.list("d/", None).await;

        let ops = storage.operations();
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[1], StorageOp::Put { succeeded: false, .. }));
        assert_eq!(storage.drain_finalized(), vec!["d/t/_SUCCESS"]);
        assert!(storage.drain_finalized().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_errors() {
        let storage = TracingMemoryBackend::new("b");
        storage.inject_failure("d/t/_bqlock");
        assert!(storage.head("d/t/_bqlock").await.is_err());
        assert!(storage.head("d/t/_BACKFILL").await.is_ok());

        storage.clear_failures();
        assert!(storage.head("d/t/_bqlock").await.is_ok());
    }

    #[test]
    fn provider_serves_only_its_bucket() {
        let provider = TracingProvider::new(TracingMemoryBackend::new("b"));
        assert!(provider.bucket("b").is_ok());
        assert!(provider.bucket("other").is_err());
    }
}
