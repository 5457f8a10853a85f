//! Storage backend abstraction for the object store that receives data.
//!
//! All persistent ingest state (claims, backlog pointers, table locks, backfill
//! markers) lives in the same bucket as the producer's files. The contract here
//! is the minimum the engine needs from the store:
//! - Conditional writes and deletes keyed on the object *generation*
//! - Object metadata including `generation` and `timeCreated`
//! - Lexicographic, optionally delimited listing
//!
//! ## Generations
//!
//! The version token is the server-assigned generation, carried as an opaque
//! `String`. [`WritePrecondition::DoesNotExist`] is the `if-generation-match=0`
//! form: create only if absent.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::{Error, Result};

/// Precondition for conditional writes and deletes (CAS operations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePrecondition {
    /// Apply only if the object does not exist (`if-generation-match=0`).
    DoesNotExist,
    /// Apply only if the object's generation matches the given token.
    MatchesVersion(String),
    /// Apply unconditionally.
    None,
}

impl WritePrecondition {
    /// Builds the precondition that guards an update of a previously read object.
    ///
    /// `None` (absent when read) maps to [`WritePrecondition::DoesNotExist`].
    #[must_use]
    pub fn from_observed(version: Option<&str>) -> Self {
        version.map_or(Self::DoesNotExist, |v| Self::MatchesVersion(v.to_string()))
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    /// Write succeeded, returns the new generation.
    Success {
        /// The new version token after the write.
        version: String,
    },
    /// Precondition failed, returns the current generation (`"0"` if absent).
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

impl WriteResult {
    /// Returns true if the write was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Result of a conditional delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteResult {
    /// The object was deleted.
    Deleted,
    /// There was nothing to delete.
    NotFound,
    /// The object exists at a different generation than expected.
    PreconditionFailed {
        /// The current version that caused the precondition to fail.
        current_version: String,
    },
}

/// Metadata about a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object key.
    pub path: String,
    /// Object size in bytes.
    pub size: u64,
    /// Server-assigned generation, as an opaque token.
    pub version: String,
    /// When this generation of the object was created (`timeCreated`).
    pub created_at: DateTime<Utc>,
    /// Last metadata update.
    pub updated_at: DateTime<Utc>,
}

/// A single page-merged listing result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    /// Objects directly matched, in lexicographic key order.
    pub objects: Vec<ObjectMeta>,
    /// Common prefixes rolled up by the delimiter, in lexicographic order.
    pub prefixes: Vec<String>,
}

/// Storage backend trait for a single bucket.
///
/// All backends (GCS, memory) implement this trait with cloud object storage
/// semantics.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Returns the bucket this backend operates on.
    fn bucket(&self) -> &str;

    /// Reads an entire object.
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    async fn get(&self, path: &str) -> Result<Bytes>;

    /// Gets object metadata without reading content.
    ///
    /// Returns `None` if the object doesn't exist.
    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>>;

    /// Writes with an optional precondition.
    ///
    /// Returns `WriteResult::PreconditionFailed` if the precondition is not
    /// met. Precondition failure is a normal result, never an error.
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult>;

    /// Deletes an object with an optional precondition.
    async fn delete(&self, path: &str, precondition: WritePrecondition) -> Result<DeleteResult>;

    /// Lists objects under `prefix`.
    ///
    /// With a delimiter, keys containing the delimiter after the prefix are
    /// rolled up into [`Listing::prefixes`]. Results are lexicographic.
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing>;
}

/// Resolves a bucket name to a backend.
///
/// Notifications name their bucket, so the engine asks for a backend per
/// invocation.
pub trait StorageProvider: Send + Sync + 'static {
    /// Returns the backend for `bucket`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket name is invalid or the backend cannot be built.
    fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>>;
}

/// In-memory storage backend for testing.
///
/// Thread-safe via `RwLock`. Not suitable for production. Generations come
/// from a backend-wide counter so a deleted-then-recreated object never
/// reuses an old generation, matching GCS.
#[derive(Debug)]
pub struct MemoryBackend {
    bucket: String,
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
    next_generation: AtomicI64,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    generation: i64,
    created_at: DateTime<Utc>,
}

impl StoredObject {
    fn meta(&self, path: &str) -> ObjectMeta {
        ObjectMeta {
            path: path.to_string(),
            size: self.data.len() as u64,
            version: self.generation.to_string(),
            created_at: self.created_at,
            updated_at: self.created_at,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new("memory")
    }
}

impl MemoryBackend {
    /// Creates a new empty memory backend for `bucket`.
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::new(RwLock::new(BTreeMap::new())),
            next_generation: AtomicI64::new(1),
        }
    }

    /// Moves an object's `timeCreated` into the past (test hook for age checks).
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the object doesn't exist.
    pub fn backdate(&self, path: &str, by: chrono::Duration) -> Result<()> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;
        let obj = objects.get_mut(path).ok_or_else(|| Error::not_found(path))?;
        obj.created_at -= by;
        Ok(())
    }

    /// Returns every stored key in lexicographic order.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn keys(&self) -> Result<Vec<String>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.keys().cloned().collect())
    }
}

fn poisoned() -> Error {
    Error::Internal {
        message: "lock poisoned".into(),
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn get(&self, path: &str) -> Result<Bytes> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        objects
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found(path))
    }

    async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
        let objects = self.objects.read().map_err(|_| poisoned())?;
        Ok(objects.get(path).map(|obj| obj.meta(path)))
    }

    async fn put(
        &self,
        path: &str,
        data: Bytes,
        precondition: WritePrecondition,
    ) -> Result<WriteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let current = objects.get(path);

        match precondition {
            WritePrecondition::DoesNotExist => {
                if let Some(obj) = current {
                    return Ok(WriteResult::PreconditionFailed {
                        current_version: obj.generation.to_string(),
                    });
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let expected_num: i64 = expected.parse().unwrap_or(-1);
                match current {
                    Some(obj) if obj.generation != expected_num => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: obj.generation.to_string(),
                        });
                    }
                    None => {
                        return Ok(WriteResult::PreconditionFailed {
                            current_version: "0".to_string(),
                        });
                    }
                    _ => {}
                }
            }
            WritePrecondition::None => {}
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        objects.insert(
            path.to_string(),
            StoredObject {
                data,
                generation,
                created_at: Utc::now(),
            },
        );
        drop(objects);

        Ok(WriteResult::Success {
            version: generation.to_string(),
        })
    }

    async fn delete(&self, path: &str, precondition: WritePrecondition) -> Result<DeleteResult> {
        let mut objects = self.objects.write().map_err(|_| poisoned())?;

        let Some(current) = objects.get(path) else {
            return Ok(DeleteResult::NotFound);
        };

        let allowed = match &precondition {
            WritePrecondition::None => true,
            WritePrecondition::DoesNotExist => false,
            WritePrecondition::MatchesVersion(expected) => {
                expected.parse::<i64>().ok() == Some(current.generation)
            }
        };
        if !allowed {
            return Ok(DeleteResult::PreconditionFailed {
                current_version: current.generation.to_string(),
            });
        }

        objects.remove(path);
        Ok(DeleteResult::Deleted)
    }

    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let objects = self.objects.read().map_err(|_| poisoned())?;

        let mut listing = Listing::default();
        let mut prefixes = BTreeSet::new();
        for (path, obj) in objects.range(prefix.to_string()..) {
            let Some(rest) = path.strip_prefix(prefix) else {
                break;
            };
            if let Some(delim) = delimiter.filter(|d| !d.is_empty()) {
                if let Some(idx) = rest.find(delim) {
                    prefixes.insert(format!("{prefix}{}", &rest[..idx + delim.len()]));
                    continue;
                }
            }
            listing.objects.push(obj.meta(path));
        }
        listing.prefixes = prefixes.into_iter().collect();
        Ok(listing)
    }
}

/// In-memory provider that hands out one [`MemoryBackend`] per bucket.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    buckets: Mutex<HashMap<String, Arc<MemoryBackend>>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the concrete memory backend for `bucket`, creating it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the internal lock is poisoned.
    pub fn memory_bucket(&self, bucket: &str) -> Result<Arc<MemoryBackend>> {
        let mut buckets = self.buckets.lock().map_err(|_| poisoned())?;
        Ok(Arc::clone(
            buckets
                .entry(bucket.to_string())
                .or_insert_with(|| Arc::new(MemoryBackend::new(bucket))),
        ))
    }
}

impl StorageProvider for MemoryProvider {
    fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = self.memory_bucket(bucket)?;
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new("b");
        let data = Bytes::from("hello world");

        let result = backend
            .put("d/t/part-0", data.clone(), WritePrecondition::None)
            .await
            .expect("put should succeed");
        assert!(result.is_success());

        let retrieved = backend.get("d/t/part-0").await.expect("get should succeed");
        assert_eq!(retrieved, data);
    }

    #[tokio::test]
    async fn test_object_meta_has_generation_and_created_at() {
        let backend = MemoryBackend::new("b");
        backend
            .put("test.txt", Bytes::from("data"), WritePrecondition::None)
            .await
            .expect("put should succeed");

        let meta = backend
            .head("test.txt")
            .await
            .expect("head should succeed")
            .expect("object should exist");

        assert_eq!(meta.path, "test.txt");
        assert_eq!(meta.size, 4);
        assert!(!meta.version.is_empty(), "must have generation");
        assert!(meta.created_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_precondition_does_not_exist() {
        let backend = MemoryBackend::new("b");

        let result = backend
            .put("new", Bytes::new(), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::Success { .. }));

        let result = backend
            .put("new", Bytes::new(), WritePrecondition::DoesNotExist)
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_precondition_matches_version() {
        let backend = MemoryBackend::new("b");

        let WriteResult::Success {
            version: first_version,
        } = backend
            .put("gen", Bytes::from("v1"), WritePrecondition::None)
            .await
            .expect("should succeed")
        else {
            panic!("expected success");
        };

        let result = backend
            .put(
                "gen",
                Bytes::from("v2"),
                WritePrecondition::MatchesVersion(first_version.clone()),
            )
            .await
            .expect("should succeed");
        assert!(result.is_success());

        let result = backend
            .put(
                "gen",
                Bytes::from("v3"),
                WritePrecondition::MatchesVersion(first_version),
            )
            .await
            .expect("should succeed");
        assert!(matches!(result, WriteResult::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn test_recreated_object_gets_fresh_generation() {
        let backend = MemoryBackend::new("b");
        let WriteResult::Success { version: v1 } = backend
            .put("x", Bytes::new(), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };
        backend
            .delete("x", WritePrecondition::None)
            .await
            .expect("delete");
        let WriteResult::Success { version: v2 } = backend
            .put("x", Bytes::new(), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };
        assert_ne!(v1, v2);
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let backend = MemoryBackend::new("b");
        let WriteResult::Success { version } = backend
            .put("lock", Bytes::from("job"), WritePrecondition::None)
            .await
            .expect("put")
        else {
            panic!("expected success");
        };

        let stale = backend
            .delete("lock", WritePrecondition::MatchesVersion("999".into()))
            .await
            .expect("delete");
        assert!(matches!(stale, DeleteResult::PreconditionFailed { .. }));

        let ok = backend
            .delete("lock", WritePrecondition::MatchesVersion(version))
            .await
            .expect("delete");
        assert_eq!(ok, DeleteResult::Deleted);

        let gone = backend
            .delete("lock", WritePrecondition::None)
            .await
            .expect("delete");
        assert_eq!(gone, DeleteResult::NotFound);
    }

    #[tokio::test]
    async fn test_list_is_lexicographic_and_delimited() {
        let backend = MemoryBackend::new("b");
        for key in [
            "d/t/02/_SUCCESS",
            "d/t/00/_SUCCESS",
            "d/t/file-b",
            "d/t/file-a",
            "d/u/file",
        ] {
            backend
                .put(key, Bytes::from("x"), WritePrecondition::None)
                .await
                .expect("put");
        }

        let flat = backend.list("d/t/", None).await.expect("list");
        let keys: Vec<_> = flat.objects.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(
            keys,
            vec!["d/t/00/_SUCCESS", "d/t/02/_SUCCESS", "d/t/file-a", "d/t/file-b"]
        );
        assert!(flat.prefixes.is_empty());

        let delimited = backend.list("d/t/", Some("/")).await.expect("list");
        let keys: Vec<_> = delimited.objects.iter().map(|o| o.path.as_str()).collect();
        assert_eq!(keys, vec!["d/t/file-a", "d/t/file-b"]);
        assert_eq!(delimited.prefixes, vec!["d/t/00/", "d/t/02/"]);
    }

    #[tokio::test]
    async fn test_backdate_moves_created_at() {
        let backend = MemoryBackend::new("b");
        backend
            .put("_BACKFILL", Bytes::new(), WritePrecondition::None)
            .await
            .expect("put");
        backend
            .backdate("_BACKFILL", chrono::Duration::hours(1))
            .expect("backdate");
        let meta = backend.head("_BACKFILL").await.expect("head").expect("meta");
        assert!(Utc::now() - meta.created_at >= chrono::Duration::minutes(59));
    }

    #[test]
    fn test_provider_reuses_bucket_backend() {
        let provider = MemoryProvider::new();
        let a = provider.memory_bucket("b").expect("bucket");
        let b = provider.memory_bucket("b").expect("bucket");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(provider.bucket("c").expect("bucket").bucket(), "c");
    }

    #[test]
    fn test_precondition_from_observed() {
        assert_eq!(
            WritePrecondition::from_observed(None),
            WritePrecondition::DoesNotExist
        );
        assert_eq!(
            WritePrecondition::from_observed(Some("7")),
            WritePrecondition::MatchesVersion("7".into())
        );
    }
}
