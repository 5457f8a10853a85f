//! Source file enumeration and batch packing for load jobs.

use landfall_core::{ObjectMeta, StorageBackend};

use crate::error::{IngestError, Result};
use crate::paths::{BACKLOG_DIR, CONFIG_DIR, basename, gcs_uri};

/// Upper bounds of one load job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    /// Maximum total bytes of one batch.
    pub max_bytes: u64,
    /// Maximum number of URIs in one batch.
    pub max_uris: usize,
}

/// One group of source URIs submitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    /// `gs://` URIs in list order.
    pub uris: Vec<String>,
    /// Total size of the objects.
    pub bytes: u64,
}

/// Lists the loadable objects directly under `prefix` and packs them into batches.
///
/// `prefix` is the success marker's directory with a trailing `/` (or empty at
/// the bucket root).
///
/// # Errors
///
/// Returns [`IngestError::NoInput`] if nothing is loadable, or a storage error.
pub async fn gather_batches(
    storage: &dyn StorageBackend,
    prefix: &str,
    success_filename: &str,
    limits: BatchLimits,
) -> Result<Vec<Batch>> {
    let listing = storage.list(prefix, Some("/")).await?;
    let bucket = storage.bucket();
    let sources = listing
        .objects
        .into_iter()
        .filter(|obj| is_source(obj, prefix, success_filename))
        .map(|obj| (gcs_uri(bucket, &obj.path), obj.size));

    let batches = pack(sources, limits);
    if batches.is_empty() {
        return Err(IngestError::NoInput {
            prefix: prefix.to_string(),
        });
    }
    tracing::debug!(
        prefix,
        batches = batches.len(),
        "gathered source files"
    );
    Ok(batches)
}

/// Packs `(uri, size)` pairs into batches that respect `limits`.
///
/// An object that does not fit closes the current batch and starts the next
/// one, even if it alone exceeds the byte bound.
pub fn pack(sources: impl IntoIterator<Item = (String, u64)>, limits: BatchLimits) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch::default();
    for (uri, size) in sources {
        let over_bytes = current.bytes.saturating_add(size) > limits.max_bytes;
        let over_uris = current.uris.len() + 1 > limits.max_uris;
        if !current.uris.is_empty() && (over_bytes || over_uris) {
            batches.push(std::mem::take(&mut current));
        }
        current.uris.push(uri);
        current.bytes = current.bytes.saturating_add(size);
    }
    if !current.uris.is_empty() {
        batches.push(current);
    }
    batches
}

fn is_source(obj: &ObjectMeta, prefix: &str, success_filename: &str) -> bool {
    if obj.size == 0 || obj.path == prefix {
        return false;
    }
    let name = basename(&obj.path);
    if name == success_filename {
        return false;
    }
    let rel = obj.path.strip_prefix(prefix).unwrap_or(&obj.path);
    !(rel.starts_with(&format!("{CONFIG_DIR}/")) || rel.starts_with(&format!("{BACKLOG_DIR}/")))
}
