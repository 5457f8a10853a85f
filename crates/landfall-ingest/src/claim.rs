//! Duplicate-notification guard.
//!
//! A marker is claimed by creating a sibling object whose name embeds the
//! marker's `timeCreated`. Creation uses `ifGenerationMatch=0`, so exactly one
//! invocation wins per marker generation. Redelivery of the same notification
//! loses; deleting and re-creating the marker changes `timeCreated` and wins
//! again.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use landfall_core::{ObjectMeta, StorageBackend, WritePrecondition, WriteResult};

use crate::error::{IngestError, Result};
use crate::paths::{CLAIM_PREFIX, basename, dirname, join};

/// Key of the claim object for a marker created at `created_at`.
#[must_use]
pub fn claim_key(marker_key: &str, created_at: DateTime<Utc>) -> String {
    let name = format!(
        "{CLAIM_PREFIX}{}_created_at_{}",
        basename(marker_key),
        created_at.format("%Y%m%dT%H%M%S%.9fZ"),
    );
    join(dirname(marker_key), &name)
}

/// Claims the current generation of `marker_key`.
///
/// Returns the marker's metadata on success.
///
/// # Errors
///
/// Returns [`IngestError::Duplicate`] if the marker was already claimed, or a
/// not-found storage error if the marker no longer exists.
pub async fn claim(storage: &dyn StorageBackend, marker_key: &str) -> Result<ObjectMeta> {
    let marker = storage
        .head(marker_key)
        .await?
        .ok_or_else(|| landfall_core::Error::not_found(marker_key))?;
    claim_object(storage, &marker).await?;
    Ok(marker)
}

/// Claims an already-fetched marker.
///
/// # Errors
///
/// Returns [`IngestError::Duplicate`] if the marker was already claimed.
pub async fn claim_object(storage: &dyn StorageBackend, marker: &ObjectMeta) -> Result<String> {
    let key = claim_key(&marker.path, marker.created_at);
    match storage
        .put(&key, Bytes::new(), WritePrecondition::DoesNotExist)
        .await?
    {
        WriteResult::Success { .. } => {
            tracing::debug!(claim = %key, "claimed marker");
            Ok(key)
        }
        WriteResult::PreconditionFailed { .. } => Err(IngestError::Duplicate { claim: key }),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use landfall_core::MemoryBackend;

    use super::*;

    #[test]
    fn claim_key_is_a_sibling() {
        let created = Utc
            .with_ymd_and_hms(2024, 1, 2, 3, 4, 5)
            .single()
            .expect("timestamp");
        assert_eq!(
            claim_key("d/t/00/_SUCCESS", created),
            "d/t/00/_claimed__SUCCESS_created_at_20240102T030405.000000000Z"
        );
        assert!(claim_key("_SUCCESS", created).starts_with("_claimed__SUCCESS_"));
    }

    #[tokio::test]
    async fn second_claim_is_duplicate() {
        let backend = MemoryBackend::new("b");
        backend
            .put("d/t/_SUCCESS", Bytes::new(), WritePrecondition::None)
            .await
            .expect("put");

        let marker = claim(&backend, "d/t/_SUCCESS").await.expect("first claim");
        assert_eq!(marker.path, "d/t/_SUCCESS");

        let err = claim(&backend, "d/t/_SUCCESS").await.expect_err("duplicate");
        assert!(matches!(err, IngestError::Duplicate { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn recreated_marker_can_be_claimed_again() {
        let backend = MemoryBackend::new("b");
        backend
            .put("d/t/_SUCCESS", Bytes::new(), WritePrecondition::None)
            .await
            .expect("put");
        backend
            .backdate("d/t/_SUCCESS", chrono::Duration::minutes(10))
            .expect("backdate");
        claim(&backend, "d/t/_SUCCESS").await.expect("first claim");

        backend
            .put("d/t/_SUCCESS", Bytes::new(), WritePrecondition::None)
            .await
            .expect("recreate");
        claim(&backend, "d/t/_SUCCESS").await.expect("new generation claims");
    }

    #[tokio::test]
    async fn missing_marker_is_not_found() {
        let backend = MemoryBackend::new("b");
        let err = claim(&backend, "d/t/_SUCCESS").await.expect_err("missing");
        assert!(matches!(err, IngestError::Core(e) if e.is_not_found()));
    }
}
