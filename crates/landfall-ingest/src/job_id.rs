//! Warehouse job identifiers and labels.

use serde_json::{Map, Value};
use uuid::Uuid;

/// Longest job id the warehouse accepts.
pub const MAX_JOB_ID_LEN: usize = 1024;

/// Longest label key or value the warehouse accepts.
pub const MAX_LABEL_LEN: usize = 63;

/// Value of the `component` label on every job.
pub const COMPONENT_LABEL: &str = "event-based-gcs-ingest";

/// Length of the random suffix of a derived id.
const SUFFIX_LEN: usize = 32;

/// Room kept free in every derived id for a `-part{n}` tag.
const PART_TAG_ROOM: usize = 16;

/// Derives a job id from a success marker key.
///
/// Slashes become dashes, anything outside `[A-Za-z0-9_-]` becomes an
/// underscore, `prefix` is prepended and a random suffix appended. The
/// sanitized key is truncated so the whole id, plus a part tag, fits
/// [`MAX_JOB_ID_LEN`].
#[must_use]
pub fn job_id_for(prefix: &str, marker_key: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}-{suffix}", id_body(prefix, marker_key))
}

/// Whether `job_id`, or one of its parts, was derived from `marker_key` by
/// [`job_id_for`] with the same `prefix`.
#[must_use]
pub fn derived_from(job_id: &str, prefix: &str, marker_key: &str) -> bool {
    let Some(rest) = job_id
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(id_body(prefix, marker_key).as_str()))
        .and_then(|rest| rest.strip_prefix('-'))
    else {
        return false;
    };
    let (suffix, _) = split_part(rest);
    suffix.len() == SUFFIX_LEN && suffix.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Splits a part id into the id of its load and the part index; the final
/// part, or a single job, has no index.
#[must_use]
pub fn split_part(job_id: &str) -> (&str, Option<usize>) {
    let Some((base, tag)) = job_id.rsplit_once("-part") else {
        return (job_id, None);
    };
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return (job_id, None);
    }
    match tag.parse() {
        Ok(index) => (base, Some(index)),
        Err(_) => (job_id, None),
    }
}

fn id_body(prefix: &str, marker_key: &str) -> String {
    let room = MAX_JOB_ID_LEN.saturating_sub(prefix.len() + SUFFIX_LEN + 1 + PART_TAG_ROOM);
    sanitize(marker_key).chars().take(room).collect()
}

/// Id of part `index` of a multi-batch load; the last part uses `job_id` itself.
#[must_use]
pub fn part_job_id(job_id: &str, index: usize, total: usize) -> String {
    if index + 1 == total {
        return job_id.to_string();
    }
    let tag = format!("-part{index}");
    let head: String = job_id
        .chars()
        .take(MAX_JOB_ID_LEN.saturating_sub(tag.len()))
        .collect();
    format!("{head}{tag}")
}

fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' => '-',
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => c,
            _ => '_',
        })
        .collect()
}

/// Default labels of a job triggered from `bucket`.
#[must_use]
pub fn default_labels(
    function_name: &str,
    bucket: &str,
    batch_id: Option<&str>,
) -> Map<String, Value> {
    let mut labels = Map::new();
    labels.insert("component".into(), Value::from(COMPONENT_LABEL));
    labels.insert(
        "function-name".into(),
        Value::from(sanitize_label(function_name)),
    );
    labels.insert("bucket-id".into(), Value::from(sanitize_label(bucket)));
    if let Some(batch) = batch_id {
        labels.insert("batch-id".into(), Value::from(sanitize_label(batch)));
    }
    labels
}

/// Maps a value into the label alphabet: lowercase `[a-z0-9_-]`, at most 63 chars.
#[must_use]
pub fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|c| match c.to_ascii_lowercase() {
            c @ ('a'..='z' | '0'..='9' | '_' | '-') => c,
            _ => '_',
        })
        .take(MAX_LABEL_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_prefixed_and_sanitized() {
        let id = job_id_for("gcf-ingest-", "d/t/2020 01/_SUCCESS");
        assert!(id.starts_with("gcf-ingest-d-t-2020_01-_SUCCESS-"));
        assert_eq!(id.len(), "gcf-ingest-d-t-2020_01-_SUCCESS-".len() + 32);
    }

    #[test]
    fn job_ids_are_unique_per_call() {
        assert_ne!(
            job_id_for("gcf-ingest-", "d/t/_SUCCESS"),
            job_id_for("gcf-ingest-", "d/t/_SUCCESS")
        );
    }

    #[test]
    fn long_keys_are_clamped() {
        let key = "x/".repeat(2000);
        let id = job_id_for("gcf-ingest-", &key);
        assert_eq!(id.len(), MAX_JOB_ID_LEN - PART_TAG_ROOM);
        assert!(id.starts_with("gcf-ingest-x-x-"));
        let last = part_job_id(&id, 41, 42);
        assert_eq!(last, id);
        assert!(part_job_id(&id, 40, 42).ends_with("-part40"));
        assert!(derived_from(&part_job_id(&id, 40, 42), "gcf-ingest-", &key));
    }

    #[test]
    fn derived_ids_are_recognized() {
        let id = job_id_for("gcf-ingest-", "d/t/00/_SUCCESS");
        assert!(derived_from(&id, "gcf-ingest-", "d/t/00/_SUCCESS"));
        assert!(derived_from(&part_job_id(&id, 0, 2), "gcf-ingest-", "d/t/00/_SUCCESS"));
        assert!(!derived_from(&id, "gcf-ingest-", "d/t/01/_SUCCESS"));
        assert!(!derived_from(&id, "other-", "d/t/00/_SUCCESS"));
        assert!(!derived_from("gcf-ingest-previous", "gcf-ingest-", "d/t/00/_SUCCESS"));

        let other = job_id_for("gcf-ingest-", "d/t/00/x/_SUCCESS");
        assert!(!derived_from(&other, "gcf-ingest-", "d/t/00/_SUCCESS"));
    }

    #[test]
    fn part_ids_split_back_into_their_load() {
        let id = job_id_for("gcf-ingest-", "d/t/x-part3/_SUCCESS");
        assert_eq!(split_part(&id), (id.as_str(), None));
        assert_eq!(split_part(&part_job_id(&id, 3, 5)), (id.as_str(), Some(3)));
        assert_eq!(split_part("j-part"), ("j-part", None));
    }

    #[test]
    fn part_ids_keep_last_part_as_base() {
        assert_eq!(part_job_id("j", 0, 1), "j");
        assert_eq!(part_job_id("j", 0, 3), "j-part0");
        assert_eq!(part_job_id("j", 2, 3), "j");
        let long = "a".repeat(MAX_JOB_ID_LEN);
        assert_eq!(part_job_id(&long, 0, 2).len(), MAX_JOB_ID_LEN);
    }

    #[test]
    fn labels_are_sanitized() {
        let labels = default_labels("My Function", "Bucket.Name", Some("B7"));
        assert_eq!(labels["component"], COMPONENT_LABEL);
        assert_eq!(labels["function-name"], "my_function");
        assert_eq!(labels["bucket-id"], "bucket_name");
        assert_eq!(labels["batch-id"], "b7");
        assert_eq!(sanitize_label(&"a".repeat(100)).len(), MAX_LABEL_LEN);
    }
}
