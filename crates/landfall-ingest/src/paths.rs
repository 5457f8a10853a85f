//! Object-key layout and destination resolution.
//!
//! A destination pattern is a named-capture regular expression over object
//! keys. It must capture `dataset` and `table`; `project`, `partition`,
//! `yyyy`, `mm`, `dd`, `hh` and `batch` are optional. The table prefix of a key
//! is everything up to the end of the `table` capture, and every engine-owned
//! object for that table lives directly below it:
//!
//! ```text
//! <table-prefix>/_bqlock                  table lock
//! <table-prefix>/_BACKFILL                subscriber trigger
//! <table-prefix>/_backlog/<suffix>        backlog pointer for <table-prefix>/<suffix>
//! <dir>/_claimed_<name>_created_at_<ts>   claim of <dir>/<name>
//! <dir>/_config/{load.json,external.json,*.sql,ORDERME}
//! ```

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use crate::config::IngestConfig;
use crate::error::{IngestError, Result};

/// Default success marker basename.
pub const DEFAULT_SUCCESS_FILENAME: &str = "_SUCCESS";

/// Basename of the backfill marker.
pub const BACKFILL_FILENAME: &str = "_BACKFILL";

/// Basename of the table lock.
pub const LOCK_FILENAME: &str = "_bqlock";

/// Directory holding backlog pointers.
pub const BACKLOG_DIR: &str = "_backlog";

/// Directory holding producer config files.
pub const CONFIG_DIR: &str = "_config";

/// Sentinel config file enabling ordered mode.
pub const ORDERME_FILENAME: &str = "ORDERME";

/// Basename prefix of claim markers.
pub const CLAIM_PREFIX: &str = "_claimed_";

/// Default destination pattern.
///
/// `dataset/table[/incremental|/history][/$partition][/yyyy[/mm[/dd[/hh]]]][/batch]/`
pub const DEFAULT_DESTINATION_REGEX: &str = concat!(
    r"^(?P<dataset>[\w\-\.]+)/",
    r"(?P<table>[\w\-]+)/?",
    r"(?:incremental|history)?/?",
    r"(?P<partition>\$[0-9]+)?/?",
    r"(?P<yyyy>[0-9]{4})?/?",
    r"(?P<mm>[0-9]{2})?/?",
    r"(?P<dd>[0-9]{2})?/?",
    r"(?P<hh>[0-9]{2})?/?",
    r"(?P<batch>[\w\-]+)?/",
);

/// Fully qualified destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Project, when captured or configured.
    pub project: Option<String>,
    /// Dataset id.
    pub dataset: String,
    /// Table id, without partition decorator.
    pub table: String,
    /// Partition decorator including the leading `$`.
    pub partition: Option<String>,
}

impl TableRef {
    /// Table id with the partition decorator appended.
    #[must_use]
    pub fn table_id(&self) -> String {
        match &self.partition {
            Some(partition) => format!("{}{partition}", self.table),
            None => self.table.clone(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(project) = &self.project {
            write!(f, "{project}.")?;
        }
        write!(f, "{}.{}", self.dataset, self.table_id())
    }
}

/// Resolved destination of an object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Key prefix shared by every object of this table.
    pub table_prefix: String,
    /// Destination table.
    pub table: TableRef,
    /// Optional batch id, used for labeling.
    pub batch_id: Option<String>,
}

/// Maps an object key to its destination.
///
/// [`DestinationPattern`] is the regex implementation; embedders can supply
/// their own resolver through [`PathParser::with_resolver`].
pub trait DestinationResolver: Send + Sync + fmt::Debug {
    /// Resolves `key`, which has already had any `/_backlog/` segment removed.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::PatternMismatch`] if the key cannot be resolved.
    fn resolve(&self, key: &str) -> Result<Destination>;
}

/// Compiled destination pattern.
#[derive(Debug, Clone)]
pub struct DestinationPattern {
    regex: Regex,
}

impl DestinationPattern {
    /// Compiles and validates a destination pattern.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Configuration`] if the pattern does not compile
    /// or lacks the `dataset` or `table` capture.
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            IngestError::configuration(format!("invalid destination pattern: {e}"))
        })?;
        for required in ["dataset", "table"] {
            if !regex.capture_names().flatten().any(|name| name == required) {
                return Err(IngestError::configuration(format!(
                    "destination pattern must capture `{required}`"
                )));
            }
        }
        Ok(Self { regex })
    }

    /// Returns the source pattern.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl DestinationResolver for DestinationPattern {
    fn resolve(&self, key: &str) -> Result<Destination> {
        let mismatch = |reason: &str| IngestError::PatternMismatch {
            key: key.to_string(),
            reason: reason.to_string(),
        };
        let caps = self
            .regex
            .captures(key)
            .ok_or_else(|| mismatch("no match"))?;
        let capture = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str())
                .filter(|s| !s.is_empty())
        };

        let dataset = capture("dataset").ok_or_else(|| mismatch("no dataset captured"))?;
        let table = caps
            .name("table")
            .filter(|m| !m.as_str().is_empty())
            .ok_or_else(|| mismatch("no table captured"))?;

        let partition = match capture("partition") {
            Some(p) if p.starts_with('$') => Some(p.to_string()),
            Some(p) => Some(format!("${p}")),
            None => capture("yyyy").map(|yyyy| {
                let mut decorator = format!("${yyyy}");
                for part in ["mm", "dd", "hh"] {
                    decorator.push_str(capture(part).unwrap_or_default());
                }
                decorator
            }),
        };

        Ok(Destination {
            table_prefix: key[..table.end()].to_string(),
            table: TableRef {
                project: capture("project").map(str::to_string),
                dataset: dataset.to_string(),
                table: table.as_str().to_string(),
                partition,
            },
            batch_id: capture("batch").map(str::to_string),
        })
    }
}

/// Resolves keys of every kind the engine sees to table prefixes and destinations.
#[derive(Debug, Clone)]
pub struct PathParser {
    resolver: Arc<dyn DestinationResolver>,
    success_filename: String,
    gate_filename: Option<String>,
    default_project: Option<String>,
}

impl PathParser {
    /// Builds a parser from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Configuration`] if the configuration is invalid.
    pub fn new(config: &IngestConfig) -> Result<Self> {
        let pattern = config.validate()?;
        Ok(Self::with_resolver(Arc::new(pattern), config))
    }

    /// Builds a parser around a custom resolver.
    #[must_use]
    pub fn with_resolver(resolver: Arc<dyn DestinationResolver>, config: &IngestConfig) -> Self {
        Self {
            resolver,
            success_filename: config.success_filename.clone(),
            gate_filename: config.start_backfill_filename.clone(),
            default_project: config.default_project.clone(),
        }
    }

    /// Basename of the success marker.
    #[must_use]
    pub fn success_filename(&self) -> &str {
        &self.success_filename
    }

    /// Basename of the start-backfill gate, if the gate is enabled.
    #[must_use]
    pub fn gate_filename(&self) -> Option<&str> {
        self.gate_filename.as_deref()
    }

    /// Returns true for basenames that sit directly at a table prefix.
    #[must_use]
    pub fn is_table_level(&self, name: &str) -> bool {
        name == BACKFILL_FILENAME || name == LOCK_FILENAME || self.gate_filename() == Some(name)
    }

    /// Returns the table prefix a key belongs to.
    ///
    /// Table-level objects (`_BACKFILL`, `_bqlock`, the gate) resolve to their
    /// directory without consulting the pattern.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::PatternMismatch`] if the key cannot be resolved.
    pub fn table_prefix(&self, key: &str) -> Result<String> {
        if self.is_table_level(basename(key)) {
            return Ok(dirname(key).to_string());
        }
        Ok(self.destination(key)?.table_prefix)
    }

    /// Resolves a success marker or backlog pointer key to its destination.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::PatternMismatch`] if the key cannot be resolved.
    pub fn destination(&self, key: &str) -> Result<Destination> {
        let normalized = strip_backlog(key);
        let mut destination = self.resolver.resolve(&normalized)?;
        if destination.table.project.is_none() {
            destination.table.project.clone_from(&self.default_project);
        }
        Ok(destination)
    }
}

/// Returns the last path segment of `key`.
#[must_use]
pub fn basename(key: &str) -> &str {
    key.rsplit_once('/').map_or(key, |(_, name)| name)
}

/// Returns `key` without its last segment (empty at the bucket root).
#[must_use]
pub fn dirname(key: &str) -> &str {
    key.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Joins a directory and a relative name.
#[must_use]
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// Returns true if `key` lies inside a backlog directory.
#[must_use]
pub fn is_backlog_key(key: &str) -> bool {
    key.starts_with("_backlog/") || key.contains("/_backlog/")
}

/// Removes the first `/_backlog/` segment from `key`.
#[must_use]
pub fn strip_backlog(key: &str) -> String {
    key.replacen("/_backlog/", "/", 1)
}

/// Returns the `gs://` URI of an object.
#[must_use]
pub fn gcs_uri(bucket: &str, key: &str) -> String {
    format!("gs://{bucket}/{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> PathParser {
        PathParser::new(&IngestConfig {
            start_backfill_filename: Some("_HISTORYDONE".into()),
            ..IngestConfig::default()
        })
        .expect("parser")
    }

    #[test]
    fn resolves_plain_table() {
        let dest = parser().destination("d/t/_SUCCESS").expect("dest");
        assert_eq!(dest.table_prefix, "d/t");
        assert_eq!(dest.table.dataset, "d");
        assert_eq!(dest.table.table, "t");
        assert_eq!(dest.table.partition, None);
        assert_eq!(dest.batch_id, None);
        assert_eq!(dest.table.to_string(), "d.t");
    }

    #[test]
    fn date_parts_build_partition_decorator() {
        let dest = parser()
            .destination("ds/events/2020/01/02/03/_SUCCESS")
            .expect("dest");
        assert_eq!(dest.table_prefix, "ds/events");
        assert_eq!(dest.table.partition.as_deref(), Some("$2020010203"));
        assert_eq!(dest.table.table_id(), "events$2020010203");
    }

    #[test]
    fn explicit_partition_wins() {
        let dest = parser()
            .destination("ds/events/$20200101/_SUCCESS")
            .expect("dest");
        assert_eq!(dest.table.partition.as_deref(), Some("$20200101"));
    }

    #[test]
    fn history_segment_and_batch_are_captured() {
        let dest = parser()
            .destination("ds/events/history/batch-7/_SUCCESS")
            .expect("dest");
        assert_eq!(dest.table_prefix, "ds/events");
        assert_eq!(dest.batch_id.as_deref(), Some("batch-7"));
    }

    #[test]
    fn backlog_pointer_resolves_to_same_table() {
        let parser = parser();
        let marker = parser.destination("d/t/00/_SUCCESS").expect("marker");
        let pointer = parser
            .destination("d/t/_backlog/00/_SUCCESS")
            .expect("pointer");
        assert_eq!(marker, pointer);
        assert_eq!(pointer.table_prefix, "d/t");
    }

    #[test]
    fn table_level_objects_use_their_directory() {
        let parser = parser();
        assert_eq!(parser.table_prefix("d/t/_BACKFILL").expect("prefix"), "d/t");
        assert_eq!(parser.table_prefix("d/t/_bqlock").expect("prefix"), "d/t");
        assert_eq!(
            parser.table_prefix("d/t/_HISTORYDONE").expect("prefix"),
            "d/t"
        );
        assert_eq!(
            parser.table_prefix("d/t/00/_BACKFILL").expect("prefix"),
            "d/t/00"
        );
    }

    #[test]
    fn unresolvable_key_is_pattern_mismatch() {
        let err = parser().destination("_SUCCESS").expect_err("no dataset");
        assert!(matches!(err, IngestError::PatternMismatch { .. }));
    }

    #[test]
    fn default_project_fills_missing_capture() {
        let config = IngestConfig {
            default_project: Some("p".into()),
            ..IngestConfig::default()
        };
        let parser = PathParser::new(&config).expect("parser");
        let dest = parser.destination("d/t/_SUCCESS").expect("dest");
        assert_eq!(dest.table.to_string(), "p.d.t");

        let config = IngestConfig {
            destination_regex: r"^(?P<project>[\w\-]+)/(?P<dataset>\w+)/(?P<table>\w+)/".into(),
            default_project: Some("fallback".into()),
            ..IngestConfig::default()
        };
        let parser = PathParser::new(&config).expect("parser");
        let dest = parser.destination("proj/d/t/_SUCCESS").expect("dest");
        assert_eq!(dest.table.project.as_deref(), Some("proj"));
    }

    #[test]
    fn path_helpers() {
        assert_eq!(basename("a/b/_SUCCESS"), "_SUCCESS");
        assert_eq!(basename("_SUCCESS"), "_SUCCESS");
        assert_eq!(dirname("a/b/_SUCCESS"), "a/b");
        assert_eq!(dirname("_SUCCESS"), "");
        assert_eq!(join("", "_config/load.json"), "_config/load.json");
        assert_eq!(join("a", "_bqlock"), "a/_bqlock");
        assert!(is_backlog_key("d/t/_backlog/00/_SUCCESS"));
        assert!(!is_backlog_key("d/t/backlog/00/_SUCCESS"));
        assert_eq!(gcs_uri("b", "d/t/part-0"), "gs://b/d/t/part-0");
    }
}
