//! Resolution of producer config files from ancestor `_config/` directories.
//!
//! For a key `d/t/00/_SUCCESS` the directories searched are, leaf first:
//! `d/t/00/_config/`, `d/t/_config/`, `d/_config/`, `_config/`.
//!
//! JSON configs from every level are deep-merged root to leaf, so a deeper
//! directory overrides a shallower one. SQL transforms and the `ORDERME`
//! sentinel use the nearest match only.

use bytes::Bytes;
use serde_json::{Map, Value, json};

use landfall_core::StorageBackend;

use crate::error::{IngestError, Result};
use crate::paths::{CONFIG_DIR, ORDERME_FILENAME, basename, dirname, join};

/// Load job config file name.
pub const LOAD_CONFIG_FILENAME: &str = "load.json";

/// External table config file name.
pub const EXTERNAL_CONFIG_FILENAME: &str = "external.json";

/// Wildcard matching SQL transform files.
pub const TRANSFORM_SQL_PATTERN: &str = "*.sql";

/// Placeholder replaced with the destination dataset.
pub const DEST_DATASET_PLACEHOLDER: &str = "{dest_dataset}";

/// Placeholder replaced with the destination table (with partition decorator).
pub const DEST_TABLE_PLACEHOLDER: &str = "{dest_table}";

/// A config file found under some ancestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    /// Object key of the file.
    pub path: String,
    /// Raw file contents.
    pub body: Bytes,
}

/// Walks ancestor `_config/` directories of a key.
pub struct ConfigResolver<'a> {
    storage: &'a dyn StorageBackend,
}

impl<'a> ConfigResolver<'a> {
    /// Creates a resolver over one bucket.
    #[must_use]
    pub fn new(storage: &'a dyn StorageBackend) -> Self {
        Self { storage }
    }

    /// Returns every match of `filename` from the root down to the key's directory.
    ///
    /// `filename` may be a wildcard such as `*.sql`; at most one object per
    /// directory may match it.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigConflict`] on multiple wildcard matches in
    /// one directory, or a storage error.
    pub async fn find_all(&self, key: &str, filename: &str) -> Result<Vec<ConfigFile>> {
        let mut found = Vec::new();
        for dir in config_dirs(key) {
            if let Some(file) = self.find_in(&dir, filename).await? {
                found.push(file);
            }
        }
        found.reverse();
        Ok(found)
    }

    /// Returns the match of `filename` nearest to the key.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigConflict`] on multiple wildcard matches in
    /// one directory, or a storage error.
    pub async fn find_nearest(&self, key: &str, filename: &str) -> Result<Option<ConfigFile>> {
        for dir in config_dirs(key) {
            if let Some(file) = self.find_in(&dir, filename).await? {
                return Ok(Some(file));
            }
        }
        Ok(None)
    }

    /// Builds the load job configuration for `key`.
    ///
    /// `base` is the built-in root config; every `load.json` found is merged
    /// over it. Without any `load.json` the delimited-text default applies.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file is not a JSON object or cannot be read.
    pub async fn load_config(&self, key: &str, mut base: Value) -> Result<Value> {
        let files = self.find_all(key, LOAD_CONFIG_FILENAME).await?;
        if files.is_empty() {
            tracing::warn!(
                key,
                "no {LOAD_CONFIG_FILENAME} found in any ancestor {CONFIG_DIR}/, loading as CSV"
            );
            deep_merge(&mut base, default_load_config());
        }
        for file in files {
            deep_merge(&mut base, parse_object(&file)?);
        }
        Ok(base)
    }

    /// Builds the external table definition for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::ConfigMissing`] if the merged definition has no
    /// `sourceFormat`, or an error if a config file is not a JSON object or
    /// cannot be read.
    pub async fn external_config(&self, key: &str) -> Result<Value> {
        let files = self.find_all(key, EXTERNAL_CONFIG_FILENAME).await?;
        let mut merged = default_external_config();
        if files.is_empty() {
            tracing::debug!(key, "no {EXTERNAL_CONFIG_FILENAME} found, using PARQUET");
        }
        for file in files {
            deep_merge(&mut merged, parse_object(&file)?);
        }
        let has_format = merged
            .get("sourceFormat")
            .and_then(Value::as_str)
            .is_some_and(|format| !format.trim().is_empty());
        if !has_format {
            return Err(IngestError::ConfigMissing {
                message: format!("{EXTERNAL_CONFIG_FILENAME} for {key} leaves sourceFormat unset"),
            });
        }
        Ok(merged)
    }

    /// Returns the nearest SQL transform for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if two SQL files share a directory, the file is not
    /// UTF-8, or [`IngestError::ConfigMissing`] if it is blank.
    pub async fn transform_sql(&self, key: &str) -> Result<Option<String>> {
        let Some(file) = self.find_nearest(key, TRANSFORM_SQL_PATTERN).await? else {
            return Ok(None);
        };
        let sql = String::from_utf8(file.body.to_vec()).map_err(|e| {
            landfall_core::Error::Serialization {
                message: format!("{} is not UTF-8: {e}", file.path),
            }
        })?;
        if sql.trim().is_empty() {
            return Err(IngestError::ConfigMissing {
                message: format!("transform {} is empty", file.path),
            });
        }
        Ok(Some(sql))
    }

    /// Returns true if an `ORDERME` sentinel exists in any ancestor `_config/`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if a lookup fails.
    pub async fn ordering_enabled(&self, key: &str) -> Result<bool> {
        for dir in config_dirs(key) {
            if self
                .storage
                .head(&join(&dir, ORDERME_FILENAME))
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn find_in(&self, dir: &str, filename: &str) -> Result<Option<ConfigFile>> {
        if !filename.contains('*') {
            let path = join(dir, filename);
            return match self.storage.get(&path).await {
                Ok(body) => Ok(Some(ConfigFile { path, body })),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            };
        }

        let listing = self.storage.list(&format!("{dir}/"), Some("/")).await?;
        let matches: Vec<String> = listing
            .objects
            .into_iter()
            .map(|o| o.path)
            .filter(|p| wildcard_match(filename, basename(p)))
            .collect();
        if matches.len() > 1 {
            return Err(IngestError::ConfigConflict {
                directory: dir.to_string(),
                matches,
            });
        }
        let Some(path) = matches.into_iter().next() else {
            return Ok(None);
        };
        let body = self.storage.get(&path).await?;
        Ok(Some(ConfigFile { path, body }))
    }
}

/// Recursively merges `overlay` into `base`; the overlay wins.
///
/// Objects merge key by key. Arrays and scalars replace wholesale.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Substitutes the destination placeholders in a SQL transform.
///
/// The substitution is plain text; identifiers come from the destination
/// pattern's restricted alphabet.
#[must_use]
pub fn render_sql(sql: &str, dataset: &str, table: &str) -> String {
    sql.replace(DEST_DATASET_PLACEHOLDER, dataset)
        .replace(DEST_TABLE_PLACEHOLDER, table)
}

/// Root of every load job configuration.
#[must_use]
pub fn base_load_config(labels: Map<String, Value>) -> Value {
    json!({
        "writeDisposition": "WRITE_APPEND",
        "labels": labels,
    })
}

/// Load settings used when no `load.json` exists.
#[must_use]
pub fn default_load_config() -> Value {
    json!({
        "sourceFormat": "CSV",
        "fieldDelimiter": ",",
    })
}

/// External table definition used when no `external.json` exists.
#[must_use]
pub fn default_external_config() -> Value {
    json!({ "sourceFormat": "PARQUET" })
}

/// `_config/` directories above `key`, leaf first.
fn config_dirs(key: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let mut dir = dirname(key);
    loop {
        dirs.push(join(dir, CONFIG_DIR));
        if dir.is_empty() {
            break;
        }
        dir = dirname(dir);
    }
    dirs
}

fn parse_object(file: &ConfigFile) -> Result<Value> {
    let value: Value = serde_json::from_slice(&file.body).map_err(|e| {
        landfall_core::Error::Serialization {
            message: format!("{} is not valid JSON: {e}", file.path),
        }
    })?;
    if !value.is_object() {
        return Err(landfall_core::Error::Serialization {
            message: format!("{} must contain a JSON object", file.path),
        }
        .into());
    }
    Ok(value)
}

/// Matches a basename against a pattern with at most one `*`.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        Some((head, tail)) => {
            name.len() >= head.len() + tail.len() && name.starts_with(head) && name.ends_with(tail)
        }
        None => pattern == name,
    }
}
