//! Producer-side fixtures.
//!
//! A [`Producer`] writes what an upstream system would: data files, success
//! markers and `_config/` files.

use bytes::Bytes;
use landfall_core::storage::{StorageBackend, WritePrecondition};
use serde_json::Value;

/// Writes producer objects into a bucket.
pub struct Producer<'a> {
    storage: &'a dyn StorageBackend,
}

impl<'a> Producer<'a> {
    /// Creates a producer writing to `storage`.
    pub fn new(storage: &'a dyn StorageBackend) -> Self {
        Self { storage }
    }

    /// Writes `body` at `key`.
    pub async fn put(&self, key: &str, body: impl Into<Bytes>) {
        self.storage
            .put(key, body.into(), WritePrecondition::None)
            .await
            .expect("producer write");
    }

    /// Writes one data file.
    pub async fn data(&self, key: &str, body: &str) {
        self.put(key, body.to_string()).await;
    }

    /// Writes the zero-byte success marker `<dir>/_SUCCESS`.
    pub async fn success(&self, dir: &str) -> String {
        let key = format!("{dir}/_SUCCESS");
        self.put(&key, Bytes::new()).await;
        key
    }

    /// Writes `files` small CSV files under `dir`, then its success marker.
    ///
    /// Returns the marker key.
    pub async fn batch(&self, dir: &str, files: usize) -> String {
        for i in 0..files {
            self.data(&format!("{dir}/part-{i:05}.csv"), "id,value\n1,a\n")
                .await;
        }
        self.success(dir).await
    }

    /// Writes `<dir>/_config/<name>` as JSON.
    pub async fn json_config(&self, dir: &str, name: &str, value: &Value) {
        let body = serde_json::to_vec(value).expect("serialize config");
        self.put(&config_key(dir, name), body).await;
    }

    /// Writes a SQL transform `<dir>/_config/<name>`.
    pub async fn sql(&self, dir: &str, name: &str, sql: &str) {
        self.put(&config_key(dir, name), sql.to_string()).await;
    }

    /// Enables ordered mode for everything below `dir`.
    pub async fn order(&self, dir: &str) {
        self.put(&config_key(dir, "ORDERME"), Bytes::new()).await;
    }
}

fn config_key(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        format!("_config/{name}")
    } else {
        format!("{dir}/_config/{name}")
    }
}
