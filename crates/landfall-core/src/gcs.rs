//! Google Cloud Storage backend over the JSON API.
//!
//! This module provides [`GcsProvider`], which hands out a [`StorageBackend`]
//! per bucket. Every write and delete maps [`WritePrecondition`] onto the
//! `ifGenerationMatch` query parameter, so `DoesNotExist` becomes
//! `ifGenerationMatch=0` and a `412` response becomes a precondition result
//! instead of an error.
//!
//! ## Usage
//!
//! This module is only functional when the `gcp` feature is enabled:
//!
//! ```toml
//! [dependencies]
//! landfall-core = { version = "0.1", features = ["gcp"] }
//! ```
//!
//! Calls are retried with [`RetryPolicy`] when the failure is transient.
//! Preconditioned writes are safe to retry: a replay of a write that already
//! landed reports `PreconditionFailed`, which the engine treats as contention.

use std::time::Duration;

use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Configuration for the GCS backend.
#[derive(Debug, Clone)]
pub struct GcsConfig {
    /// JSON API endpoint (override for emulators).
    pub endpoint: String,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.googleapis.com".to_string(),
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl GcsConfig {
    /// Sets the endpoint (for emulators such as fake-gcs-server).
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Object resource as returned by the JSON API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)] // Fields are only read with the `gcp` feature
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    generation: String,
    time_created: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    updated: Option<chrono::DateTime<chrono::Utc>>,
}

/// One page of `objects.list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)] // Fields are only read with the `gcp` feature
struct GcsListPage {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

// ============================================================================
// GCP Implementation
// ============================================================================

#[cfg(feature = "gcp")]
mod gcp_impl {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use gcp_auth::TokenProvider;
    use reqwest::{Method, StatusCode, Url};

    use super::{GcsConfig, GcsListPage, GcsObject};
    use crate::error::{Error, Result, is_transient_status};
    use crate::storage::{
        DeleteResult, Listing, ObjectMeta, StorageBackend, StorageProvider, WritePrecondition,
        WriteResult,
    };

    const SCOPES: &[&str] = &["https://www.googleapis.com/auth/devstorage.read_write"];

    struct Shared {
        config: GcsConfig,
        token_provider: Arc<dyn TokenProvider>,
        client: reqwest::Client,
    }

    /// GCS provider sharing one HTTP client and token source across buckets.
    #[derive(Clone)]
    pub struct GcsProvider {
        shared: Arc<Shared>,
    }

    // Manual Debug implementation since TokenProvider doesn't implement Debug
    impl std::fmt::Debug for GcsProvider {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("GcsProvider")
                .field("config", &self.shared.config)
                .field("token_provider", &"<TokenProvider>")
                .finish_non_exhaustive()
        }
    }

    impl GcsProvider {
        /// Creates a provider using application default credentials.
        ///
        /// # Errors
        ///
        /// Returns an error if GCP authentication or the HTTP client cannot be initialized.
        pub async fn new(config: GcsConfig) -> Result<Self> {
            let token_provider = gcp_auth::provider()
                .await
                .map_err(|e| Error::storage(format!("failed to initialize GCP auth: {e}")))?;

            let client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .map_err(|e| Error::storage(format!("failed to create HTTP client: {e}")))?;

            Ok(Self {
                shared: Arc::new(Shared {
                    config,
                    token_provider,
                    client,
                }),
            })
        }
    }

    impl StorageProvider for GcsProvider {
        fn bucket(&self, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
            if bucket.is_empty() || bucket.contains('/') {
                return Err(Error::InvalidInput(format!("invalid bucket name: {bucket:?}")));
            }
            Ok(Arc::new(GcsBackend {
                bucket: bucket.to_string(),
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    /// A single-bucket GCS backend.
    pub struct GcsBackend {
        bucket: String,
        shared: Arc<Shared>,
    }

    impl GcsBackend {
        fn objects_url(&self, upload: bool) -> Result<Url> {
            let base = if upload {
                format!("{}/upload/storage/v1/b", self.shared.config.endpoint)
            } else {
                format!("{}/storage/v1/b", self.shared.config.endpoint)
            };
            let mut url = Url::parse(&base)
                .map_err(|e| Error::InvalidInput(format!("invalid GCS endpoint: {e}")))?;
            url.path_segments_mut()
                .map_err(|()| Error::InvalidInput("GCS endpoint cannot be a base".into()))?
                .push(&self.bucket)
                .push("o");
            Ok(url)
        }

        fn object_url(&self, path: &str) -> Result<Url> {
            let mut url = self.objects_url(false)?;
            url.path_segments_mut()
                .map_err(|()| Error::InvalidInput("GCS endpoint cannot be a base".into()))?
                .push(path);
            Ok(url)
        }

        fn apply_precondition(url: &mut Url, precondition: &WritePrecondition) {
            match precondition {
                WritePrecondition::DoesNotExist => {
                    url.query_pairs_mut().append_pair("ifGenerationMatch", "0");
                }
                WritePrecondition::MatchesVersion(generation) => {
                    url.query_pairs_mut()
                        .append_pair("ifGenerationMatch", generation);
                }
                WritePrecondition::None => {}
            }
        }

        async fn send(&self, method: Method, url: Url, body: Option<Bytes>) -> Result<reqwest::Response> {
            let token = self
                .shared
                .token_provider
                .token(SCOPES)
                .await
                .map_err(|e| Error::transient(format!("failed to get GCP access token: {e}")))?;

            let mut request = self
                .shared
                .client
                .request(method, url)
                .bearer_auth(token.as_str());
            if let Some(body) = body {
                request = request
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(body);
            }
            request.send().await.map_err(|e| {
                let transient = e.is_timeout() || e.is_connect() || e.is_request();
                Error::storage_with_source("GCS request failed", transient, e)
            })
        }

        async fn error_for(response: reqwest::Response, context: &str) -> Error {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            let message = format!("GCS {context} failed: {status} - {body}");
            if is_transient_status(status.as_u16()) {
                Error::transient(message)
            } else {
                Error::storage(message)
            }
        }

        fn to_meta(object: GcsObject) -> ObjectMeta {
            ObjectMeta {
                size: object
                    .size
                    .as_deref()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                version: object.generation,
                created_at: object.time_created,
                updated_at: object.updated.unwrap_or(object.time_created),
                path: object.name,
            }
        }

        async fn get_once(&self, path: &str) -> Result<Bytes> {
            let mut url = self.object_url(path)?;
            url.query_pairs_mut().append_pair("alt", "media");
            let response = self.send(Method::GET, url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(Error::not_found(path)),
                s if s.is_success() => response
                    .bytes()
                    .await
                    .map_err(|e| Error::storage_with_source("GCS read failed", true, e)),
                _ => Err(Self::error_for(response, "get").await),
            }
        }

        async fn head_once(&self, path: &str) -> Result<Option<ObjectMeta>> {
            let url = self.object_url(path)?;
            let response = self.send(Method::GET, url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    let object: GcsObject = response.json().await.map_err(|e| {
                        Error::Serialization {
                            message: format!("parse object metadata: {e}"),
                        }
                    })?;
                    Ok(Some(Self::to_meta(object)))
                }
                _ => Err(Self::error_for(response, "head").await),
            }
        }

        async fn put_once(
            &self,
            path: &str,
            data: Bytes,
            precondition: &WritePrecondition,
        ) -> Result<WriteResult> {
            let mut url = self.objects_url(true)?;
            url.query_pairs_mut()
                .append_pair("uploadType", "media")
                .append_pair("name", path);
            Self::apply_precondition(&mut url, precondition);

            let response = self.send(Method::POST, url, Some(data)).await?;
            match response.status() {
                StatusCode::PRECONDITION_FAILED => {
                    let current_version = self
                        .head_once(path)
                        .await?
                        .map_or_else(|| "0".to_string(), |m| m.version);
                    Ok(WriteResult::PreconditionFailed { current_version })
                }
                s if s.is_success() => {
                    let object: GcsObject = response.json().await.map_err(|e| {
                        Error::Serialization {
                            message: format!("parse upload response: {e}"),
                        }
                    })?;
                    Ok(WriteResult::Success {
                        version: object.generation,
                    })
                }
                _ => Err(Self::error_for(response, "put").await),
            }
        }

        async fn delete_once(
            &self,
            path: &str,
            precondition: &WritePrecondition,
        ) -> Result<DeleteResult> {
            let mut url = self.object_url(path)?;
            Self::apply_precondition(&mut url, precondition);
            let response = self.send(Method::DELETE, url, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(DeleteResult::NotFound),
                StatusCode::PRECONDITION_FAILED => {
                    let current_version = self
                        .head_once(path)
                        .await?
                        .map_or_else(|| "0".to_string(), |m| m.version);
                    Ok(DeleteResult::PreconditionFailed { current_version })
                }
                s if s.is_success() => Ok(DeleteResult::Deleted),
                _ => Err(Self::error_for(response, "delete").await),
            }
        }

        async fn list_page(
            &self,
            prefix: &str,
            delimiter: Option<&str>,
            page_token: Option<&str>,
        ) -> Result<GcsListPage> {
            let mut url = self.objects_url(false)?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(delimiter) = delimiter {
                    query.append_pair("delimiter", delimiter);
                }
                if let Some(token) = page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self.send(Method::GET, url, None).await?;
            if !response.status().is_success() {
                return Err(Self::error_for(response, "list").await);
            }
            response.json().await.map_err(|e| Error::Serialization {
                message: format!("parse list response: {e}"),
            })
        }
    }

    #[async_trait]
    impl StorageBackend for GcsBackend {
        fn bucket(&self) -> &str {
            &self.bucket
        }

        async fn get(&self, path: &str) -> Result<Bytes> {
            let retry = self.shared.config.retry;
            retry
                .run("gcs.get", Error::is_transient, move || self.get_once(path))
                .await
        }

        async fn head(&self, path: &str) -> Result<Option<ObjectMeta>> {
            let retry = self.shared.config.retry;
            retry
                .run("gcs.head", Error::is_transient, move || self.head_once(path))
                .await
        }

        async fn put(
            &self,
            path: &str,
            data: Bytes,
            precondition: WritePrecondition,
        ) -> Result<WriteResult> {
            let retry = self.shared.config.retry;
            let precondition = &precondition;
            retry
                .run("gcs.put", Error::is_transient, move || {
                    self.put_once(path, data.clone(), precondition)
                })
                .await
        }

        async fn delete(
            &self,
            path: &str,
            precondition: WritePrecondition,
        ) -> Result<DeleteResult> {
            let retry = self.shared.config.retry;
            let precondition = &precondition;
            retry
                .run("gcs.delete", Error::is_transient, move || {
                    self.delete_once(path, precondition)
                })
                .await
        }

        async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
            let retry = self.shared.config.retry;
            let mut listing = Listing::default();
            let mut page_token: Option<String> = None;
            loop {
                let token = page_token.as_deref();
                let page = retry
                    .run("gcs.list", Error::is_transient, move || {
                        self.list_page(prefix, delimiter, token)
                    })
                    .await?;
                listing
                    .objects
                    .extend(page.items.into_iter().map(Self::to_meta));
                listing.prefixes.extend(page.prefixes);
                match page.next_page_token {
                    Some(next) if !next.is_empty() => page_token = Some(next),
                    _ => break,
                }
            }
            listing.objects.sort_by(|a, b| a.path.cmp(&b.path));
            listing.prefixes.sort();
            Ok(listing)
        }
    }
}

// ============================================================================
// Non-GCP Placeholder Implementation
// ============================================================================

#[cfg(not(feature = "gcp"))]
mod placeholder_impl {
    use std::sync::Arc;

    use super::GcsConfig;
    use crate::error::{Error, Result};
    use crate::storage::{StorageBackend, StorageProvider};

    /// Placeholder GCS provider (GCP feature not enabled).
    #[derive(Debug, Clone)]
    pub struct GcsProvider {
        _private: (),
    }

    impl GcsProvider {
        /// Creates a new placeholder provider.
        ///
        /// # Errors
        ///
        /// Always returns an error when the `gcp` feature is disabled.
        #[allow(clippy::unused_async)]
        pub async fn new(_config: GcsConfig) -> Result<Self> {
            Err(Error::storage(
                "GcsProvider requires the 'gcp' feature to be enabled. \
                 Add `landfall-core = { features = [\"gcp\"] }` to your Cargo.toml.",
            ))
        }
    }

    impl StorageProvider for GcsProvider {
        fn bucket(&self, _bucket: &str) -> Result<Arc<dyn StorageBackend>> {
            Err(Error::storage(
                "GcsProvider requires the 'gcp' feature to be enabled",
            ))
        }
    }
}

// Re-export the appropriate implementation
#[cfg(feature = "gcp")]
pub use gcp_impl::{GcsBackend, GcsProvider};

#[cfg(not(feature = "gcp"))]
pub use placeholder_impl::GcsProvider;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_endpoint_is_normalized() {
        let config = GcsConfig::default().with_endpoint("http://localhost:4443/");
        assert_eq!(config.endpoint, "http://localhost:4443");
    }

    #[test]
    fn object_resource_parses() {
        let json = r#"{
            "kind": "storage#object",
            "name": "d/t/_SUCCESS",
            "bucket": "b",
            "generation": "1700000000000001",
            "size": "0",
            "timeCreated": "2024-01-02T03:04:05.678Z",
            "updated": "2024-01-02T03:04:05.678Z"
        }"#;
        let object: GcsObject = serde_json::from_str(json).expect("parse");
        assert_eq!(object.name, "d/t/_SUCCESS");
        assert_eq!(object.generation, "1700000000000001");
        assert_eq!(object.size.as_deref(), Some("0"));
    }

    #[test]
    fn list_page_defaults_missing_fields() {
        let page: GcsListPage = serde_json::from_str(r#"{"kind":"storage#objects"}"#)
            .expect("parse");
        assert!(page.items.is_empty());
        assert!(page.prefixes.is_empty());
        assert!(page.next_page_token.is_none());
    }
}
