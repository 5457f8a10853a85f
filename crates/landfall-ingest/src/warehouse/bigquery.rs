//! BigQuery warehouse over the REST API.
//!
//! Only functional with the `gcp` feature; without it [`BigQueryWarehouse::new`]
//! returns an error explaining how to enable it.
//!
//! Job ids are chosen by the engine, so an insert that is retried after a lost
//! response answers `409 Already Exists` instead of running twice.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use landfall_core::RetryPolicy;

use super::{EXTERNAL_TABLE_NAME, JobRequest, JobState, JobStatus};

/// Configuration of the BigQuery client.
#[derive(Debug, Clone)]
pub struct BigQueryConfig {
    /// REST endpoint (override for emulators).
    pub endpoint: String,
    /// Project that runs the jobs.
    pub project: String,
    /// Job location, if not the project default.
    pub location: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl BigQueryConfig {
    /// Creates a configuration for jobs run in `project`.
    #[must_use]
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            endpoint: "https://bigquery.googleapis.com".to_string(),
            project: project.into(),
            location: None,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the job location.
    #[must_use]
    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }
}

/// Builds the `jobs.insert` request body.
#[must_use]
pub fn job_resource(job: &JobRequest, config: &BigQueryConfig) -> Value {
    let mut reference = Map::new();
    reference.insert("projectId".into(), Value::from(config.project.as_str()));
    reference.insert("jobId".into(), Value::from(job.job_id()));
    if let Some(location) = &config.location {
        reference.insert("location".into(), Value::from(location.as_str()));
    }

    let configuration = match job {
        JobRequest::Load(load) => {
            let mut body = match &load.config {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            body.insert(
                "destinationTable".into(),
                json!({
                    "projectId": load.destination.project.as_deref().unwrap_or(&config.project),
                    "datasetId": load.destination.dataset,
                    "tableId": load.destination.table_id(),
                }),
            );
            body.insert("sourceUris".into(), json!(load.source_uris));
            json!({ "labels": load.labels, "load": body })
        }
        JobRequest::Query(query) => {
            let mut definition = match &query.external_config {
                Value::Object(map) => map.clone(),
                _ => Map::new(),
            };
            definition.insert("sourceUris".into(), json!(query.source_uris));
            let table_name = if query.external_table.is_empty() {
                EXTERNAL_TABLE_NAME
            } else {
                query.external_table.as_str()
            };
            let mut definitions = Map::new();
            definitions.insert(table_name.to_string(), Value::Object(definition));
            json!({
                "labels": query.labels,
                "query": {
                    "query": query.sql,
                    "useLegacySql": false,
                    "tableDefinitions": definitions,
                },
            })
        }
    };

    json!({
        "jobReference": reference,
        "configuration": configuration,
    })
}

/// Job resource as returned by `jobs.get`, `jobs.insert` and `jobs.list`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)] // Only read with the `gcp` feature outside tests
struct JobResource {
    job_reference: JobReference,
    #[serde(default)]
    status: Option<JobStatusResource>,
    // jobs.list carries state and error at the top level
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error_result: Option<ErrorProto>,
    #[serde(default)]
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatusResource {
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    #[serde(default)]
    query: Option<QueryStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatistics {
    #[serde(default)]
    statement_type: Option<String>,
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[allow(dead_code)] // Only read with the `gcp` feature outside tests
struct JobList {
    #[serde(default)]
    jobs: Vec<JobResource>,
    #[serde(default)]
    next_page_token: Option<String>,
}

impl JobResource {
    #[allow(dead_code)] // Only called with the `gcp` feature outside tests
    fn into_status(self) -> JobStatus {
        let (state, error) = match self.status {
            Some(status) => (status.state, status.error_result),
            None => (self.state.unwrap_or_default(), self.error_result),
        };
        let state = match state.as_str() {
            "DONE" => JobState::Done,
            "RUNNING" => JobState::Running,
            _ => JobState::Pending,
        };
        let query = self.statistics.and_then(|s| s.query);
        JobStatus {
            job_id: self.job_reference.job_id,
            state,
            error: error.map(|e| match (e.reason, e.message) {
                (Some(reason), Some(message)) => format!("{reason}: {message}"),
                (None, Some(message)) => message,
                (Some(reason), None) => reason,
                (None, None) => "unknown error".to_string(),
            }),
            statement_type: query.as_ref().and_then(|q| q.statement_type.clone()),
            dml_affected_rows: query
                .and_then(|q| q.num_dml_affected_rows)
                .and_then(|rows| rows.parse().ok()),
        }
    }
}

// ============================================================================
// GCP Implementation
// ============================================================================

#[cfg(feature = "gcp")]
mod gcp_impl {
    use std::sync::Arc;

    use async_trait::async_trait;
    use gcp_auth::TokenProvider;
    use landfall_core::error::is_transient_status;
    use reqwest::{Method, StatusCode, Url};
    use serde_json::Value;

    use super::{BigQueryConfig, JobList, JobResource, job_resource};
    use crate::warehouse::{JobRequest, JobStatus, Warehouse, WarehouseError};

    const SCOPES: &[&str] = &["https://www.googleapis.com/auth/bigquery"];

    /// BigQuery REST warehouse.
    pub struct BigQueryWarehouse {
        config: BigQueryConfig,
        token_provider: Arc<dyn TokenProvider>,
        client: reqwest::Client,
    }

    // Manual Debug implementation since TokenProvider doesn't implement Debug
    impl std::fmt::Debug for BigQueryWarehouse {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BigQueryWarehouse")
                .field("config", &self.config)
                .field("token_provider", &"<TokenProvider>")
                .finish_non_exhaustive()
        }
    }

    impl BigQueryWarehouse {
        /// Creates a client using application default credentials.
        ///
        /// # Errors
        ///
        /// Returns an error if GCP authentication or the HTTP client cannot be initialized.
        pub async fn new(config: BigQueryConfig) -> Result<Self, WarehouseError> {
            let token_provider = gcp_auth::provider()
                .await
                .map_err(|e| WarehouseError::api(format!("failed to initialize GCP auth: {e}")))?;
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()
                .map_err(|e| WarehouseError::api(format!("failed to create HTTP client: {e}")))?;
            Ok(Self {
                config,
                token_provider,
                client,
            })
        }

        fn jobs_url(&self) -> Result<Url, WarehouseError> {
            let mut url = Url::parse(&format!("{}/bigquery/v2/projects", self.config.endpoint))
                .map_err(|e| WarehouseError::api(format!("invalid BigQuery endpoint: {e}")))?;
            url.path_segments_mut()
                .map_err(|()| WarehouseError::api("BigQuery endpoint cannot be a base"))?
                .push(&self.config.project)
                .push("jobs");
            Ok(url)
        }

        fn job_url(&self, job_id: &str) -> Result<Url, WarehouseError> {
            let mut url = self.jobs_url()?;
            url.path_segments_mut()
                .map_err(|()| WarehouseError::api("BigQuery endpoint cannot be a base"))?
                .push(job_id);
            if let Some(location) = &self.config.location {
                url.query_pairs_mut().append_pair("location", location);
            }
            Ok(url)
        }

        async fn send(
            &self,
            method: Method,
            url: Url,
            body: Option<&Value>,
        ) -> Result<reqwest::Response, WarehouseError> {
            let token = self.token_provider.token(SCOPES).await.map_err(|e| {
                WarehouseError::Api {
                    message: format!("failed to get GCP access token: {e}"),
                    transient: true,
                }
            })?;
            let mut request = self
                .client
                .request(method, url)
                .bearer_auth(token.as_str());
            if let Some(body) = body {
                request = request.json(body);
            }
            request.send().await.map_err(|e| WarehouseError::Api {
                message: format!("BigQuery request failed: {e}"),
                transient: e.is_timeout() || e.is_connect() || e.is_request(),
            })
        }

        async fn error_for(response: reqwest::Response, context: &str) -> WarehouseError {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            WarehouseError::Api {
                message: format!("BigQuery {context} failed: {status} - {body}"),
                transient: is_transient_status(status.as_u16()),
            }
        }

        async fn parse<T: serde::de::DeserializeOwned>(
            response: reqwest::Response,
        ) -> Result<T, WarehouseError> {
            response.json().await.map_err(|e| WarehouseError::Response {
                message: e.to_string(),
            })
        }

        async fn submit_once(&self, body: &Value) -> Result<JobStatus, WarehouseError> {
            let response = self.send(Method::POST, self.jobs_url()?, Some(body)).await?;
            if !response.status().is_success() {
                return Err(Self::error_for(response, "jobs.insert").await);
            }
            Ok(Self::parse::<JobResource>(response).await?.into_status())
        }

        async fn get_once(&self, job_id: &str) -> Result<Option<JobStatus>, WarehouseError> {
            let response = self.send(Method::GET, self.job_url(job_id)?, None).await?;
            match response.status() {
                StatusCode::NOT_FOUND => Ok(None),
                s if s.is_success() => {
                    Ok(Some(Self::parse::<JobResource>(response).await?.into_status()))
                }
                _ => Err(Self::error_for(response, "jobs.get").await),
            }
        }

        async fn list_page(
            &self,
            parent_job_id: &str,
            page_token: Option<&str>,
        ) -> Result<JobList, WarehouseError> {
            let mut url = self.jobs_url()?;
            {
                let mut query = url.query_pairs_mut();
                query
                    .append_pair("parentJobId", parent_job_id)
                    .append_pair("projection", "full");
                if let Some(token) = page_token {
                    query.append_pair("pageToken", token);
                }
            }
            let response = self.send(Method::GET, url, None).await?;
            if !response.status().is_success() {
                return Err(Self::error_for(response, "jobs.list").await);
            }
            Self::parse(response).await
        }
    }

    #[async_trait]
    impl Warehouse for BigQueryWarehouse {
        async fn submit(&self, job: JobRequest) -> Result<JobStatus, WarehouseError> {
            let body = job_resource(&job, &self.config);
            let body = &body;
            self.config
                .retry
                .run("bigquery.insert", WarehouseError::is_transient, move || {
                    self.submit_once(body)
                })
                .await
        }

        async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>, WarehouseError> {
            self.config
                .retry
                .run("bigquery.get", WarehouseError::is_transient, move || {
                    self.get_once(job_id)
                })
                .await
        }

        async fn list_child_jobs(
            &self,
            parent_job_id: &str,
        ) -> Result<Vec<JobStatus>, WarehouseError> {
            let mut children = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let token = page_token.as_deref();
                let page = self
                    .config
                    .retry
                    .run("bigquery.list", WarehouseError::is_transient, move || {
                        self.list_page(parent_job_id, token)
                    })
                    .await?;
                children.extend(page.jobs.into_iter().map(JobResource::into_status));
                match page.next_page_token {
                    Some(next) if !next.is_empty() => page_token = Some(next),
                    _ => break,
                }
            }
            Ok(children)
        }
    }
}

// ============================================================================
// Non-GCP Placeholder Implementation
// ============================================================================

#[cfg(not(feature = "gcp"))]
mod placeholder_impl {
    use async_trait::async_trait;

    use super::BigQueryConfig;
    use crate::warehouse::{JobRequest, JobStatus, Warehouse, WarehouseError};

    /// Placeholder BigQuery client (GCP feature not enabled).
    #[derive(Debug)]
    pub struct BigQueryWarehouse {
        _private: (),
    }

    impl BigQueryWarehouse {
        /// Creates a new placeholder client.
        ///
        /// # Errors
        ///
        /// Always returns an error when the `gcp` feature is disabled.
        #[allow(clippy::unused_async)]
        pub async fn new(_config: BigQueryConfig) -> Result<Self, WarehouseError> {
            Err(WarehouseError::api(
                "BigQueryWarehouse requires the 'gcp' feature to be enabled. \
                 Add `landfall-ingest = { features = [\"gcp\"] }` to your Cargo.toml.",
            ))
        }
    }

    #[async_trait]
    impl Warehouse for BigQueryWarehouse {
        async fn submit(&self, _job: JobRequest) -> Result<JobStatus, WarehouseError> {
            Err(WarehouseError::api("BigQuery support not enabled"))
        }

        async fn get_job(&self, _job_id: &str) -> Result<Option<JobStatus>, WarehouseError> {
            Err(WarehouseError::api("BigQuery support not enabled"))
        }

        async fn list_child_jobs(
            &self,
            _parent_job_id: &str,
        ) -> Result<Vec<JobStatus>, WarehouseError> {
            Err(WarehouseError::api("BigQuery support not enabled"))
        }
    }
}

// Re-export the appropriate implementation
#[cfg(feature = "gcp")]
pub use gcp_impl::BigQueryWarehouse;

#[cfg(not(feature = "gcp"))]
pub use placeholder_impl::BigQueryWarehouse;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::TableRef;
    use crate::warehouse::{LoadJob, QueryJob};

    fn table() -> TableRef {
        TableRef {
            project: None,
            dataset: "d".into(),
            table: "t".into(),
            partition: Some("$2020".into()),
        }
    }

    #[test]
    fn load_resource_carries_config_and_sources() {
        let config = BigQueryConfig::new("runner").with_location(Some("EU".into()));
        let job = JobRequest::Load(LoadJob {
            job_id: "gcf-ingest-d-t-_SUCCESS-1".into(),
            destination: table(),
            source_uris: vec!["gs://b/d/t/part-0".into()],
            config: json!({"sourceFormat": "CSV", "writeDisposition": "WRITE_APPEND"}),
            labels: Map::from_iter([("component".to_string(), json!("x"))]),
        });

        let body = job_resource(&job, &config);
        assert_eq!(body["jobReference"]["projectId"], "runner");
        assert_eq!(body["jobReference"]["location"], "EU");
        assert_eq!(body["configuration"]["labels"]["component"], "x");
        let load = &body["configuration"]["load"];
        assert_eq!(load["sourceFormat"], "CSV");
        assert_eq!(load["destinationTable"]["projectId"], "runner");
        assert_eq!(load["destinationTable"]["tableId"], "t$2020");
        assert_eq!(load["sourceUris"][0], "gs://b/d/t/part-0");
    }

    #[test]
    fn query_resource_attaches_external_table() {
        let config = BigQueryConfig::new("runner");
        let job = JobRequest::Query(QueryJob {
            job_id: "j".into(),
            destination: table(),
            sql: "INSERT d.t SELECT * FROM temp_ext".into(),
            external_table: EXTERNAL_TABLE_NAME.into(),
            external_config: json!({"sourceFormat": "PARQUET"}),
            source_uris: vec!["gs://b/a".into(), "gs://b/b".into()],
            labels: Map::new(),
        });

        let body = job_resource(&job, &config);
        let query = &body["configuration"]["query"];
        assert_eq!(query["useLegacySql"], false);
        let definition = &query["tableDefinitions"]["temp_ext"];
        assert_eq!(definition["sourceFormat"], "PARQUET");
        assert_eq!(definition["sourceUris"].as_array().map(Vec::len), Some(2));
        assert!(body["jobReference"].get("location").is_none());
    }

    #[test]
    fn job_resource_parses_status_and_statistics() {
        let resource: JobResource = serde_json::from_str(
            r#"{
                "jobReference": {"projectId": "p", "jobId": "j1"},
                "status": {"state": "DONE"},
                "statistics": {"query": {"statementType": "UPDATE", "numDmlAffectedRows": "0"}}
            }"#,
        )
        .expect("parse");
        let status = resource.into_status();
        assert!(status.succeeded());
        assert!(status.is_dml());
        assert_eq!(status.dml_affected_rows, Some(0));
    }

    #[test]
    fn job_resource_parses_errors() {
        let resource: JobResource = serde_json::from_str(
            r#"{
                "jobReference": {"jobId": "j1"},
                "status": {"state": "DONE", "errorResult": {"reason": "invalidQuery", "message": "Syntax error"}}
            }"#,
        )
        .expect("parse");
        let status = resource.into_status();
        assert_eq!(status.error.as_deref(), Some("invalidQuery: Syntax error"));
    }

    #[test]
    fn job_list_entries_use_top_level_state() {
        let list: JobList = serde_json::from_str(
            r#"{"jobs": [{"jobReference": {"jobId": "c1"}, "state": "RUNNING"}]}"#,
        )
        .expect("parse");
        let statuses: Vec<_> = list.jobs.into_iter().map(JobResource::into_status).collect();
        assert_eq!(statuses[0].state, JobState::Running);
        assert!(list.next_page_token.is_none());
    }
}
