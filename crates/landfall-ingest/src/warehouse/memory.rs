//! In-process warehouse for tests.
//!
//! Jobs never touch data. Each submitted job gets a [`JobScript`] that decides
//! how many status polls it stays running for and how it finishes. The
//! warehouse also records every submission and the highest number of
//! unfinished jobs ever seen for one destination table.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, RwLock};

use async_trait::async_trait;

use super::{JobRequest, JobState, JobStatus, Warehouse, WarehouseError};

/// How a scripted job behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobScript {
    /// Status polls answered with `Running` before the job is `Done`.
    pub running_polls: u32,
    /// Reject the submission itself with this API error.
    pub reject: Option<String>,
    /// Finish with this error payload.
    pub error: Option<String>,
    /// Statement type reported on completion.
    pub statement_type: Option<String>,
    /// DML-affected rows reported on completion.
    pub dml_affected_rows: Option<u64>,
    /// DML-affected rows of each child job (for `SCRIPT` statements).
    pub child_dml_rows: Vec<u64>,
}

impl JobScript {
    /// A job that stays running for `polls` status calls, then succeeds.
    #[must_use]
    pub fn running_for(polls: u32) -> Self {
        Self {
            running_polls: polls,
            ..Self::default()
        }
    }

    /// A job that fails with `message` on its first poll.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// A single DML statement affecting `rows` rows.
    #[must_use]
    pub fn dml(statement_type: &str, rows: u64) -> Self {
        Self {
            statement_type: Some(statement_type.to_string()),
            dml_affected_rows: Some(rows),
            ..Self::default()
        }
    }
}

type Scripter = Box<dyn Fn(&JobRequest) -> JobScript + Send + Sync>;

struct MemoryJob {
    request: JobRequest,
    script: JobScript,
    polls: u32,
}

impl MemoryJob {
    fn is_done(&self) -> bool {
        self.polls > self.script.running_polls
    }

    fn status(&self) -> JobStatus {
        let job_id = self.request.job_id();
        if !self.is_done() {
            return JobStatus::new(job_id, JobState::Running);
        }
        JobStatus {
            job_id: job_id.to_string(),
            state: JobState::Done,
            error: self.script.error.clone(),
            statement_type: self.script.statement_type.clone(),
            dml_affected_rows: self.script.dml_affected_rows,
        }
    }
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<String, MemoryJob>,
    submitted: Vec<JobRequest>,
    max_in_flight_per_table: usize,
}

/// Scriptable in-memory [`Warehouse`].
pub struct InMemoryWarehouse {
    state: Mutex<State>,
    scripter: RwLock<Scripter>,
}

impl std::fmt::Debug for InMemoryWarehouse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryWarehouse").finish_non_exhaustive()
    }
}

impl Default for InMemoryWarehouse {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWarehouse {
    /// Creates a warehouse whose jobs succeed on their first poll.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            scripter: RwLock::new(Box::new(|_| JobScript::default())),
        }
    }

    /// Replaces the script applied to subsequently submitted jobs.
    pub fn set_script(&self, scripter: impl Fn(&JobRequest) -> JobScript + Send + Sync + 'static) {
        let mut guard = self
            .scripter
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard = Box::new(scripter);
    }

    /// Every accepted submission, in order.
    #[must_use]
    pub fn submitted(&self) -> Vec<JobRequest> {
        self.lock().submitted.clone()
    }

    /// Highest number of unfinished jobs seen at once for a single table.
    #[must_use]
    pub fn max_in_flight_per_table(&self) -> usize {
        self.lock().max_in_flight_per_table
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn submit(&self, job: JobRequest) -> Result<JobStatus, WarehouseError> {
        let script = {
            let scripter = self
                .scripter
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            scripter(&job)
        };
        if let Some(message) = script.reject {
            return Err(WarehouseError::api(message));
        }

        let mut state = self.lock();
        let job_id = job.job_id().to_string();
        if state.jobs.contains_key(&job_id) {
            return Err(WarehouseError::api(format!("Already Exists: Job {job_id}")));
        }

        let in_flight = state
            .jobs
            .values()
            .filter(|j| !j.is_done() && j.request.destination() == job.destination())
            .count()
            + 1;
        state.max_in_flight_per_table = state.max_in_flight_per_table.max(in_flight);

        state.submitted.push(job.clone());
        state.jobs.insert(
            job_id.clone(),
            MemoryJob {
                request: job,
                script,
                polls: 0,
            },
        );
        Ok(JobStatus::new(job_id, JobState::Pending))
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobStatus>, WarehouseError> {
        let mut state = self.lock();
        Ok(state.jobs.get_mut(job_id).map(|job| {
            job.polls = job.polls.saturating_add(1);
            job.status()
        }))
    }

    async fn list_child_jobs(&self, parent_job_id: &str) -> Result<Vec<JobStatus>, WarehouseError> {
        let state = self.lock();
        let Some(job) = state.jobs.get(parent_job_id) else {
            return Err(WarehouseError::api(format!("Not found: Job {parent_job_id}")));
        };
        Ok(job
            .script
            .child_dml_rows
            .iter()
            .enumerate()
            .map(|(i, rows)| JobStatus {
                job_id: format!("script_job_{parent_job_id}_{i}"),
                state: JobState::Done,
                error: None,
                statement_type: Some("INSERT".to_string()),
                dml_affected_rows: Some(*rows),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, json};

    use super::*;
    use crate::paths::TableRef;
    use crate::warehouse::LoadJob;

    fn load(job_id: &str, table: &str) -> JobRequest {
        JobRequest::Load(LoadJob {
            job_id: job_id.to_string(),
            destination: TableRef {
                project: None,
                dataset: "d".into(),
                table: table.into(),
                partition: None,
            },
            source_uris: vec!["gs://b/d/t/part-0".into()],
            config: json!({}),
            labels: Map::new(),
        })
    }

    #[tokio::test]
    async fn jobs_run_for_scripted_polls() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_script(|_| JobScript::running_for(2));
        warehouse.submit(load("j1", "t")).await.expect("submit");

        for _ in 0..2 {
            let status = warehouse.get_job("j1").await.expect("get").expect("known");
            assert_eq!(status.state, JobState::Running);
        }
        let status = warehouse.get_job("j1").await.expect("get").expect("known");
        assert!(status.succeeded());
        assert!(warehouse.get_job("nope").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn tracks_concurrent_jobs_per_table() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_script(|_| JobScript::running_for(5));
        warehouse.submit(load("j1", "t")).await.expect("submit");
        warehouse.submit(load("j2", "u")).await.expect("submit");
        assert_eq!(warehouse.max_in_flight_per_table(), 1);
        warehouse.submit(load("j3", "t")).await.expect("submit");
        assert_eq!(warehouse.max_in_flight_per_table(), 2);
    }

    #[tokio::test]
    async fn duplicate_job_ids_and_rejections_fail() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.submit(load("j1", "t")).await.expect("submit");
        assert!(warehouse.submit(load("j1", "t")).await.is_err());

        warehouse.set_script(|_| JobScript {
            reject: Some("Syntax error".into()),
            ..JobScript::default()
        });
        let err = warehouse.submit(load("j2", "t")).await.expect_err("rejected");
        assert!(err.to_string().contains("Syntax error"));
        assert_eq!(warehouse.submitted().len(), 1);
    }

    #[tokio::test]
    async fn script_children_report_dml_rows() {
        let warehouse = InMemoryWarehouse::new();
        warehouse.set_script(|_| JobScript {
            statement_type: Some("SCRIPT".into()),
            child_dml_rows: vec![0, 3],
            ..JobScript::default()
        });
        warehouse.submit(load("j1", "t")).await.expect("submit");
        let children = warehouse.list_child_jobs("j1").await.expect("children");
        let rows: Vec<_> = children.iter().filter_map(|c| c.dml_affected_rows).collect();
        assert_eq!(rows, vec![0, 3]);
    }
}
