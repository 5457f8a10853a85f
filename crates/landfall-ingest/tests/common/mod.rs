//! Notification-replay harness shared by the end-to-end tests.

#![allow(dead_code)]

use std::sync::Arc;

use landfall_ingest::warehouse::{InMemoryWarehouse, JobRequest, Warehouse};
use landfall_ingest::{Dispatcher, IngestConfig, IngestContext, Notification, Outcome};
use landfall_test_utils::{Producer, TracingMemoryBackend, TracingProvider};

pub const BUCKET: &str = "b";

/// Rounds of notification replay before a test is considered stuck.
const MAX_ROUNDS: usize = 50;

pub struct Harness {
    pub storage: TracingMemoryBackend,
    pub warehouse: Arc<InMemoryWarehouse>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(IngestConfig::default())
    }

    pub fn ordered() -> Self {
        Self::with_config(IngestConfig {
            order_per_table: true,
            ..IngestConfig::default()
        })
    }

    pub fn with_config(config: IngestConfig) -> Self {
        let storage = TracingMemoryBackend::new(BUCKET);
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let shared: Arc<dyn Warehouse> = warehouse.clone();
        let ctx = IngestContext::new(config, shared).expect("context");
        let dispatcher = Dispatcher::new(ctx, Arc::new(TracingProvider::new(storage.clone())));
        Self {
            storage,
            warehouse,
            dispatcher,
        }
    }

    pub fn producer(&self) -> Producer<'_> {
        Producer::new(&self.storage)
    }

    pub async fn notify(&self, key: &str) -> landfall_ingest::Result<Outcome> {
        self.dispatcher
            .handle(&Notification::new(BUCKET, key))
            .await
    }

    /// Delivers a finalize notification for every write, including the ones
    /// the engine makes while handling earlier notifications, until the
    /// bucket is quiet.
    pub async fn pump(&self) -> Vec<(String, landfall_ingest::Result<Outcome>)> {
        let mut handled = Vec::new();
        for _ in 0..MAX_ROUNDS {
            let keys = self.storage.drain_finalized();
            if keys.is_empty() {
                return handled;
            }
            for key in keys {
                let result = self.notify(&key).await;
                handled.push((key, result));
            }
        }
        panic!("notifications did not settle after {MAX_ROUNDS} rounds");
    }

    /// First source URI of every submitted job, in submission order.
    pub fn submitted_sources(&self) -> Vec<String> {
        self.warehouse
            .submitted()
            .iter()
            .map(|job| match job {
                JobRequest::Load(load) => load.source_uris[0].clone(),
                JobRequest::Query(query) => query.source_uris[0].clone(),
            })
            .collect()
    }

    pub fn keys_containing(&self, needle: &str) -> Vec<String> {
        self.storage
            .keys()
            .into_iter()
            .filter(|k| k.contains(needle))
            .collect()
    }
}

/// Returns the results for `key` among pumped notifications.
pub fn results_for<'a>(
    handled: &'a [(String, landfall_ingest::Result<Outcome>)],
    key: &str,
) -> Vec<&'a landfall_ingest::Result<Outcome>> {
    handled
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, result)| result)
        .collect()
}
