//! # landfall-ingest
//!
//! The ordered ingest engine: turns object-store notifications into warehouse
//! load and transform jobs.
//!
//! This crate provides:
//!
//! - **Destination Resolution**: Object keys to tables via a named-capture pattern
//! - **Config Resolution**: `_config/` files deep-merged from the root down
//! - **Job Submission**: Load jobs over batched URIs, or SQL over an external table
//! - **Duplicate Suppression**: One claim per success marker generation
//! - **Ordered Mode**: A per-table backlog drained by one subscriber at a time
//!   under a generation-guarded table lock
//! - **Dispatch**: Classification of every notification
//!
//! ## Object Layout
//!
//! All coordination state lives in the bucket next to the data:
//!
//! ```text
//! d/t/00/data.csv
//! d/t/00/_SUCCESS                      producer marker
//! d/t/00/_claimed__SUCCESS_created_at_… claim
//! d/t/_backlog/00/_SUCCESS             backlog pointer
//! d/t/_bqlock                          in-flight job id
//! d/t/_BACKFILL                        subscriber trigger
//! ```
//!
//! ## Guarantees
//!
//! - **At most one in-flight job** per table in ordered mode
//! - **Order**: backlog items are applied in key order
//! - **No double apply**: redelivered notifications are dropped by the claim
//! - **Progress**: the monitor re-posts `_BACKFILL` when a subscriber exits
//!   while an enqueue races it
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use landfall_core::MemoryProvider;
//! use landfall_ingest::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let ctx = IngestContext::new(IngestConfig::from_env()?, Arc::new(InMemoryWarehouse::new()))?;
//! let dispatcher = Dispatcher::new(ctx, Arc::new(MemoryProvider::new()));
//! let outcome = dispatcher
//!     .handle(&Notification::new("bucket", "dataset/table/00/_SUCCESS"))
//!     .await?;
//! println!("{}", outcome.as_str());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod backlog;
pub mod batch;
pub mod claim;
pub mod config;
pub mod config_resolver;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod job_id;
pub mod metrics;
pub mod monitor;
pub mod paths;
pub mod submit;
pub mod subscriber;
pub mod table_lock;
pub mod warehouse;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::backlog::{BackfillMarker, Backlog, PostOutcome};
    pub use crate::config::IngestConfig;
    pub use crate::context::IngestContext;
    pub use crate::dispatcher::{Dispatcher, Notification, Outcome, Trigger};
    pub use crate::error::{IngestError, Result};
    pub use crate::metrics::IngestMetrics;
    pub use crate::monitor::MonitorOutcome;
    pub use crate::paths::{DestinationPattern, DestinationResolver, PathParser, TableRef};
    pub use crate::subscriber::SubscriberOutcome;
    pub use crate::table_lock::{LockBody, TableLock};
    pub use crate::warehouse::{InMemoryWarehouse, JobRequest, JobStatus, Warehouse};
}

pub use config::IngestConfig;
pub use context::IngestContext;
pub use dispatcher::{Dispatcher, Notification, Outcome};
pub use error::{IngestError, Result};
