//! Shared test utilities for Landfall tests.
//!
//! This crate provides:
//! - [`TracingMemoryBackend`]: In-memory storage with operation recording,
//!   failure injection and a queue of finalized keys
//! - [`TracingProvider`]: Single-bucket provider for dispatcher tests
//! - [`Producer`]: Writes data files, success markers and config files
//!
//! # Example
//!
//! ```rust,ignore
//! use landfall_test_utils::{Producer, TracingMemoryBackend};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let storage = TracingMemoryBackend::new("b");
//!     let marker = Producer::new(&storage).batch("d/t/00", 1).await;
//!     // ... dispatch notifications for storage.drain_finalized() ...
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod storage;

pub use fixtures::*;
pub use storage::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("landfall=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
