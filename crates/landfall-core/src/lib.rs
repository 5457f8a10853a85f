//! # landfall-core
//!
//! Core abstractions for Landfall, the event-driven loader that moves files
//! landing in an object store into an analytical warehouse.
//!
//! This crate provides the foundational types used by the ingest engine and
//! the hosting binary:
//!
//! - **Storage Contract**: [`StorageBackend`] with generation-preconditioned
//!   writes and deletes, plus an in-memory backend for tests
//! - **GCS Backend**: JSON-API implementation (feature `gcp`)
//! - **Retry**: Bounded exponential backoff for transient failures
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span helpers
//!
//! ## Example
//!
//! ```rust
//! use landfall_core::prelude::*;
//!
//! # async fn demo() -> Result<()> {
//! let backend = MemoryBackend::new("my-bucket");
//! let result = backend
//!     .put("d/t/_SUCCESS", bytes::Bytes::new(), WritePrecondition::DoesNotExist)
//!     .await?;
//! assert!(result.is_success());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod gcs;
pub mod observability;
pub mod retry;
pub mod storage;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::retry::RetryPolicy;
    pub use crate::storage::{
        DeleteResult, Listing, MemoryBackend, MemoryProvider, ObjectMeta, StorageBackend,
        StorageProvider, WritePrecondition, WriteResult,
    };
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use gcs::{GcsConfig, GcsProvider};
pub use observability::{LogFormat, init_logging};
pub use retry::RetryPolicy;
pub use storage::{
    DeleteResult, Listing, MemoryBackend, MemoryProvider, ObjectMeta, StorageBackend,
    StorageProvider, WritePrecondition, WriteResult,
};
