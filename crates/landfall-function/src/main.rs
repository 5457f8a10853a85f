//! # landfall-function
//!
//! Hosting binary for the Landfall ingest engine.
//!
//! ## Modes
//!
//! - **Service Mode**: HTTP endpoint receiving storage notification pushes
//! - **CLI Mode**: Handles one `(bucket, key)` notification and exits
//!
//! ## Usage
//!
//! ```bash
//! # Serve notification pushes
//! landfall-function serve --port 8080
//!
//! # Replay one notification
//! landfall-function handle --bucket my-bucket --key dataset/table/00/_SUCCESS
//! ```
//!
//! Engine settings come from the environment (see `IngestConfig::from_env`).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

mod metrics;
mod server;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};

use landfall_core::observability::{LogFormat, init_logging};
use landfall_core::{GcsConfig, GcsProvider, MemoryProvider};
use landfall_ingest::warehouse::{BigQueryConfig, BigQueryWarehouse, InMemoryWarehouse};
use landfall_ingest::{Dispatcher, IngestConfig, IngestContext, Notification};

use crate::server::AppState;

/// Landfall ingest function.
#[derive(Debug, Parser)]
#[command(name = "landfall-function")]
#[command(about = "Loads object-store batches into BigQuery, in order when asked")]
#[command(version)]
struct Args {
    /// Log output format (json, pretty).
    #[arg(long, env = "LANDFALL_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    /// Use in-memory storage and warehouse (local debugging only).
    #[arg(long, env = "LANDFALL_IN_MEMORY", global = true)]
    in_memory: bool,

    /// Project that runs warehouse jobs (defaults to `BQ_PROJECT`).
    #[arg(long, env = "BQ_STORAGE_PROJECT", global = true)]
    storage_project: Option<String>,

    /// Warehouse job location.
    #[arg(long, env = "BQ_LOCATION", global = true)]
    location: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve notification pushes over HTTP.
    Serve {
        /// HTTP port.
        #[arg(long, env = "PORT", default_value = "8080")]
        port: u16,

        /// Answer 200 for failed notifications after logging them.
        #[arg(long, env = "LANDFALL_REPORT_ERRORS")]
        report_errors: bool,
    },

    /// Handle a single notification and exit.
    Handle {
        /// Bucket the object lives in.
        #[arg(long)]
        bucket: String,

        /// Object key.
        #[arg(long)]
        key: String,
    },
}

async fn build_dispatcher(args: &Args, config: IngestConfig) -> Result<Dispatcher> {
    if args.in_memory {
        tracing::warn!("using in-memory storage and warehouse (debug only)");
        let ctx = IngestContext::new(config, Arc::new(InMemoryWarehouse::new()))?;
        return Ok(Dispatcher::new(ctx, Arc::new(MemoryProvider::new())));
    }

    let project = args
        .storage_project
        .clone()
        .or_else(|| config.default_project.clone())
        .ok_or_else(|| anyhow!("BQ_STORAGE_PROJECT or BQ_PROJECT is required"))?;
    let retry = config.retry_policy();
    tracing::info!(
        project = %project,
        location = ?args.location,
        max_retries = retry.max_retries,
        "using GCS and BigQuery"
    );

    let storage = GcsProvider::new(GcsConfig::default().with_retry(retry)).await?;
    let warehouse = BigQueryWarehouse::new(
        BigQueryConfig::new(project)
            .with_location(args.location.clone())
            .with_retry(retry),
    )
    .await?;

    let ctx = IngestContext::new(config, Arc::new(warehouse))?;
    Ok(Dispatcher::new(ctx, Arc::new(storage)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    let config = IngestConfig::from_env()?;
    let dispatcher = build_dispatcher(&args, config).await?;

    match args.command {
        Commands::Serve {
            port,
            report_errors,
        } => {
            let handle = metrics::init_metrics()?;
            let state = AppState::new(dispatcher, report_errors).with_metrics(handle);

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            tracing::info!(address = %addr, report_errors, "starting notification server");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, server::router(state))
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }

        Commands::Handle { bucket, key } => {
            match dispatcher.handle(&Notification::new(bucket, key)).await {
                Ok(outcome) => tracing::info!(outcome = outcome.as_str(), "notification handled"),
                // Logged by the dispatcher.
                Err(err) if err.is_recoverable() => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    Ok(())
}
