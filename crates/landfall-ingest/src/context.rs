//! Shared state of one engine instance.

use std::sync::Arc;

use crate::config::IngestConfig;
use crate::error::Result;
use crate::metrics::IngestMetrics;
use crate::paths::PathParser;
use crate::warehouse::Warehouse;

/// Configuration and collaborators shared by every invocation.
#[derive(Clone)]
pub struct IngestContext {
    /// Engine configuration.
    pub config: IngestConfig,
    /// Key resolution.
    pub parser: PathParser,
    /// Warehouse client.
    pub warehouse: Arc<dyn Warehouse>,
    /// Metrics recorder.
    pub metrics: IngestMetrics,
}

impl std::fmt::Debug for IngestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestContext")
            .field("config", &self.config)
            .field("parser", &self.parser)
            .finish_non_exhaustive()
    }
}

impl IngestContext {
    /// Validates `config` and builds the context.
    ///
    /// # Errors
    ///
    /// Returns [`crate::IngestError::Configuration`] if the configuration is invalid.
    pub fn new(config: IngestConfig, warehouse: Arc<dyn Warehouse>) -> Result<Self> {
        let parser = PathParser::new(&config)?;
        Ok(Self {
            config,
            parser,
            warehouse,
            metrics: IngestMetrics::new(),
        })
    }

    /// Builds the context around an already constructed parser.
    #[must_use]
    pub fn with_parser(
        config: IngestConfig,
        parser: PathParser,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            config,
            parser,
            warehouse,
            metrics: IngestMetrics::new(),
        }
    }
}
