//! Shared, hot-reloadable configuration snapshot

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{Config, ConfigValidator};
use crate::error::{RaglineError, Result};

/// Cheaply cloneable handle to the live configuration.
///
/// Readers take an `Arc<Config>` snapshot per operation, so an update never
/// changes parameters in the middle of a search or an ingestion step.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<Config>>>,
    source: Option<PathBuf>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source: None,
        }
    }

    /// Handle that can later re-read its configuration from `path`
    pub fn with_source(config: Config, path: PathBuf) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            source: Some(path),
        }
    }

    pub fn current(&self) -> Arc<Config> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration after validating it
    pub fn update(&self, mut config: Config) -> Result<Arc<Config>> {
        ConfigValidator::validate(&config)?;
        config.meta.last_modified = chrono::Utc::now().to_rfc3339();

        let config = Arc::new(config);
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = config.clone();

        tracing::info!("Configuration updated");
        Ok(config)
    }

    /// Re-read the configuration file this handle was created from
    pub fn reload(&self) -> Result<Arc<Config>> {
        let path = self
            .source
            .as_ref()
            .ok_or_else(|| RaglineError::Config("Configuration has no backing file".to_string()))?;
        let config = Config::load(path)?;
        self.update(config)
    }
}
