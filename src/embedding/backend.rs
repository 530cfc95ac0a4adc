use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{EmbeddingError, EmbeddingResult, FastEmbedBackend, HashEmbedder, HttpEmbedder};
use crate::config::{EmbeddingConfig, ModelConfig};

/// A model that turns text into fixed-size vectors.
///
/// Implementations only talk to the model; batching limits, retries and
/// caching live in [`super::EmbeddingService`].
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimension(&self) -> usize;

    /// Prepare the model (download, warm up). Safe to call repeatedly.
    async fn load(&self) -> EmbeddingResult<()>;

    /// One vector per input text, in input order
    async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>>;
}

/// Backends keyed by model id
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn EmbeddingBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every model listed in the configuration
    pub fn from_config(config: &EmbeddingConfig) -> EmbeddingResult<Self> {
        let mut registry = Self::new();
        for model in &config.models {
            registry.register(backend_for(model, config)?);
        }
        Ok(registry)
    }

    /// Add or replace the backend for its model id
    pub fn register(&mut self, backend: Arc<dyn EmbeddingBackend>) {
        self.backends.insert(backend.model_id().to_string(), backend);
    }

    pub fn get(&self, model: &str) -> EmbeddingResult<Arc<dyn EmbeddingBackend>> {
        self.backends
            .get(model)
            .cloned()
            .ok_or_else(|| EmbeddingError::UnknownModel(model.to_string()))
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

fn backend_for(
    model: &ModelConfig,
    config: &EmbeddingConfig,
) -> EmbeddingResult<Arc<dyn EmbeddingBackend>> {
    match model.backend.as_str() {
        "fastembed" => Ok(Arc::new(FastEmbedBackend::new(&model.id)?)),
        "hash" => Ok(Arc::new(HashEmbedder::new(&model.id, model.dimension))),
        "http" => {
            let url = model.url.as_deref().ok_or_else(|| EmbeddingError::Initialization {
                model: model.id.clone(),
                message: "http backend requires a url".to_string(),
            })?;
            Ok(Arc::new(HttpEmbedder::new(
                &model.id,
                model.remote_model.as_deref().unwrap_or(&model.id),
                url,
                model.dimension,
                config.request_timeout_ms,
            )?))
        }
        other => Err(EmbeddingError::Initialization {
            model: model.id.clone(),
            message: format!("unknown backend '{}'", other),
        }),
    }
}
