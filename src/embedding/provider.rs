/// Local ONNX embedding backend via FastEmbed
use std::sync::Arc;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::OnceCell;

use super::{EmbeddingBackend, EmbeddingError, EmbeddingResult};

/// FastEmbed model loaded on first use.
///
/// **Important**: Models are downloaded on-demand to the FastEmbed cache
/// directory on first load. Sizes:
/// - all-MiniLM-L6-v2: 90MB (384 dims)
/// - bge-small-en-v1.5: 130MB (384 dims)
/// - bge-base-en-v1.5: 440MB (768 dims)
pub struct FastEmbedBackend {
    model_id: String,
    model: EmbeddingModel,
    dimension: usize,
    size_mb: usize,
    loaded: OnceCell<Arc<TextEmbedding>>,
}

impl FastEmbedBackend {
    pub fn new(model_id: &str) -> EmbeddingResult<Self> {
        let (model, dimension, size_mb) = match model_id {
            "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384, 90),
            "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384, 130),
            "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768, 440),
            _ => {
                return Err(EmbeddingError::Initialization {
                    model: model_id.to_string(),
                    message: "Unsupported model. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5".to_string(),
                });
            }
        };

        Ok(Self {
            model_id: model_id.to_string(),
            model,
            dimension,
            size_mb,
            loaded: OnceCell::new(),
        })
    }

    async fn model(&self) -> EmbeddingResult<Arc<TextEmbedding>> {
        self.loaded
            .get_or_try_init(|| async {
                tracing::info!(
                    "Initializing embedding model: {} ({}D, ~{}MB download if not cached)",
                    self.model_id,
                    self.dimension,
                    self.size_mb
                );
                let options = InitOptions::new(self.model.clone()).with_show_download_progress(false);
                let model_id = self.model_id.clone();
                tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await
                    .map_err(|e| EmbeddingError::Initialization {
                        model: model_id.clone(),
                        message: e.to_string(),
                    })?
                    .map(Arc::new)
                    .map_err(|e| EmbeddingError::Initialization {
                        model: model_id,
                        message: e.to_string(),
                    })
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl EmbeddingBackend for FastEmbedBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn load(&self) -> EmbeddingResult<()> {
        self.model().await.map(|_| ())
    }

    async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model().await?;
        let batch = texts.to_vec();
        let embeddings = tokio::task::spawn_blocking(move || model.embed(batch, None))
            .await
            .map_err(|e| EmbeddingError::Generation(e.to_string()))?
            .map_err(|e| EmbeddingError::Generation(e.to_string()))?;

        if embeddings.len() != texts.len() {
            return Err(EmbeddingError::Generation(format!(
                "Embedding count mismatch: expected {}, got {}",
                texts.len(),
                embeddings.len()
            )));
        }
        for embedding in &embeddings {
            if embedding.len() != self.dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dimension,
                    actual: embedding.len(),
                });
            }
        }

        Ok(embeddings)
    }
}
