//! A searchable collection: one store, one embedding model, and the vector
//! and keyword indexes derived from them.

use std::sync::Arc;

use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunking::{ChunkerRegistry, ChunkerStats};
use crate::config::{Config, ConfigHandle};
use crate::embedding::{EmbeddingService, EmbeddingStats};
use crate::error::Result;
use crate::index::{KeywordIndex, KeywordIndexStats, VectorIndex, VectorIndexStats};
use crate::ingest::{IngestEvent, IngestStats, IngestSummary, IngestionPipeline, RebuildSummary};
use crate::model::Document;
use crate::retrieval::{
    HybridSearchEngine, KeywordSource, SearchRequest, SearchResponse, SearchStats, VectorSource,
};
use crate::store::{open_store, DocumentStore, MemoryStore, StoreStats};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionStats {
    pub model: String,
    pub store: StoreStats,
    pub vector_index: VectorIndexStats,
    pub keyword_index: KeywordIndexStats,
    pub embedding: EmbeddingStats,
    pub chunking: ChunkerStats,
    pub ingest: IngestStats,
    pub search: SearchStats,
}

/// Everything needed to ingest and search one corpus.
///
/// The collection indexes vectors of a single embedding model, the
/// configured default model at construction time.
pub struct Collection {
    config: ConfigHandle,
    model: String,
    store: Arc<dyn DocumentStore>,
    embeddings: Arc<EmbeddingService>,
    vectors: Arc<VectorIndex>,
    keywords: Arc<KeywordIndex>,
    chunkers: Arc<ChunkerRegistry>,
    pipeline: Arc<IngestionPipeline>,
    engine: HybridSearchEngine,
}

impl Collection {
    /// Open the configured store and embedding models, then rebuild the
    /// indexes from whatever the store already holds
    pub fn open(config: ConfigHandle) -> Result<Self> {
        let snapshot = config.current();
        let store = open_store(&snapshot)?;
        let embeddings = Arc::new(EmbeddingService::from_config(&snapshot.embedding)?);
        let collection = Self::with_parts(config, store, embeddings)?;

        if collection.store.stats()?.chunk_count > 0 {
            collection.rebuild()?;
        }
        Ok(collection)
    }

    /// In-memory collection over the models listed in `config`
    pub fn in_memory(config: Config) -> Result<Self> {
        let embeddings = Arc::new(EmbeddingService::from_config(&config.embedding)?);
        Self::with_parts(
            ConfigHandle::new(config),
            Arc::new(MemoryStore::new()),
            embeddings,
        )
    }

    /// Assemble a collection from already constructed services
    pub fn with_parts(
        config: ConfigHandle,
        store: Arc<dyn DocumentStore>,
        embeddings: Arc<EmbeddingService>,
    ) -> Result<Self> {
        let snapshot = config.current();
        let model = embeddings.default_model();
        let dimension = embeddings.dimension(Some(&model))?;

        let vectors = Arc::new(VectorIndex::new(dimension, &snapshot.index));
        let keywords = Arc::new(KeywordIndex::new(&snapshot.keyword));
        let chunkers = Arc::new(ChunkerRegistry::new()?);

        let pipeline = Arc::new(IngestionPipeline::new(
            store.clone(),
            embeddings.clone(),
            vectors.clone(),
            keywords.clone(),
            chunkers.clone(),
            config.clone(),
            model.clone(),
        ));
        let engine = HybridSearchEngine::new(
            Arc::new(VectorSource::new(
                embeddings.clone(),
                vectors.clone(),
                model.clone(),
            )),
            Arc::new(KeywordSource::new(keywords.clone())),
            store.clone(),
            config.clone(),
        );

        info!("Collection ready with model {} ({} dims)", model, dimension);
        Ok(Self {
            config,
            model,
            store,
            embeddings,
            vectors,
            keywords,
            chunkers,
            pipeline,
            engine,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.current()
    }

    pub fn config_handle(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn embeddings(&self) -> &Arc<EmbeddingService> {
        &self.embeddings
    }

    pub fn vectors(&self) -> &Arc<VectorIndex> {
        &self.vectors
    }

    pub fn keywords(&self) -> &Arc<KeywordIndex> {
        &self.keywords
    }

    pub fn pipeline(&self) -> &Arc<IngestionPipeline> {
        &self.pipeline
    }

    pub fn engine(&self) -> &HybridSearchEngine {
        &self.engine
    }

    /// Load the embedding model ahead of the first request
    pub async fn warm_up(&self) -> Result<()> {
        self.embeddings.load(Some(&self.model)).await?;
        Ok(())
    }

    pub async fn ingest(&self, document: Document) -> Result<IngestSummary> {
        Ok(self.pipeline.ingest(document).await?)
    }

    pub fn ingest_stream(
        &self,
        documents: Vec<Document>,
        cancel: CancellationToken,
    ) -> ReceiverStream<IngestEvent> {
        self.pipeline.ingest_stream(documents, cancel)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        Ok(self.engine.search(request).await?)
    }

    /// Remove a document; returns the number of removed chunks
    pub fn remove(&self, document_id: &str) -> Result<usize> {
        Ok(self.pipeline.remove(document_id)?)
    }

    pub fn rebuild(&self) -> Result<RebuildSummary> {
        Ok(self.pipeline.rebuild_indexes()?)
    }

    /// Validate and apply a new configuration.
    ///
    /// Search, chunking and BM25 parameters are read per operation.
    /// Embedding limits and index parameters are pushed to the services
    /// here; a tokenizer change triggers a keyword index rebuild.
    pub fn update_config(&self, config: Config) -> Result<Arc<Config>> {
        let previous = self.config.current();
        let applied = self.config.update(config)?;

        self.embeddings.apply_limits(&applied.embedding);
        self.vectors.configure(&applied.index);
        self.keywords.configure(&applied.keyword);

        if applied.embedding.default_model != self.model {
            warn!(
                "Default model changed to {}; this collection keeps indexing with {}",
                applied.embedding.default_model, self.model
            );
        }
        let tokenizer_changed = previous.keyword.stemming != applied.keyword.stemming
            || previous.keyword.stop_words != applied.keyword.stop_words
            || previous.keyword.min_token_len != applied.keyword.min_token_len;
        if tokenizer_changed {
            info!("Tokenizer settings changed, rebuilding indexes");
            self.rebuild()?;
        }
        Ok(applied)
    }

    pub fn stats(&self) -> Result<CollectionStats> {
        Ok(CollectionStats {
            model: self.model.clone(),
            store: self.store.stats()?,
            vector_index: self.vectors.stats(),
            keyword_index: self.keywords.stats(),
            embedding: self.embeddings.stats(),
            chunking: self.chunkers.stats(),
            ingest: self.pipeline.stats(),
            search: self.engine.stats(),
        })
    }
}
