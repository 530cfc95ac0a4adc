//! Candidate sources feeding the hybrid engine

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::{RetrievalError, RetrievalResult};
use crate::embedding::EmbeddingService;
use crate::index::{KeywordIndex, VectorIndex};

/// One entry of a ranked source list with the source's raw score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub chunk_id: String,
    pub score: f32,
}

impl Candidate {
    pub fn new(chunk_id: impl Into<String>, score: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            score,
        }
    }
}

impl From<(String, f32)> for Candidate {
    fn from((chunk_id, score): (String, f32)) -> Self {
        Self { chunk_id, score }
    }
}

/// Ranks chunks by meaning: cosine similarity of the query embedding
#[async_trait]
pub trait SemanticSource: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> RetrievalResult<Vec<Candidate>>;
}

/// Ranks chunks by term overlap with the query
#[async_trait]
pub trait LexicalSource: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> RetrievalResult<Vec<Candidate>>;
}

/// Embeds the query with one model and searches that model's vector index
pub struct VectorSource {
    embeddings: Arc<EmbeddingService>,
    index: Arc<VectorIndex>,
    model: String,
}

impl VectorSource {
    pub fn new(
        embeddings: Arc<EmbeddingService>,
        index: Arc<VectorIndex>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            embeddings,
            index,
            model: model.into(),
        }
    }
}

#[async_trait]
impl SemanticSource for VectorSource {
    async fn search(&self, query: &str, k: usize) -> RetrievalResult<Vec<Candidate>> {
        let vector = self
            .embeddings
            .embed_one(query, Some(&self.model))
            .await
            .map_err(|e| RetrievalError::Semantic(e.to_string()))?;

        let hits = self
            .index
            .query(&vector, k, None)
            .map_err(|e| RetrievalError::Semantic(e.to_string()))?;
        Ok(hits.into_iter().map(Candidate::from).collect())
    }
}

/// BM25 over the shared keyword index
pub struct KeywordSource {
    index: Arc<KeywordIndex>,
}

impl KeywordSource {
    pub fn new(index: Arc<KeywordIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl LexicalSource for KeywordSource {
    async fn search(&self, query: &str, k: usize) -> RetrievalResult<Vec<Candidate>> {
        Ok(self
            .index
            .search(query, k)
            .into_iter()
            .map(Candidate::from)
            .collect())
    }
}
