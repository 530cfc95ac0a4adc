//! Hybrid retrieval: semantic and keyword search fused with Reciprocal Rank
//! Fusion.
//!
//! Both sources sit behind traits so either can be swapped out or simulated.
//! When one source fails the engine answers from the other and flags the
//! response as degraded.

mod fusion;
mod hybrid;
mod sources;
mod stats;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ChunkKind, TextRange};
use crate::store::StoreError;

pub use fusion::{reciprocal_rank_fusion, FusedCandidate, FusionConfig};
pub use hybrid::HybridSearchEngine;
pub use sources::{Candidate, KeywordSource, LexicalSource, SemanticSource, VectorSource};
pub use stats::SearchStats;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Semantic search failed: {0}")]
    Semantic(String),

    #[error("Keyword search failed: {0}")]
    Keyword(String),

    /// No source could answer the query
    #[error("Search backends unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Failed to load results: {0}")]
    Store(#[from] StoreError),
}

pub type RetrievalResult<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Semantic,
    Keyword,
}

impl SearchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
        }
    }

    pub fn uses_semantic(self) -> bool {
        matches!(self, Self::Hybrid | Self::Semantic)
    }

    pub fn uses_keyword(self) -> bool {
        matches!(self, Self::Hybrid | Self::Keyword)
    }
}

impl std::str::FromStr for SearchMode {
    type Err = RetrievalError;

    fn from_str(value: &str) -> RetrievalResult<Self> {
        match value.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "semantic" => Ok(Self::Semantic),
            "keyword" => Ok(Self::Keyword),
            other => Err(RetrievalError::InvalidQuery(format!(
                "Unknown search mode '{}'",
                other
            ))),
        }
    }
}

/// Optional restrictions applied to a search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Keep only chunks in these languages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub languages: Vec<String>,

    /// Keep only chunks of these documents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub document_ids: Vec<String>,

    /// Drop semantic candidates below this cosine similarity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_similarity: Option<f32>,
}

impl SearchFilters {
    fn is_empty(&self) -> bool {
        self.languages.is_empty() && self.document_ids.is_empty()
    }

    fn accepts(&self, document_id: &str, language: &str) -> bool {
        (self.document_ids.is_empty() || self.document_ids.iter().any(|id| id == document_id))
            && (self.languages.is_empty()
                || self
                    .languages
                    .iter()
                    .any(|l| l.eq_ignore_ascii_case(language)))
    }
}

/// A search as submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,

    /// Number of results; `search.default_k` when absent
    #[serde(default)]
    pub k: Option<usize>,

    /// Weight of the semantic list in `[0, 1]`; `search.semantic_weight` when absent
    #[serde(default)]
    pub semantic_weight: Option<f32>,

    #[serde(default)]
    pub mode: SearchMode,

    #[serde(default)]
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, k: usize) -> Self {
        Self {
            query: query.into(),
            k: Some(k),
            semantic_weight: None,
            mode: SearchMode::Hybrid,
            filters: SearchFilters::default(),
        }
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_semantic_weight(mut self, weight: f32) -> Self {
        self.semantic_weight = Some(weight);
        self
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Raw per-source scores behind a fused result; a source that did not
/// return the chunk (or did not run) leaves its score absent
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceScores {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    /// Fused RRF score
    pub score: f32,
    /// 1-based position in the response
    pub rank: usize,
    pub source_scores: SourceScores,
    pub text: String,
    pub range: TextRange,
    pub start_line: usize,
    pub end_line: usize,
    pub kind: ChunkKind,
    pub language: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub mode: SearchMode,
    pub took_ms: u64,
}

impl SearchResponse {
    pub fn empty(mode: SearchMode) -> Self {
        Self {
            results: Vec::new(),
            degraded: false,
            degraded_reason: None,
            mode,
            took_ms: 0,
        }
    }
}
