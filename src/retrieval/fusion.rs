//! Reciprocal Rank Fusion algorithm for combining search results

use std::cmp::Ordering;
use std::collections::HashMap;

use super::{Candidate, RetrievalError, RetrievalResult, SourceScores};

/// Configuration for fusion algorithm
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionConfig {
    /// RRF K constant (typically 60)
    pub rrf_k: f32,

    /// Weight for semantic results
    pub semantic_weight: f32,

    /// Weight for keyword results
    pub keyword_weight: f32,
}

impl FusionConfig {
    /// Semantic list weighted `semantic_weight`, keyword list `1 - semantic_weight`
    pub fn new(rrf_k: f32, semantic_weight: f32) -> RetrievalResult<Self> {
        if !(0.0..=1.0).contains(&semantic_weight) {
            return Err(RetrievalError::InvalidQuery(format!(
                "semantic_weight must be within [0, 1], got {}",
                semantic_weight
            )));
        }
        if !rrf_k.is_finite() || rrf_k <= 0.0 {
            return Err(RetrievalError::InvalidQuery(format!(
                "rrf_k must be positive, got {}",
                rrf_k
            )));
        }

        Ok(Self {
            rrf_k,
            semantic_weight,
            keyword_weight: 1.0 - semantic_weight,
        })
    }

    /// Full weight on the semantic list
    pub fn semantic_only(rrf_k: f32) -> RetrievalResult<Self> {
        Self::new(rrf_k, 1.0)
    }

    /// Full weight on the keyword list
    pub fn keyword_only(rrf_k: f32) -> RetrievalResult<Self> {
        Self::new(rrf_k, 0.0)
    }
}

/// A chunk with its fused score and the raw scores it was fused from
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub chunk_id: String,
    pub score: f32,
    pub sources: SourceScores,
}

/// Apply Reciprocal Rank Fusion to combine two ranked lists
///
/// RRF formula: `score(id) = sum over lists of weight / (rrf_k + rank)`,
/// rank 1-indexed. A chunk present in only one list still scores. Only the
/// first occurrence of an id within a list counts.
///
/// Output is sorted by fused score descending, then by raw semantic
/// similarity descending (absent sorts last), then by chunk id ascending.
pub fn reciprocal_rank_fusion(
    semantic_results: &[Candidate],
    keyword_results: &[Candidate],
    config: &FusionConfig,
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<&str, FusedCandidate> = HashMap::new();

    for (rank, candidate) in semantic_results.iter().enumerate() {
        let entry = fused
            .entry(candidate.chunk_id.as_str())
            .or_insert_with(|| FusedCandidate {
                chunk_id: candidate.chunk_id.clone(),
                score: 0.0,
                sources: SourceScores::default(),
            });
        if entry.sources.semantic.is_some() {
            continue;
        }
        entry.score += config.semantic_weight / (config.rrf_k + rank as f32 + 1.0);
        entry.sources.semantic = Some(candidate.score);
    }

    for (rank, candidate) in keyword_results.iter().enumerate() {
        let entry = fused
            .entry(candidate.chunk_id.as_str())
            .or_insert_with(|| FusedCandidate {
                chunk_id: candidate.chunk_id.clone(),
                score: 0.0,
                sources: SourceScores::default(),
            });
        if entry.sources.keyword.is_some() {
            continue;
        }
        entry.score += config.keyword_weight / (config.rrf_k + rank as f32 + 1.0);
        entry.sources.keyword = Some(candidate.score);
    }

    let mut results: Vec<FusedCandidate> = fused.into_values().collect();
    results.sort_by(compare_fused);
    results
}

fn compare_fused(a: &FusedCandidate, b: &FusedCandidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.sources.semantic, b.sources.semantic) {
            (Some(x), Some(y)) => y.total_cmp(&x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}
