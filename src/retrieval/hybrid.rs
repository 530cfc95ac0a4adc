//! Hybrid search combining semantic and keyword search

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::stats::StatsRecorder;
use super::{
    reciprocal_rank_fusion, Candidate, FusionConfig, LexicalSource, RetrievalError,
    RetrievalResult, SearchMode, SearchRequest, SearchResponse, SearchResult, SearchStats,
    SemanticSource,
};
use crate::config::ConfigHandle;
use crate::model::{Chunk, TextRange};
use crate::store::DocumentStore;

/// Hybrid searcher combining semantic and keyword search.
///
/// Search parameters are read from the config handle on every call, so
/// weight, `rrf_k` and candidate changes apply to the next query.
pub struct HybridSearchEngine {
    semantic: Arc<dyn SemanticSource>,
    lexical: Arc<dyn LexicalSource>,
    store: Arc<dyn DocumentStore>,
    config: ConfigHandle,
    stats: StatsRecorder,
}

/// Source lists after failures have been resolved
struct Gathered {
    semantic: Vec<Candidate>,
    keyword: Vec<Candidate>,
    fusion: FusionConfig,
    degraded_reason: Option<String>,
}

impl HybridSearchEngine {
    pub fn new(
        semantic: Arc<dyn SemanticSource>,
        lexical: Arc<dyn LexicalSource>,
        store: Arc<dyn DocumentStore>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            semantic,
            lexical,
            store,
            config,
            stats: StatsRecorder::default(),
        }
    }

    /// Run a search.
    ///
    /// `k = 0` or a blank query yields an empty response. If one source
    /// fails the other one answers alone and the response is marked
    /// degraded; if every source the mode needs fails the search fails with
    /// [`RetrievalError::BackendUnavailable`].
    pub async fn search(&self, request: &SearchRequest) -> RetrievalResult<SearchResponse> {
        let started = Instant::now();
        let config = self.config.current();
        let search = &config.search;

        let weight = request.semantic_weight.unwrap_or(search.semantic_weight);
        let fusion = FusionConfig::new(search.rrf_k, weight)?;
        if let Some(min) = request.filters.min_similarity {
            if !(-1.0..=1.0).contains(&min) {
                return Err(RetrievalError::InvalidQuery(format!(
                    "min_similarity must be within [-1, 1], got {}",
                    min
                )));
            }
        }

        let mode = request.mode;
        let k = request.k.unwrap_or(search.default_k);
        let query = request.query.trim();
        if k == 0 || query.is_empty() {
            return Ok(SearchResponse::empty(mode));
        }

        let fetch = k.saturating_mul(search.candidate_multiplier.max(1));
        let timeout = Duration::from_millis(search.source_timeout_ms);

        let semantic = async {
            if mode.uses_semantic() {
                Some(
                    with_timeout(
                        timeout,
                        self.semantic.search(query, fetch),
                        RetrievalError::Semantic,
                    )
                    .await,
                )
            } else {
                None
            }
        };
        let lexical = async {
            if mode.uses_keyword() {
                Some(
                    with_timeout(
                        timeout,
                        self.lexical.search(query, fetch),
                        RetrievalError::Keyword,
                    )
                    .await,
                )
            } else {
                None
            }
        };
        let (semantic, lexical) = tokio::join!(semantic, lexical);

        let mut gathered = match gather(mode, fusion, semantic, lexical) {
            Ok(gathered) => gathered,
            Err(e) => {
                warn!("Search for '{}' failed: {}", query, e);
                self.stats.record_failure();
                return Err(e);
            }
        };

        let fusion_started = Instant::now();
        if let Some(min) = request.filters.min_similarity {
            gathered.semantic.retain(|c| c.score >= min);
        }
        let fused = reciprocal_rank_fusion(&gathered.semantic, &gathered.keyword, &gathered.fusion);

        let ids: Vec<String> = fused.iter().map(|f| f.chunk_id.clone()).collect();
        let mut chunks: HashMap<String, Chunk> = self
            .store
            .get_chunks(&ids)?
            .into_iter()
            .map(|chunk| (chunk.id.clone(), chunk))
            .collect();

        let mut results = Vec::with_capacity(k.min(fused.len()));
        for candidate in fused {
            if results.len() == k {
                break;
            }
            // Index entries can briefly outlive a superseded chunk
            let Some(chunk) = chunks.remove(&candidate.chunk_id) else {
                continue;
            };
            if !request
                .filters
                .accepts(&chunk.document_id, &chunk.metadata.language)
            {
                continue;
            }
            results.push(SearchResult {
                chunk_id: candidate.chunk_id,
                document_id: chunk.document_id,
                score: candidate.score,
                rank: results.len() + 1,
                source_scores: candidate.sources,
                range: TextRange::new(chunk.start_offset, chunk.end_offset),
                start_line: chunk.metadata.start_line,
                end_line: chunk.metadata.end_line,
                kind: chunk.kind,
                language: chunk.metadata.language,
                text: chunk.text,
            });
        }

        let fusion_ms = fusion_started.elapsed().as_secs_f64() * 1000.0;
        let latency = started.elapsed();
        let degraded = gathered.degraded_reason.is_some();
        self.stats
            .record(mode, degraded, fusion_ms, latency.as_secs_f64() * 1000.0);
        debug!(
            "{} search for '{}' returned {} results in {:?}{}",
            mode.as_str(),
            query,
            results.len(),
            latency,
            if degraded { " (degraded)" } else { "" }
        );

        Ok(SearchResponse {
            results,
            degraded,
            degraded_reason: gathered.degraded_reason,
            mode,
            took_ms: latency.as_millis() as u64,
        })
    }

    pub fn stats(&self) -> SearchStats {
        self.stats.snapshot()
    }
}

async fn with_timeout<F>(
    timeout: Duration,
    future: F,
    on_timeout: fn(String) -> RetrievalError,
) -> RetrievalResult<Vec<Candidate>>
where
    F: Future<Output = RetrievalResult<Vec<Candidate>>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout(format!(
            "timed out after {} ms",
            timeout.as_millis()
        ))),
    }
}

/// Decide which lists to fuse. A failed source in hybrid mode leaves the
/// surviving list ranked on its own at full weight.
fn gather(
    mode: SearchMode,
    fusion: FusionConfig,
    semantic: Option<RetrievalResult<Vec<Candidate>>>,
    lexical: Option<RetrievalResult<Vec<Candidate>>>,
) -> RetrievalResult<Gathered> {
    let rrf_k = fusion.rrf_k;
    match (semantic, lexical) {
        (Some(Ok(semantic)), Some(Ok(keyword))) => Ok(Gathered {
            semantic,
            keyword,
            fusion,
            degraded_reason: None,
        }),
        (Some(Ok(semantic)), Some(Err(e))) => {
            warn!("Keyword source unavailable, ranking semantically: {}", e);
            Ok(Gathered {
                semantic,
                keyword: Vec::new(),
                fusion: FusionConfig::semantic_only(rrf_k)?,
                degraded_reason: Some(e.to_string()),
            })
        }
        (Some(Err(e)), Some(Ok(keyword))) => {
            warn!("Semantic source unavailable, ranking by keywords: {}", e);
            Ok(Gathered {
                semantic: Vec::new(),
                keyword,
                fusion: FusionConfig::keyword_only(rrf_k)?,
                degraded_reason: Some(e.to_string()),
            })
        }
        (Some(Err(semantic)), Some(Err(keyword))) => Err(RetrievalError::BackendUnavailable(
            format!("{}; {}", semantic, keyword),
        )),
        (Some(Ok(semantic)), None) => Ok(Gathered {
            semantic,
            keyword: Vec::new(),
            fusion: FusionConfig::semantic_only(rrf_k)?,
            degraded_reason: None,
        }),
        (None, Some(Ok(keyword))) => Ok(Gathered {
            semantic: Vec::new(),
            keyword,
            fusion: FusionConfig::keyword_only(rrf_k)?,
            degraded_reason: None,
        }),
        (Some(Err(e)), None) | (None, Some(Err(e))) => {
            Err(RetrievalError::BackendUnavailable(e.to_string()))
        }
        (None, None) => Err(RetrievalError::InvalidQuery(format!(
            "Search mode {} uses no source",
            mode.as_str()
        ))),
    }
}
