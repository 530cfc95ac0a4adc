use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use super::SearchMode;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchStats {
    pub total_searches: u64,
    pub hybrid_searches: u64,
    pub semantic_searches: u64,
    pub keyword_searches: u64,
    pub degraded_searches: u64,
    pub failed_searches: u64,
    /// Running mean of the time spent fusing and hydrating results
    pub avg_fusion_ms: f64,
    /// Running mean of end-to-end latency
    pub avg_latency_ms: f64,
}

#[derive(Default)]
pub(crate) struct StatsRecorder {
    inner: Mutex<SearchStats>,
}

impl StatsRecorder {
    pub fn record(&self, mode: SearchMode, degraded: bool, fusion_ms: f64, latency_ms: f64) {
        let mut stats = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total_searches += 1;
        match mode {
            SearchMode::Hybrid => stats.hybrid_searches += 1,
            SearchMode::Semantic => stats.semantic_searches += 1,
            SearchMode::Keyword => stats.keyword_searches += 1,
        }
        if degraded {
            stats.degraded_searches += 1;
        }
        let n = stats.total_searches as f64;
        stats.avg_fusion_ms += (fusion_ms - stats.avg_fusion_ms) / n;
        stats.avg_latency_ms += (latency_ms - stats.avg_latency_ms) / n;
    }

    pub fn record_failure(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .failed_searches += 1;
    }

    pub fn snapshot(&self) -> SearchStats {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
