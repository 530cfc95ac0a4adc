use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{IngestStatus, IngestSummary};

/// Smoothing factor of the per-document latency average
const LATENCY_EMA_ALPHA: f64 = 0.2;
/// Most recent dead letters kept for inspection
const DEAD_LETTER_CAPACITY: usize = 100;

/// A document rejected before any of it was stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub document_id: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestStats {
    pub documents_processed: u64,
    pub documents_partial: u64,
    pub documents_cancelled: u64,
    pub chunks_indexed: u64,
    pub failed_chunks: u64,
    pub dead_letters: u64,
    /// Exponential moving average of per-document latency
    pub avg_latency_ms: f64,
    pub paused: bool,
    pub recent_dead_letters: Vec<DeadLetter>,
}

#[derive(Default)]
struct Counters {
    stats: IngestStats,
    dead_letters: VecDeque<DeadLetter>,
}

#[derive(Default)]
pub(crate) struct StatsRecorder {
    inner: Mutex<Counters>,
}

impl StatsRecorder {
    pub fn record(&self, summary: &IngestSummary) {
        let mut counters = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = &mut counters.stats;
        stats.documents_processed += 1;
        match summary.status {
            IngestStatus::Complete => {}
            IngestStatus::Partial => stats.documents_partial += 1,
            IngestStatus::Cancelled => stats.documents_cancelled += 1,
        }
        stats.failed_chunks += summary.failed_chunk_ids.len() as u64;
        stats.chunks_indexed += summary
            .chunk_count
            .saturating_sub(summary.failed_chunk_ids.len()) as u64;

        let latency = summary.took_ms as f64;
        stats.avg_latency_ms = if stats.documents_processed == 1 {
            latency
        } else {
            LATENCY_EMA_ALPHA * latency + (1.0 - LATENCY_EMA_ALPHA) * stats.avg_latency_ms
        };
    }

    pub fn dead_letter(&self, document_id: &str, error: String) {
        let mut counters = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        counters.stats.dead_letters += 1;
        if counters.dead_letters.len() == DEAD_LETTER_CAPACITY {
            counters.dead_letters.pop_front();
        }
        counters.dead_letters.push_back(DeadLetter {
            document_id: document_id.to_string(),
            error,
            at: Utc::now(),
        });
    }

    pub fn snapshot(&self, paused: bool) -> IngestStats {
        let counters = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        IngestStats {
            paused,
            recent_dead_letters: counters.dead_letters.iter().cloned().collect(),
            ..counters.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChunkQuality, ChunkStrategy};

    fn summary(status: IngestStatus, failed: usize, took_ms: u64) -> IngestSummary {
        IngestSummary {
            document_id: "doc".to_string(),
            version: 1,
            chunk_count: 4,
            failed_chunk_ids: (0..failed).map(|i| format!("doc@v1#{}", i)).collect(),
            chunks: Vec::new(),
            status,
            strategy: ChunkStrategy::Ast,
            quality: ChunkQuality::Full,
            superseded_chunks: 0,
            errors: Vec::new(),
            took_ms,
        }
    }

    #[test]
    fn test_latency_ema() {
        let recorder = StatsRecorder::default();
        recorder.record(&summary(IngestStatus::Complete, 0, 100));
        recorder.record(&summary(IngestStatus::Partial, 1, 200));

        let stats = recorder.snapshot(false);
        assert_eq!(stats.documents_processed, 2);
        assert_eq!(stats.documents_partial, 1);
        assert_eq!(stats.chunks_indexed, 7);
        assert_eq!(stats.failed_chunks, 1);
        assert!((stats.avg_latency_ms - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_dead_letters_are_bounded() {
        let recorder = StatsRecorder::default();
        for i in 0..(DEAD_LETTER_CAPACITY + 5) {
            recorder.dead_letter(&format!("doc-{}", i), "empty text".to_string());
        }
        let stats = recorder.snapshot(true);
        assert_eq!(stats.dead_letters, (DEAD_LETTER_CAPACITY + 5) as u64);
        assert_eq!(stats.recent_dead_letters.len(), DEAD_LETTER_CAPACITY);
        assert_eq!(stats.recent_dead_letters[0].document_id, "doc-5");
        assert!(stats.paused);
    }
}
