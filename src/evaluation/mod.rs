//! Embedding model evaluation and search benchmarks
//!
//! Each candidate model gets its own in-memory collection, the labeled
//! corpus is ingested into it and every query is scored by recall@k.

mod evaluator;
mod log;
mod metrics;

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RaglineError, Result};
use crate::model::Document;
use crate::retrieval::SearchMode;

pub use evaluator::{benchmark_modes, ModelEvaluator};
pub use log::EvaluationLog;
pub use metrics::{mean, percentile, recall_at_k, resident_memory_mb};

/// A query with the results it should retrieve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledQuery {
    pub query: String,
    #[serde(default)]
    pub expected_chunk_ids: Vec<String>,
    #[serde(default)]
    pub expected_document_ids: Vec<String>,
    /// Terms that should appear in the retrieved text
    #[serde(default)]
    pub expected_terms: Vec<String>,
}

impl LabeledQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            expected_chunk_ids: Vec::new(),
            expected_document_ids: Vec::new(),
            expected_terms: Vec::new(),
        }
    }

    pub fn expect_chunks<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_chunk_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn expect_documents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected_document_ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Labeled corpus: documents to ingest and queries to score against them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSet {
    pub documents: Vec<Document>,
    pub queries: Vec<LabeledQuery>,
}

impl EvaluationSet {
    /// Read an evaluation set from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to read evaluation set: {:?}", path),
        })?;
        serde_json::from_str(&content).map_err(|e| RaglineError::Json {
            source: e,
            context: format!("Failed to parse evaluation set: {:?}", path),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean: f64,
    pub p95: f64,
}

/// Evaluation result of one model, averaged over iterations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetric {
    pub model: String,
    /// Mean recall@k over the sampled queries
    pub retrieval_accuracy: f64,
    pub latency_ms: LatencyStats,
    /// Resident memory growth while building and querying the collection
    pub memory_mb: f64,
    pub timestamp: DateTime<Utc>,
    pub unavailable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Fraction of queries that failed
    pub error_rate: f64,
    pub throughput_qps: f64,
    pub iterations: usize,
}

impl EvaluationMetric {
    pub fn unavailable(model: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            retrieval_accuracy: 0.0,
            latency_ms: LatencyStats::default(),
            memory_mb: 0.0,
            timestamp: Utc::now(),
            unavailable: true,
            error: Some(error.into()),
            error_rate: 1.0,
            throughput_qps: 0.0,
            iterations: 0,
        }
    }

    /// Weighted ranking score in `[0, 1]`: accuracy 60%, reliability 20%,
    /// speed 10% and memory efficiency 10%. Unavailable models score 0.
    pub fn score(&self) -> f64 {
        if self.unavailable {
            return 0.0;
        }
        let reliability = (1.0 - self.error_rate).clamp(0.0, 1.0);
        let speed = 1.0 / (1.0 + self.latency_ms.mean.max(0.0) / 100.0);
        let memory = 1.0 / (1.0 + self.memory_mb.max(0.0) / 10.0);
        self.retrieval_accuracy * 0.6 + reliability * 0.2 + speed * 0.1 + memory * 0.1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub metrics: Vec<EvaluationMetric>,
    /// Available model with the highest [`EvaluationMetric::score`]; lower
    /// mean latency wins ties
    pub best_model: Option<String>,
}

impl EvaluationReport {
    pub fn new(metrics: Vec<EvaluationMetric>) -> Self {
        let best_model = metrics
            .iter()
            .filter(|m| !m.unavailable)
            .min_by(|a, b| {
                b.score()
                    .total_cmp(&a.score())
                    .then_with(|| a.latency_ms.mean.total_cmp(&b.latency_ms.mean))
            })
            .map(|m| m.model.clone());
        Self {
            metrics,
            best_model,
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::from("# Embedding Model Evaluation\n\n");
        out.push_str(
            "| Model | Accuracy | Mean (ms) | p95 (ms) | Memory (MB) | Throughput (q/s) | Error rate | Score |\n",
        );
        out.push_str("|---|---|---|---|---|---|---|---|\n");
        for m in &self.metrics {
            if m.unavailable {
                out.push_str(&format!(
                    "| {} | unavailable: {} | - | - | - | - | - | - |\n",
                    m.model,
                    m.error.as_deref().unwrap_or("unknown error")
                ));
            } else {
                out.push_str(&format!(
                    "| {} | {:.3} | {:.1} | {:.1} | {:.1} | {:.1} | {:.3} | {:.3} |\n",
                    m.model,
                    m.retrieval_accuracy,
                    m.latency_ms.mean,
                    m.latency_ms.p95,
                    m.memory_mb,
                    m.throughput_qps,
                    m.error_rate,
                    m.score()
                ));
            }
        }
        if let Some(best) = &self.best_model {
            out.push_str(&format!("\n**Best model**: {}\n", best));
        }
        out
    }
}

/// Timing of one search mode over repeated queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeBenchmark {
    pub mode: SearchMode,
    pub runs: usize,
    pub failures: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}
