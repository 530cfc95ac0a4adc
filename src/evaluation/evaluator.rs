use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{
    mean, percentile, recall_at_k, resident_memory_mb, EvaluationLog, EvaluationMetric,
    EvaluationReport, EvaluationSet, LabeledQuery, LatencyStats, ModeBenchmark,
};
use crate::collection::Collection;
use crate::config::{Config, ConfigHandle};
use crate::embedding::{BackendRegistry, EmbeddingService};
use crate::error::Result;
use crate::retrieval::{SearchMode, SearchRequest};
use crate::store::MemoryStore;

/// Measurements of a single pass over the corpus
struct IterationResult {
    accuracy: f64,
    mean_ms: f64,
    p95_ms: f64,
    memory_mb: f64,
    error_rate: f64,
    throughput_qps: f64,
}

/// Compares embedding models on a labeled corpus.
///
/// Every iteration builds a fresh in-memory collection for the model,
/// ingests the corpus and runs the sampled queries through hybrid search.
/// A model that cannot be loaded is reported as unavailable and the run
/// moves on to the next model.
pub struct ModelEvaluator {
    config: Config,
    registry: BackendRegistry,
}

impl ModelEvaluator {
    pub fn new(config: Config, registry: BackendRegistry) -> Self {
        Self { config, registry }
    }

    /// Evaluator over every model listed in the configuration
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = BackendRegistry::from_config(&config.embedding)?;
        Ok(Self::new(config, registry))
    }

    pub async fn evaluate(&self, models: &[String], set: &EvaluationSet) -> Vec<EvaluationMetric> {
        let queries = self.sample(&set.queries);
        info!(
            "Evaluating {} models on {} documents and {} queries",
            models.len(),
            set.documents.len(),
            queries.len()
        );

        let mut metrics = Vec::with_capacity(models.len());
        for model in models {
            metrics.push(self.evaluate_model(model, &set.documents, queries).await);
        }
        metrics
    }

    /// Evaluate and append every metric to `log`
    pub async fn evaluate_into(
        &self,
        models: &[String],
        set: &EvaluationSet,
        log: &mut EvaluationLog,
    ) -> Result<EvaluationReport> {
        let metrics = self.evaluate(models, set).await;
        for metric in &metrics {
            log.append(metric.clone())?;
        }
        Ok(EvaluationReport::new(metrics))
    }

    /// The first `evaluation.sample_size` queries; all of them when 0
    fn sample<'a>(&self, queries: &'a [LabeledQuery]) -> &'a [LabeledQuery] {
        match self.config.evaluation.sample_size {
            0 => queries,
            n => &queries[..n.min(queries.len())],
        }
    }

    async fn evaluate_model(
        &self,
        model: &str,
        documents: &[crate::model::Document],
        queries: &[LabeledQuery],
    ) -> EvaluationMetric {
        let backend = match self.registry.get(model) {
            Ok(backend) => backend,
            Err(e) => {
                warn!("Skipping model {}: {}", model, e);
                return EvaluationMetric::unavailable(model, e.to_string());
            }
        };
        let mut registry = BackendRegistry::new();
        registry.register(backend);

        let mut config = self.config.clone();
        config.storage.backend = "memory".to_string();
        config.embedding.default_model = model.to_string();
        let embeddings = Arc::new(EmbeddingService::new(registry, &config.embedding));

        if let Err(e) = embeddings.load(Some(model)).await {
            warn!("Model {} is unavailable: {}", model, e);
            return EvaluationMetric::unavailable(model, e.to_string());
        }

        let iterations = config.evaluation.iterations.max(1);
        let mut runs = Vec::with_capacity(iterations);
        for iteration in 0..iterations {
            match self
                .run_iteration(&config, &embeddings, documents, queries)
                .await
            {
                Ok(run) => {
                    debug!(
                        "{} iteration {}: accuracy {:.3}, mean {:.1} ms",
                        model,
                        iteration + 1,
                        run.accuracy,
                        run.mean_ms
                    );
                    runs.push(run);
                }
                Err(e) => {
                    warn!("Evaluation of {} failed: {}", model, e);
                    return EvaluationMetric::unavailable(model, e.to_string());
                }
            }
        }

        let average = |f: fn(&IterationResult) -> f64| {
            mean(&runs.iter().map(f).collect::<Vec<_>>())
        };
        let metric = EvaluationMetric {
            model: model.to_string(),
            retrieval_accuracy: average(|r| r.accuracy),
            latency_ms: LatencyStats {
                mean: average(|r| r.mean_ms),
                p95: average(|r| r.p95_ms),
            },
            memory_mb: average(|r| r.memory_mb),
            timestamp: chrono::Utc::now(),
            unavailable: false,
            error: None,
            error_rate: average(|r| r.error_rate),
            throughput_qps: average(|r| r.throughput_qps),
            iterations,
        };
        info!(
            "Model {}: accuracy {:.3}, latency {:.1} ms (p95 {:.1} ms)",
            metric.model, metric.retrieval_accuracy, metric.latency_ms.mean, metric.latency_ms.p95
        );
        metric
    }

    async fn run_iteration(
        &self,
        config: &Config,
        embeddings: &Arc<EmbeddingService>,
        documents: &[crate::model::Document],
        queries: &[LabeledQuery],
    ) -> Result<IterationResult> {
        // Every pass re-embeds the corpus
        embeddings.cache().clear();
        let memory_before = resident_memory_mb();

        let collection = Collection::with_parts(
            ConfigHandle::new(config.clone()),
            Arc::new(MemoryStore::new()),
            Arc::clone(embeddings),
        )?;
        for document in documents {
            if let Err(e) = collection.ingest(document.clone()).await {
                warn!("Evaluation document {} not ingested: {}", document.id, e);
            }
        }

        let k = config.evaluation.k.max(1);
        let mut latencies = Vec::with_capacity(queries.len());
        let mut recalls = Vec::with_capacity(queries.len());
        let mut failures = 0usize;
        let started = Instant::now();

        for query in queries {
            let query_started = Instant::now();
            match collection.search(&SearchRequest::new(&query.query, k)).await {
                // A degraded answer does not measure the model
                Ok(response) if !response.degraded => {
                    latencies.push(query_started.elapsed().as_secs_f64() * 1000.0);
                    recalls.push(recall_at_k(query, &response.results, k));
                }
                Ok(response) => {
                    debug!(
                        "Query '{}' degraded: {}",
                        query.query,
                        response.degraded_reason.unwrap_or_default()
                    );
                    failures += 1;
                }
                Err(e) => {
                    debug!("Query '{}' failed: {}", query.query, e);
                    failures += 1;
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        Ok(IterationResult {
            accuracy: mean(&recalls),
            mean_ms: mean(&latencies),
            p95_ms: percentile(&latencies, 0.95),
            memory_mb: (resident_memory_mb() - memory_before).max(0.0),
            error_rate: if queries.is_empty() {
                0.0
            } else {
                failures as f64 / queries.len() as f64
            },
            throughput_qps: if elapsed > 0.0 {
                recalls.len() as f64 / elapsed
            } else {
                0.0
            },
        })
    }
}

/// Time every search mode on `queries`, `iterations` passes each
pub async fn benchmark_modes(
    collection: &Collection,
    queries: &[String],
    iterations: usize,
    k: usize,
) -> Vec<ModeBenchmark> {
    let mut benchmarks = Vec::new();
    for mode in [SearchMode::Semantic, SearchMode::Keyword, SearchMode::Hybrid] {
        let mut timings = Vec::new();
        let mut failures = 0;
        for _ in 0..iterations.max(1) {
            for query in queries {
                let request = SearchRequest::new(query, k).with_mode(mode);
                let started = Instant::now();
                match collection.search(&request).await {
                    Ok(_) => timings.push(started.elapsed().as_secs_f64() * 1000.0),
                    Err(e) => {
                        debug!("{} benchmark query failed: {}", mode.as_str(), e);
                        failures += 1;
                    }
                }
            }
        }
        benchmarks.push(ModeBenchmark {
            mode,
            runs: timings.len(),
            failures,
            avg_ms: mean(&timings),
            min_ms: timings.iter().copied().reduce(f64::min).unwrap_or(0.0),
            max_ms: timings.iter().copied().reduce(f64::max).unwrap_or(0.0),
        });
    }
    benchmarks
}
