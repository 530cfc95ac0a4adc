use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    BackendRegistry, BreakerState, CircuitBreaker, EmbeddingBackend, EmbeddingCache,
    EmbeddingError, EmbeddingResult, TokenBucket,
};
use crate::config::EmbeddingConfig;

/// Request settings re-read on every call so config updates apply live
#[derive(Debug, Clone)]
struct Limits {
    default_model: String,
    max_batch_size: usize,
    request_timeout: Duration,
    max_retries: u32,
    retry_base: Duration,
    failure_threshold: u32,
    cooldown: Duration,
}

impl From<&EmbeddingConfig> for Limits {
    fn from(config: &EmbeddingConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            max_batch_size: config.max_batch_size.max(1),
            request_timeout: Duration::from_millis(config.request_timeout_ms.max(1)),
            max_retries: config.max_retries,
            retry_base: Duration::from_millis(config.retry_base_ms),
            failure_threshold: config.failure_threshold,
            cooldown: Duration::from_millis(config.cooldown_ms),
        }
    }
}

#[derive(Debug, Default)]
struct ModelCounters {
    requests: AtomicU64,
    texts: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStats {
    pub model: String,
    pub dimension: usize,
    pub requests: u64,
    pub texts: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub retries: u64,
    pub failures: u64,
    pub breaker: BreakerState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingStats {
    pub default_model: String,
    pub cache_entries: usize,
    pub max_concurrency: usize,
    pub models: Vec<ModelStats>,
}

/// Batched, cached and rate-limited access to the registered embedding
/// models.
///
/// Every backend call goes through the token bucket, the concurrency
/// semaphore, a per-request timeout and the model's circuit breaker.
/// Transient failures are retried with exponential backoff; when retries
/// run out the caller gets [`EmbeddingError::ModelUnavailable`].
pub struct EmbeddingService {
    registry: BackendRegistry,
    limits: RwLock<Limits>,
    cache: EmbeddingCache,
    limiter: TokenBucket,
    semaphore: Arc<Semaphore>,
    permits: Mutex<usize>,
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    counters: HashMap<String, Arc<ModelCounters>>,
}

impl EmbeddingService {
    pub fn new(registry: BackendRegistry, config: &EmbeddingConfig) -> Self {
        let limits = Limits::from(config);
        let mut breakers = HashMap::new();
        let mut counters = HashMap::new();
        for model in registry.model_ids() {
            breakers.insert(
                model.clone(),
                Arc::new(CircuitBreaker::new(
                    model.clone(),
                    limits.failure_threshold,
                    limits.cooldown,
                )),
            );
            counters.insert(model, Arc::new(ModelCounters::default()));
        }
        let permits = config.max_concurrency.max(1);

        Self {
            registry,
            limits: RwLock::new(limits),
            cache: EmbeddingCache::new(config.cache_capacity),
            limiter: TokenBucket::new(config.requests_per_second, config.burst),
            semaphore: Arc::new(Semaphore::new(permits)),
            permits: Mutex::new(permits),
            breakers,
            counters,
        }
    }

    /// Service over every model listed in the configuration
    pub fn from_config(config: &EmbeddingConfig) -> EmbeddingResult<Self> {
        Ok(Self::new(BackendRegistry::from_config(config)?, config))
    }

    fn limits(&self) -> Limits {
        self.limits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-apply rate, concurrency, retry and breaker settings
    pub fn apply_limits(&self, config: &EmbeddingConfig) {
        let limits = Limits::from(config);
        for breaker in self.breakers.values() {
            breaker.reconfigure(limits.failure_threshold, limits.cooldown);
        }
        self.limiter
            .reconfigure(config.requests_per_second, config.burst);

        let wanted = config.max_concurrency.max(1);
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if wanted > *permits {
            self.semaphore.add_permits(wanted - *permits);
            *permits = wanted;
        } else if wanted < *permits {
            // Permits held by in-flight requests cannot be forgotten yet
            let forgotten = self.semaphore.forget_permits(*permits - wanted);
            *permits -= forgotten;
        }

        *self.limits.write().unwrap_or_else(PoisonError::into_inner) = limits;
        debug!(
            "Embedding limits updated: concurrency {}, {} req/s",
            *permits, config.requests_per_second
        );
    }

    pub fn default_model(&self) -> String {
        self.limits().default_model
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.registry.model_ids()
    }

    fn resolve(&self, model: Option<&str>) -> EmbeddingResult<Arc<dyn EmbeddingBackend>> {
        match model {
            Some(model) => self.registry.get(model),
            None => self.registry.get(&self.default_model()),
        }
    }

    pub fn dimension(&self, model: Option<&str>) -> EmbeddingResult<usize> {
        Ok(self.resolve(model)?.dimension())
    }

    /// Load a model ahead of first use; load failures surface as
    /// [`EmbeddingError::ModelUnavailable`]
    pub async fn load(&self, model: Option<&str>) -> EmbeddingResult<()> {
        let backend = self.resolve(model)?;
        let id = backend.model_id().to_string();
        let timeout = self.limits().request_timeout.max(Duration::from_secs(300));
        match tokio::time::timeout(timeout, backend.load()).await {
            Ok(Ok(())) => {
                info!("Embedding model {} ready", id);
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Failed to load embedding model {}: {}", id, e);
                Err(EmbeddingError::unavailable(&id, e.to_string()))
            }
            Err(_) => Err(EmbeddingError::unavailable(&id, "model load timed out")),
        }
    }

    /// Embed `texts` with `model` (default model when `None`).
    ///
    /// Returns one vector per text in input order, or the first error.
    pub async fn embed(
        &self,
        texts: &[String],
        model: Option<&str>,
    ) -> EmbeddingResult<Vec<Vec<f32>>> {
        self.embed_each(texts, model)
            .await
            .into_iter()
            .collect()
    }

    pub async fn embed_one(&self, text: &str, model: Option<&str>) -> EmbeddingResult<Vec<f32>> {
        let mut vectors = self.embed(&[text.to_string()], model).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Generation("no vector returned".to_string()))
    }

    /// Embed `texts`, isolating failures per text.
    ///
    /// Batches that fail are retried one text at a time so a single bad
    /// input does not take its batch down with it.
    pub async fn embed_each(
        &self,
        texts: &[String],
        model: Option<&str>,
    ) -> Vec<EmbeddingResult<Vec<f32>>> {
        let backend = match self.resolve(model) {
            Ok(backend) => backend,
            Err(e) => return texts.iter().map(|_| Err(e.clone())).collect(),
        };
        let id = backend.model_id().to_string();
        let counters = self.counters_for(&id);
        counters.texts.fetch_add(texts.len() as u64, Ordering::Relaxed);

        let mut results: Vec<Option<EmbeddingResult<Vec<f32>>>> = texts
            .iter()
            .map(|text| self.cache.get(&id, text).map(Ok))
            .collect();
        let missing: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        counters
            .cache_hits
            .fetch_add((texts.len() - missing.len()) as u64, Ordering::Relaxed);
        counters
            .cache_misses
            .fetch_add(missing.len() as u64, Ordering::Relaxed);

        let batch_size = self.limits().max_batch_size;
        let batches = missing.chunks(batch_size).map(|indices| {
            let backend = Arc::clone(&backend);
            async move {
                let batch: Vec<String> = indices.iter().map(|&i| texts[i].clone()).collect();
                let outcome = match self.request(backend.as_ref(), &batch).await {
                    Ok(vectors) => vectors.into_iter().map(Ok).collect(),
                    Err(e) if indices.len() == 1 => vec![Err(e)],
                    Err(e) => {
                        debug!(
                            "Batch of {} failed for {} ({}), isolating",
                            indices.len(),
                            backend.model_id(),
                            e
                        );
                        let mut each = Vec::with_capacity(batch.len());
                        for text in &batch {
                            let single = self
                                .request(backend.as_ref(), std::slice::from_ref(text))
                                .await
                                .and_then(|mut v| {
                                    v.pop().ok_or_else(|| {
                                        EmbeddingError::Generation("no vector returned".into())
                                    })
                                });
                            each.push(single);
                        }
                        each
                    }
                };
                indices.iter().copied().zip(outcome).collect::<Vec<_>>()
            }
        });

        for (index, result) in join_all(batches).await.into_iter().flatten() {
            if let Ok(vector) = &result {
                self.cache.insert(&id, &texts[index], vector.clone());
            }
            results[index] = Some(result);
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(EmbeddingError::Generation("text skipped".into()))))
            .collect()
    }

    fn counters_for(&self, model: &str) -> Arc<ModelCounters> {
        self.counters
            .get(model)
            .cloned()
            .unwrap_or_else(|| Arc::new(ModelCounters::default()))
    }

    /// One logical backend request with rate limiting, timeout, retries and
    /// circuit breaking
    async fn request(
        &self,
        backend: &dyn EmbeddingBackend,
        batch: &[String],
    ) -> EmbeddingResult<Vec<Vec<f32>>> {
        let model = backend.model_id();
        let limits = self.limits();
        let counters = self.counters_for(model);
        let breaker = self.breakers.get(model).cloned();

        if let Some(breaker) = &breaker {
            if !breaker.allow() {
                return Err(EmbeddingError::unavailable(model, "circuit open"));
            }
        }
        counters.requests.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0;
        let result = loop {
            self.limiter.acquire().await;
            let attempt_result = {
                let _permit = match self.semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(e) => break Err(EmbeddingError::unavailable(model, e.to_string())),
                };
                match tokio::time::timeout(limits.request_timeout, backend.embed_batch(batch)).await
                {
                    Ok(result) => result,
                    Err(_) => Err(EmbeddingError::Timeout(
                        limits.request_timeout.as_millis() as u64
                    )),
                }
            };

            match attempt_result {
                Ok(vectors) => break check_shape(vectors, batch.len(), backend.dimension()),
                Err(e) if e.is_transient() && attempt < limits.max_retries => {
                    let delay = limits.retry_base * 2u32.saturating_pow(attempt);
                    debug!(
                        "Transient error from {} (attempt {}): {}, retrying in {:?}",
                        model,
                        attempt + 1,
                        e,
                        delay
                    );
                    counters.retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    break Err(EmbeddingError::unavailable(
                        model,
                        format!("{} after {} retries", e, attempt),
                    ))
                }
                Err(e) => break Err(e),
            }
        };

        match (&result, &breaker) {
            (Ok(_), Some(breaker)) => breaker.record_success(),
            (Err(EmbeddingError::InvalidInput(_)), Some(breaker)) => breaker.release(),
            (Err(EmbeddingError::InvalidInput(_)), None) => {}
            (Err(_), Some(breaker)) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                breaker.record_failure();
            }
            (Err(_), None) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
            }
            (Ok(_), None) => {}
        }
        result
    }

    pub fn breaker_state(&self, model: &str) -> Option<BreakerState> {
        self.breakers.get(model).map(|b| b.state())
    }

    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    pub fn stats(&self) -> EmbeddingStats {
        let models = self
            .registry
            .model_ids()
            .into_iter()
            .map(|model| {
                let counters = self.counters_for(&model);
                ModelStats {
                    dimension: self.registry.get(&model).map_or(0, |b| b.dimension()),
                    requests: counters.requests.load(Ordering::Relaxed),
                    texts: counters.texts.load(Ordering::Relaxed),
                    cache_hits: counters.cache_hits.load(Ordering::Relaxed),
                    cache_misses: counters.cache_misses.load(Ordering::Relaxed),
                    retries: counters.retries.load(Ordering::Relaxed),
                    failures: counters.failures.load(Ordering::Relaxed),
                    breaker: self
                        .breaker_state(&model)
                        .unwrap_or(BreakerState::Closed),
                    model,
                }
            })
            .collect();

        EmbeddingStats {
            default_model: self.default_model(),
            cache_entries: self.cache.len(),
            max_concurrency: *self.permits.lock().unwrap_or_else(PoisonError::into_inner),
            models,
        }
    }
}

fn check_shape(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dimension: usize,
) -> EmbeddingResult<Vec<Vec<f32>>> {
    if vectors.len() != expected {
        return Err(EmbeddingError::Generation(format!(
            "Embedding count mismatch: expected {}, got {}",
            expected,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimension,
            actual: bad.len(),
        });
    }
    Ok(vectors)
}
