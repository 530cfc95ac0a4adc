use crate::config::{Config, SCHEMA_VERSION};
use crate::error::{RaglineError, Result, ValidationError};

const BACKENDS: [&str; 3] = ["fastembed", "http", "hash"];
const STORAGE_BACKENDS: [&str; 2] = ["sqlite", "memory"];

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration, collecting every problem found
    pub fn validate(config: &Config) -> Result<()> {
        let errors = Self::collect(config);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RaglineError::ConfigValidation { errors })
        }
    }

    pub fn collect(config: &Config) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_chunking(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_index(config, &mut errors);
        Self::validate_keyword(config, &mut errors);
        Self::validate_search(config, &mut errors);
        Self::validate_ingest(config, &mut errors);
        Self::validate_evaluation(config, &mut errors);

        errors
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != SCHEMA_VERSION {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        let backend = config.storage.backend.as_str();
        if !STORAGE_BACKENDS.contains(&backend) {
            errors.push(ValidationError::new(
                "storage.backend",
                format!("Backend must be one of {:?}, got '{}'", STORAGE_BACKENDS, backend),
            ));
        }
        if backend == "sqlite" && config.storage.data_dir.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.data_dir",
                "Data directory cannot be empty",
            ));
        }
    }

    fn validate_chunking(config: &Config, errors: &mut Vec<ValidationError>) {
        let chunking = &config.chunking;
        if chunking.chunk_size == 0 {
            errors.push(ValidationError::new(
                "chunking.chunk_size",
                "Chunk size must be greater than 0",
            ));
        }
        if chunking.max_chunk_lines < chunking.chunk_size {
            errors.push(ValidationError::new(
                "chunking.max_chunk_lines",
                format!(
                    "Max chunk lines ({}) must be at least chunk_size ({})",
                    chunking.max_chunk_lines, chunking.chunk_size
                ),
            ));
        }
        if chunking.min_chunk_lines > chunking.chunk_size {
            errors.push(ValidationError::new(
                "chunking.min_chunk_lines",
                "Min chunk lines cannot exceed chunk_size",
            ));
        }
        if !(0.0..0.5).contains(&chunking.overlap_ratio) {
            errors.push(ValidationError::new(
                "chunking.overlap_ratio",
                format!(
                    "Overlap ratio must be in [0.0, 0.5), got {}",
                    chunking.overlap_ratio
                ),
            ));
        }
        if chunking.text_max_chars < 64 {
            errors.push(ValidationError::new(
                "chunking.text_max_chars",
                "Text chunk budget must be at least 64 characters",
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let embedding = &config.embedding;

        if embedding.models.is_empty() {
            errors.push(ValidationError::new(
                "embedding.models",
                "At least one embedding model must be registered",
            ));
        }
        if embedding.model(&embedding.default_model).is_none() {
            errors.push(ValidationError::new(
                "embedding.default_model",
                format!(
                    "Default model '{}' is not registered",
                    embedding.default_model
                ),
            ));
        }

        for (i, model) in embedding.models.iter().enumerate() {
            let path = format!("embedding.models[{}]", i);
            if model.id.is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.id", path),
                    "Model id cannot be empty",
                ));
            }
            if !BACKENDS.contains(&model.backend.as_str()) {
                errors.push(ValidationError::new(
                    format!("{}.backend", path),
                    format!("Backend must be one of {:?}, got '{}'", BACKENDS, model.backend),
                ));
            }
            if model.dimension == 0 {
                errors.push(ValidationError::new(
                    format!("{}.dimension", path),
                    "Dimension must be greater than 0",
                ));
            }
            if model.backend == "http" && model.url.as_deref().unwrap_or("").is_empty() {
                errors.push(ValidationError::new(
                    format!("{}.url", path),
                    "HTTP backends need a url",
                ));
            }
            if embedding.models[..i].iter().any(|m| m.id == model.id) {
                errors.push(ValidationError::new(
                    format!("{}.id", path),
                    format!("Duplicate model id '{}'", model.id),
                ));
            }
        }

        if embedding.max_batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.max_batch_size",
                "Batch size must be greater than 0",
            ));
        }
        if embedding.max_concurrency == 0 {
            errors.push(ValidationError::new(
                "embedding.max_concurrency",
                "Concurrency must be greater than 0",
            ));
        }
        if !(embedding.requests_per_second.is_finite() && embedding.requests_per_second > 0.0) {
            errors.push(ValidationError::new(
                "embedding.requests_per_second",
                "Rate limit must be positive",
            ));
        }
        if embedding.burst == 0 {
            errors.push(ValidationError::new(
                "embedding.burst",
                "Burst must be greater than 0",
            ));
        }
        if embedding.request_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "embedding.request_timeout_ms",
                "Request timeout must be greater than 0",
            ));
        }
        if embedding.failure_threshold == 0 {
            errors.push(ValidationError::new(
                "embedding.failure_threshold",
                "Failure threshold must be greater than 0",
            ));
        }
        if embedding.cache_capacity == 0 {
            errors.push(ValidationError::new(
                "embedding.cache_capacity",
                "Cache capacity must be greater than 0",
            ));
        }
    }

    fn validate_index(config: &Config, errors: &mut Vec<ValidationError>) {
        let index = &config.index;
        if index.hnsw_m == 0 {
            errors.push(ValidationError::new(
                "index.hnsw_m",
                "HNSW M must be greater than 0",
            ));
        }
        if index.ef_construction == 0 {
            errors.push(ValidationError::new(
                "index.ef_construction",
                "HNSW ef_construction must be greater than 0",
            ));
        }
        if index.ef_search == 0 {
            errors.push(ValidationError::new(
                "index.ef_search",
                "HNSW ef_search must be greater than 0",
            ));
        }
        if index.max_layers == 0 || index.max_layers > 16 {
            errors.push(ValidationError::new(
                "index.max_layers",
                "HNSW max_layers must be within [1, 16]",
            ));
        }
        if !(0.0..=1.0).contains(&index.compaction_ratio) || index.compaction_ratio == 0.0 {
            errors.push(ValidationError::new(
                "index.compaction_ratio",
                "Compaction ratio must be within (0, 1]",
            ));
        }
    }

    fn validate_keyword(config: &Config, errors: &mut Vec<ValidationError>) {
        if !(config.keyword.k1.is_finite() && config.keyword.k1 >= 0.0) {
            errors.push(ValidationError::new(
                "keyword.k1",
                format!("k1 must be non-negative, got {}", config.keyword.k1),
            ));
        }
        if !(0.0..=1.0).contains(&config.keyword.b) {
            errors.push(ValidationError::new(
                "keyword.b",
                format!("b must be within [0, 1], got {}", config.keyword.b),
            ));
        }
    }

    fn validate_search(config: &Config, errors: &mut Vec<ValidationError>) {
        let search = &config.search;
        if !(0.0..=1.0).contains(&search.semantic_weight) {
            errors.push(ValidationError::new(
                "search.semantic_weight",
                format!(
                    "Semantic weight must be within [0, 1], got {}",
                    search.semantic_weight
                ),
            ));
        }
        if !(search.rrf_k.is_finite() && search.rrf_k > 0.0) {
            errors.push(ValidationError::new(
                "search.rrf_k",
                "RRF k must be greater than 0",
            ));
        }
        if search.candidate_multiplier < 1 {
            errors.push(ValidationError::new(
                "search.candidate_multiplier",
                "Candidate multiplier must be at least 1",
            ));
        }
        if search.source_timeout_ms == 0 {
            errors.push(ValidationError::new(
                "search.source_timeout_ms",
                "Source timeout must be greater than 0",
            ));
        }
    }

    fn validate_ingest(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.ingest.max_concurrent_documents == 0 {
            errors.push(ValidationError::new(
                "ingest.max_concurrent_documents",
                "Concurrency must be greater than 0",
            ));
        }
        if config.ingest.channel_capacity == 0 {
            errors.push(ValidationError::new(
                "ingest.channel_capacity",
                "Channel capacity must be greater than 0",
            ));
        }
    }

    fn validate_evaluation(config: &Config, errors: &mut Vec<ValidationError>) {
        if config.evaluation.iterations == 0 {
            errors.push(ValidationError::new(
                "evaluation.iterations",
                "Iterations must be greater than 0",
            ));
        }
        if config.evaluation.k == 0 {
            errors.push(ValidationError::new(
                "evaluation.k",
                "k must be greater than 0",
            ));
        }
    }
}
