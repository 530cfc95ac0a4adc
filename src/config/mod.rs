//! Configuration management for ragline
//!
//! Loads TOML configuration, applies `RAGLINE_SECTION__KEY` environment
//! overrides and named profiles, validates every section, and shares the
//! result through a hot-reloadable [`ConfigHandle`].

use crate::error::{RaglineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

mod handle;
mod validator;

pub use handle::ConfigHandle;
pub use validator::ConfigValidator;

pub const SCHEMA_VERSION: &str = "1.0.0";
const ENV_PREFIX: &str = "RAGLINE_";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub keyword: KeywordConfig,
    pub search: SearchConfig,
    pub ingest: IngestConfig,
    pub evaluation: EvaluationConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// "sqlite" or "memory"
    pub backend: String,
    /// Raw document text at or above this many bytes is zstd-compressed
    pub compression_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target chunk size in lines
    pub chunk_size: usize,
    /// Units below this many lines are merged with their siblings
    pub min_chunk_lines: usize,
    /// Units above this many lines are split
    pub max_chunk_lines: usize,
    pub overlap_ratio: f32,
    /// Budget for the paragraph chunker used on plain text
    pub text_max_chars: usize,
}

/// A registered embedding model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    /// "fastembed", "http" or "hash"
    pub backend: String,
    pub dimension: usize,
    /// Base URL of the inference server (http backend)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Model name sent to the server when it differs from `id`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub default_model: String,
    pub max_batch_size: usize,
    pub max_concurrency: usize,
    pub requests_per_second: f64,
    pub burst: u32,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    /// Maximum number of cached vectors
    pub cache_capacity: usize,
    pub models: Vec<ModelConfig>,
}

impl EmbeddingConfig {
    pub fn model(&self, id: &str) -> Option<&ModelConfig> {
        self.models.iter().find(|m| m.id == id)
    }
}

/// HNSW vector index configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub hnsw_m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    /// Capacity hint for the graph
    pub max_elements: usize,
    pub max_layers: usize,
    /// Share of tombstoned slots that triggers a graph rebuild
    pub compaction_ratio: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordConfig {
    pub k1: f32,
    pub b: f32,
    pub stemming: bool,
    pub stop_words: bool,
    pub min_token_len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub semantic_weight: f32,
    pub rrf_k: f32,
    /// Each source is asked for `k * candidate_multiplier` candidates
    pub candidate_multiplier: usize,
    pub default_k: usize,
    pub source_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub max_concurrent_documents: usize,
    pub max_chunk_retries: u32,
    pub retry_backoff_ms: u64,
    pub store_retries: u32,
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub iterations: usize,
    /// Maximum labeled queries per run; 0 uses all of them
    pub sample_size: usize,
    pub k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_weight: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ef_search: Option<usize>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RaglineError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| RaglineError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(model) = overrides.embedding_model {
            self.embedding.default_model = model;
        }
        if let Some(weight) = overrides.semantic_weight {
            self.search.semantic_weight = weight;
        }
        if let Some(ef) = overrides.ef_search {
            self.index.ef_search = ef;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: RAGLINE_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::vars());
    }

    /// Apply `RAGLINE_`-prefixed overrides from any key/value source
    pub fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix(ENV_PREFIX) {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "STORAGE__BACKEND" => self.storage.backend = value.to_string(),
            "CHUNKING__CHUNK_SIZE" => self.chunking.chunk_size = parse_env(path, value)?,
            "CHUNKING__OVERLAP_RATIO" => self.chunking.overlap_ratio = parse_env(path, value)?,
            "EMBEDDING__DEFAULT_MODEL" => self.embedding.default_model = value.to_string(),
            "EMBEDDING__MAX_CONCURRENCY" => {
                self.embedding.max_concurrency = parse_env(path, value)?
            }
            "EMBEDDING__REQUESTS_PER_SECOND" => {
                self.embedding.requests_per_second = parse_env(path, value)?
            }
            "INDEX__EF_SEARCH" => self.index.ef_search = parse_env(path, value)?,
            "KEYWORD__K1" => self.keyword.k1 = parse_env(path, value)?,
            "KEYWORD__B" => self.keyword.b = parse_env(path, value)?,
            "SEARCH__SEMANTIC_WEIGHT" => self.search.semantic_weight = parse_env(path, value)?,
            "SEARCH__RRF_K" => self.search.rrf_k = parse_env(path, value)?,
            "EVALUATION__ITERATIONS" => self.evaluation.iterations = parse_env(path, value)?,
            "SERVER__BIND" => self.server.bind = value.to_string(),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| RaglineError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("ragline").join("config.toml"))
    }

    /// Data directory with a leading `~/` expanded
    pub fn resolved_data_dir(&self) -> Result<PathBuf> {
        expand_home(&self.storage.data_dir)
    }

    /// Configuration tuned for tests and offline use: in-memory storage and
    /// the hashing embedder only.
    pub fn offline() -> Self {
        let mut config = Self::default();
        config.storage.backend = "memory".to_string();
        config.embedding.default_model = "hash-384".to_string();
        config.embedding.models.retain(|m| m.backend == "hash");
        config
    }
}

fn parse_env<T: FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| RaglineError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Expand a leading `~/` against the home directory
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    let path_str = path
        .to_str()
        .ok_or_else(|| RaglineError::Config("Invalid path encoding".to_string()))?;

    if let Some(stripped) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| RaglineError::Config("Cannot determine home directory".to_string()))?;
        Ok(home.join(stripped))
    } else {
        Ok(path.to_path_buf())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            meta: MetaConfig {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from("~/.ragline"),
                backend: "sqlite".to_string(),
                compression_threshold: 1024,
            },
            chunking: ChunkingConfig {
                chunk_size: 50,
                min_chunk_lines: 5,
                max_chunk_lines: 150,
                overlap_ratio: 0.15,
                text_max_chars: 2000,
            },
            embedding: EmbeddingConfig {
                default_model: "all-MiniLM-L6-v2".to_string(),
                max_batch_size: 32,
                max_concurrency: 8,
                requests_per_second: 50.0,
                burst: 10,
                request_timeout_ms: 30_000,
                max_retries: 3,
                retry_base_ms: 200,
                failure_threshold: 5,
                cooldown_ms: 30_000,
                cache_capacity: 10_000,
                models: vec![
                    ModelConfig {
                        id: "all-MiniLM-L6-v2".to_string(),
                        backend: "fastembed".to_string(),
                        dimension: 384,
                        url: None,
                        remote_model: None,
                    },
                    ModelConfig {
                        id: "hash-384".to_string(),
                        backend: "hash".to_string(),
                        dimension: 384,
                        url: None,
                        remote_model: None,
                    },
                ],
            },
            index: IndexConfig {
                hnsw_m: 32,
                ef_construction: 400,
                ef_search: 64,
                max_elements: 100_000,
                max_layers: 16,
                compaction_ratio: 0.3,
            },
            keyword: KeywordConfig {
                k1: 1.5,
                b: 0.75,
                stemming: true,
                stop_words: true,
                min_token_len: 2,
            },
            search: SearchConfig {
                semantic_weight: 0.7,
                rrf_k: 60.0,
                candidate_multiplier: 4,
                default_k: 10,
                source_timeout_ms: 5_000,
            },
            ingest: IngestConfig {
                max_concurrent_documents: 4,
                max_chunk_retries: 2,
                retry_backoff_ms: 100,
                store_retries: 3,
                channel_capacity: 64,
            },
            evaluation: EvaluationConfig {
                iterations: 5,
                sample_size: 0,
                k: 5,
                log_file: None,
            },
            server: ServerConfig {
                bind: "127.0.0.1:7878".to_string(),
            },
            profiles: HashMap::new(),
        }
    }
}
