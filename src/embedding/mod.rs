//! Embedding generation
//!
//! Backends turn text into vectors; [`EmbeddingService`] wraps them with
//! batching, caching, rate limiting, retries and a circuit breaker per model.

mod backend;
mod cache;
mod circuit;
mod hash;
mod http;
mod provider;
mod rate_limit;
mod service;

use thiserror::Error;

pub use backend::{BackendRegistry, EmbeddingBackend};
pub use cache::EmbeddingCache;
pub use circuit::{BreakerState, CircuitBreaker};
pub use hash::HashEmbedder;
pub use http::HttpEmbedder;
pub use provider::FastEmbedBackend;
pub use rate_limit::TokenBucket;
pub use service::{EmbeddingService, EmbeddingStats, ModelStats};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Model initialization failed for {model}: {message}")]
    Initialization { model: String, message: String },

    #[error("Embedding generation failed: {0}")]
    Generation(String),

    /// Worth retrying: timeouts, throttling, connection and server errors
    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Unknown embedding model: {0}")]
    UnknownModel(String),

    #[error("Embedding model {model} unavailable: {reason}")]
    ModelUnavailable { model: String, reason: String },
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn unavailable(model: &str, reason: impl Into<String>) -> Self {
        Self::ModelUnavailable {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}

pub type EmbeddingResult<T> = std::result::Result<T, EmbeddingError>;

/// Scale `vector` to unit length in place; zero vectors are left alone
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
