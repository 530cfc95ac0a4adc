//! Search indexes over chunks
//!
//! Both indexes are caches derived from the store and can be rebuilt from it
//! at any time.

mod keyword;
mod tokenizer;
mod vector;

use thiserror::Error;

pub use keyword::{KeywordIndex, KeywordIndexStats};
pub use tokenizer::CodeTokenizer;
pub use vector::{VectorIndex, VectorIndexStats};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Invalid vector for {0}: contains NaN or infinite values")]
    InvalidVector(String),

    #[error("Search failed: {0}")]
    Search(String),
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
