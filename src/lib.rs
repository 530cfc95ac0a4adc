//! Ragline - hybrid retrieval over source code and text
//!
//! Documents are split along their syntax into chunks, embedded, and indexed
//! twice: in an HNSW graph for nearest-neighbour search and in a BM25 index
//! for exact terms. Queries run against both and the rankings are merged
//! with weighted reciprocal rank fusion.

pub mod chunking;
pub mod cli;
pub mod collection;
pub mod config;
pub mod embedding;
pub mod error;
pub mod evaluation;
pub mod index;
pub mod ingest;
pub mod model;
pub mod retrieval;
pub mod server;
pub mod store;

pub use collection::{Collection, CollectionStats};
pub use config::{Config, ConfigHandle};
pub use error::{RaglineError, Result};
