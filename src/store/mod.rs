//! Persistent store for documents, chunks, symbols and embeddings
//!
//! The store is the source of truth; both search indexes are rebuilt from it.

mod memory;
mod sqlite;

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::config::Config;
use crate::error::Result;
use crate::model::{Chunk, Document, Embedding, Symbol};

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, DbPool};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chunk not found: {0}")]
    MissingChunk(String),

    #[error("Document not found: {0}")]
    MissingDocument(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Summary row for document listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentInfo {
    pub id: String,
    pub version: u32,
    pub source_uri: String,
    pub language: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub document_count: usize,
    pub chunk_count: usize,
    pub symbol_count: usize,
    pub embedding_count: usize,
}

/// CRUD over the data model.
///
/// Implementations cascade document deletion to the document's chunks,
/// symbols and embeddings, and reject embeddings for unknown chunks.
pub trait DocumentStore: Send + Sync {
    /// Insert or replace the stored document with the same id
    fn put_document(&self, document: &Document) -> StoreResult<()>;

    fn get_document(&self, id: &str) -> StoreResult<Option<Document>>;

    fn latest_version(&self, id: &str) -> StoreResult<Option<u32>>;

    fn list_documents(&self) -> StoreResult<Vec<DocumentInfo>>;

    /// Delete a document and everything derived from it; returns the ids of
    /// the removed chunks.
    fn delete_document(&self, id: &str) -> StoreResult<Vec<String>>;

    fn put_chunks(&self, chunks: &[Chunk], symbols: &[Symbol]) -> StoreResult<()>;

    /// Chunks in the order of `ids`; unknown ids are skipped
    fn get_chunks(&self, ids: &[String]) -> StoreResult<Vec<Chunk>>;

    fn chunks_for_document(&self, document_id: &str) -> StoreResult<Vec<Chunk>>;

    /// Every chunk, ordered by document id then ordinal
    fn all_chunks(&self) -> StoreResult<Vec<Chunk>>;

    fn symbols_for_document(&self, document_id: &str) -> StoreResult<Vec<Symbol>>;

    fn put_embedding(&self, embedding: &Embedding) -> StoreResult<()>;

    fn get_embedding(&self, chunk_id: &str, model: &str) -> StoreResult<Option<Embedding>>;

    /// Every embedding of `model`, ordered by chunk id
    fn embeddings_for_model(&self, model: &str) -> StoreResult<Vec<Embedding>>;

    fn stats(&self) -> StoreResult<StoreStats>;
}

/// Open the store selected by `storage.backend`
pub fn open_store(config: &Config) -> Result<Arc<dyn DocumentStore>> {
    match config.storage.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        _ => {
            let data_dir = config.resolved_data_dir()?;
            let store = SqliteStore::new(
                &data_dir.join("ragline.sqlite"),
                config.storage.compression_threshold,
            )?;
            Ok(Arc::new(store))
        }
    }
}
