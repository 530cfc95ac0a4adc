use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use ahash::AHashMap;

use super::{DocumentInfo, DocumentStore, StoreError, StoreResult, StoreStats};
use crate::model::{Chunk, Document, Embedding, Symbol};

#[derive(Default)]
struct MemoryState {
    documents: BTreeMap<String, Document>,
    /// document id -> chunk ids in ordinal order
    document_chunks: AHashMap<String, Vec<String>>,
    chunks: AHashMap<String, Chunk>,
    symbols: AHashMap<String, Vec<Symbol>>,
    /// (chunk id, model) -> embedding
    embeddings: BTreeMap<(String, String), Embedding>,
}

impl MemoryState {
    fn remove_chunk(&mut self, chunk_id: &str) {
        self.chunks.remove(chunk_id);
        let keys: Vec<_> = self
            .embeddings
            .range((chunk_id.to_string(), String::new())..)
            .take_while(|((id, _), _)| id == chunk_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.embeddings.remove(&key);
        }
    }
}

/// Volatile store used for tests, evaluation runs and `storage.backend = "memory"`
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for MemoryStore {
    fn put_document(&self, document: &Document) -> StoreResult<()> {
        self.write()
            .documents
            .insert(document.id.clone(), document.clone());
        Ok(())
    }

    fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.read().documents.get(id).cloned())
    }

    fn latest_version(&self, id: &str) -> StoreResult<Option<u32>> {
        Ok(self.read().documents.get(id).map(|d| d.version))
    }

    fn list_documents(&self) -> StoreResult<Vec<DocumentInfo>> {
        let state = self.read();
        Ok(state
            .documents
            .values()
            .map(|doc| DocumentInfo {
                id: doc.id.clone(),
                version: doc.version,
                source_uri: doc.source_uri.clone(),
                language: doc.resolved_language(),
                chunk_count: state.document_chunks.get(&doc.id).map_or(0, Vec::len),
            })
            .collect())
    }

    fn delete_document(&self, id: &str) -> StoreResult<Vec<String>> {
        let mut state = self.write();
        state.documents.remove(id);
        state.symbols.remove(id);
        let chunk_ids = state.document_chunks.remove(id).unwrap_or_default();
        for chunk_id in &chunk_ids {
            state.remove_chunk(chunk_id);
        }
        Ok(chunk_ids)
    }

    fn put_chunks(&self, chunks: &[Chunk], symbols: &[Symbol]) -> StoreResult<()> {
        let mut state = self.write();
        for chunk in chunks {
            if !state.documents.contains_key(&chunk.document_id) {
                return Err(StoreError::MissingDocument(chunk.document_id.clone()));
            }
        }
        for chunk in chunks {
            let ids = state
                .document_chunks
                .entry(chunk.document_id.clone())
                .or_default();
            if !ids.contains(&chunk.id) {
                ids.push(chunk.id.clone());
            }
            state.chunks.insert(chunk.id.clone(), chunk.clone());
        }
        for ids in state.document_chunks.values_mut() {
            ids.sort_by_key(|id| id.rsplit('#').next().and_then(|o| o.parse::<u32>().ok()));
        }
        for symbol in symbols {
            state
                .symbols
                .entry(symbol.document_id.clone())
                .or_default()
                .push(symbol.clone());
        }
        Ok(())
    }

    fn get_chunks(&self, ids: &[String]) -> StoreResult<Vec<Chunk>> {
        let state = self.read();
        Ok(ids.iter().filter_map(|id| state.chunks.get(id).cloned()).collect())
    }

    fn chunks_for_document(&self, document_id: &str) -> StoreResult<Vec<Chunk>> {
        let state = self.read();
        let mut chunks: Vec<Chunk> = state
            .document_chunks
            .get(document_id)
            .map(|ids| ids.iter().filter_map(|id| state.chunks.get(id).cloned()).collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.ordinal);
        Ok(chunks)
    }

    fn all_chunks(&self) -> StoreResult<Vec<Chunk>> {
        let state = self.read();
        let mut chunks: Vec<Chunk> = state.chunks.values().cloned().collect();
        chunks.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.ordinal.cmp(&b.ordinal))
        });
        Ok(chunks)
    }

    fn symbols_for_document(&self, document_id: &str) -> StoreResult<Vec<Symbol>> {
        Ok(self
            .read()
            .symbols
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    fn put_embedding(&self, embedding: &Embedding) -> StoreResult<()> {
        let mut state = self.write();
        if !state.chunks.contains_key(&embedding.chunk_id) {
            return Err(StoreError::MissingChunk(embedding.chunk_id.clone()));
        }
        state.embeddings.insert(
            (embedding.chunk_id.clone(), embedding.model.clone()),
            embedding.clone(),
        );
        Ok(())
    }

    fn get_embedding(&self, chunk_id: &str, model: &str) -> StoreResult<Option<Embedding>> {
        Ok(self
            .read()
            .embeddings
            .get(&(chunk_id.to_string(), model.to_string()))
            .cloned())
    }

    fn embeddings_for_model(&self, model: &str) -> StoreResult<Vec<Embedding>> {
        Ok(self
            .read()
            .embeddings
            .values()
            .filter(|e| e.model == model)
            .cloned()
            .collect())
    }

    fn stats(&self) -> StoreResult<StoreStats> {
        let state = self.read();
        Ok(StoreStats {
            document_count: state.documents.len(),
            chunk_count: state.chunks.len(),
            symbol_count: state.symbols.values().map(Vec::len).sum(),
            embedding_count: state.embeddings.len(),
        })
    }
}
