use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, OwnedMutexGuard};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::stats::StatsRecorder;
use super::{
    IngestError, IngestEvent, IngestPhase, IngestResult, IngestStats, IngestStatus, IngestSummary,
};
use crate::chunking::ChunkerRegistry;
use crate::config::{Config, ConfigHandle};
use crate::embedding::{EmbeddingError, EmbeddingService};
use crate::index::{KeywordIndex, VectorIndex};
use crate::model::{Chunk, Document, Embedding};
use crate::store::{DocumentStore, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildSummary {
    pub chunks: usize,
    pub vectors: usize,
    pub took_ms: u64,
}

/// Drives documents through chunking, embedding, storage and indexing.
///
/// The store is written first; indexes follow. A chunk whose embedding
/// keeps failing is reported in the summary while its siblings are still
/// indexed. Ingests of the same document id run one at a time so each
/// gets its own version.
pub struct IngestionPipeline {
    store: Arc<dyn DocumentStore>,
    embeddings: Arc<EmbeddingService>,
    vectors: Arc<VectorIndex>,
    keywords: Arc<KeywordIndex>,
    chunkers: Arc<ChunkerRegistry>,
    config: ConfigHandle,
    model: String,
    paused: watch::Sender<bool>,
    document_locks: Mutex<AHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    stats: StatsRecorder,
}

/// `base * 2^attempt`
fn backoff(base_ms: u64, attempt: u32) -> Duration {
    Duration::from_millis(base_ms.saturating_mul(1u64 << attempt.min(16)))
}

async fn emit(events: Option<&mpsc::Sender<IngestEvent>>, event: IngestEvent) {
    if let Some(tx) = events {
        // A consumer that went away does not stop ingestion
        let _ = tx.send(event).await;
    }
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        embeddings: Arc<EmbeddingService>,
        vectors: Arc<VectorIndex>,
        keywords: Arc<KeywordIndex>,
        chunkers: Arc<ChunkerRegistry>,
        config: ConfigHandle,
        model: impl Into<String>,
    ) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            store,
            embeddings,
            vectors,
            keywords,
            chunkers,
            config,
            model: model.into(),
            paused,
            document_locks: Mutex::new(AHashMap::new()),
            stats: StatsRecorder::default(),
        }
    }

    /// Embedding model whose vectors this pipeline indexes
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Ingest one document, superseding any stored version with the same id
    pub async fn ingest(&self, document: Document) -> IngestResult<IngestSummary> {
        self.process(document, &CancellationToken::new(), None).await
    }

    /// Ingest `documents` in the background and report progress as a
    /// stream.
    ///
    /// Up to `ingest.max_concurrent_documents` documents run at once, so
    /// events of different documents may interleave; events of one document
    /// stay ordered and end with a `Summary` or `Failed` event. The channel
    /// is bounded by `ingest.channel_capacity`.
    pub fn ingest_stream(
        self: &Arc<Self>,
        documents: Vec<Document>,
        cancel: CancellationToken,
    ) -> ReceiverStream<IngestEvent> {
        let config = self.config.current();
        let (tx, rx) = mpsc::channel(config.ingest.channel_capacity.max(1));
        let concurrency = config.ingest.max_concurrent_documents.max(1);
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            futures::stream::iter(documents)
                .for_each_concurrent(concurrency, |document| {
                    let pipeline = Arc::clone(&pipeline);
                    let tx = tx.clone();
                    let cancel = cancel.clone();
                    async move {
                        let document_id = document.id.clone();
                        if !pipeline.wait_until_resumed(&cancel).await {
                            emit(
                                Some(&tx),
                                IngestEvent::Failed {
                                    document_id,
                                    error: "ingestion cancelled before start".to_string(),
                                },
                            )
                            .await;
                            return;
                        }
                        let event = match pipeline.process(document, &cancel, Some(&tx)).await {
                            Ok(summary) => IngestEvent::Summary(summary),
                            Err(e) => IngestEvent::Failed {
                                document_id,
                                error: e.to_string(),
                            },
                        };
                        emit(Some(&tx), event).await;
                    }
                })
                .await;
        });

        ReceiverStream::new(rx)
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
        info!("Ingestion paused");
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        info!("Ingestion resumed");
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait while paused. Returns false if cancelled first.
    async fn wait_until_resumed(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let mut paused = self.paused.subscribe();
        tokio::select! {
            result = paused.wait_for(|paused| !*paused) => result.is_ok(),
            () = cancel.cancelled() => false,
        }
    }

    /// Hold the per-document lock; idle entries are pruned on the way in
    async fn lock_document(&self, document_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .document_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(document_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Run a store operation, retrying failures with exponential backoff
    async fn store_op<T>(
        &self,
        config: &Config,
        what: &str,
        op: impl Fn() -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < config.ingest.store_retries => {
                    warn!("{} failed (attempt {}): {}", what, attempt + 1, e);
                    tokio::time::sleep(backoff(config.ingest.retry_backoff_ms, attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn process(
        &self,
        mut document: Document,
        cancel: &CancellationToken,
        events: Option<&mpsc::Sender<IngestEvent>>,
    ) -> IngestResult<IngestSummary> {
        let started = Instant::now();
        let config = self.config.current();

        let errors = document.validate();
        if !errors.is_empty() {
            let err = IngestError::InvalidDocument {
                document_id: document.id.clone(),
                errors,
            };
            warn!("Rejected document: {}", err);
            self.stats.dead_letter(&document.id, err.to_string());
            return Err(err);
        }
        if document.language.trim().is_empty() {
            document.language = document.resolved_language();
        }
        let document_id = document.id.clone();
        let _guard = self.lock_document(&document_id).await;
        let write_failed = |source| IngestError::IndexWriteFailed {
            document_id: document_id.clone(),
            source,
        };

        let previous = self
            .store_op(&config, "Reading document version", || {
                self.store.latest_version(&document_id)
            })
            .await
            .map_err(write_failed)?;
        document.version = previous.map_or(1, |v| v + 1);
        let superseded = match previous {
            Some(_) => self
                .store_op(&config, "Removing previous version", || {
                    self.store.delete_document(&document_id)
                })
                .await
                .map_err(write_failed)?,
            None => Vec::new(),
        };
        if !superseded.is_empty() {
            self.vectors.delete_many(&superseded);
            self.keywords.delete_many(&superseded);
        }
        self.store_op(&config, "Storing document", || {
            self.store.put_document(&document)
        })
        .await
        .map_err(write_failed)?;

        // Chunking
        let outcome = self.chunkers.chunk(&document, &config.chunking);
        let total = outcome.chunks.len();
        let progress = |processed: usize, phase: IngestPhase| IngestEvent::Progress {
            document_id: document_id.clone(),
            chunks_processed: processed,
            total_chunks: total,
            phase,
        };
        emit(events, progress(0, IngestPhase::Chunking)).await;

        let mut summary = IngestSummary {
            document_id: document_id.clone(),
            version: document.version,
            chunk_count: total,
            failed_chunk_ids: Vec::new(),
            chunks: outcome.chunks.iter().map(|c| c.id.clone()).collect(),
            status: IngestStatus::Complete,
            strategy: outcome.strategy,
            quality: outcome.quality,
            superseded_chunks: superseded.len(),
            errors: Vec::new(),
            took_ms: 0,
        };

        if let Err(e) = self
            .store_op(&config, "Storing chunks", || {
                self.store.put_chunks(&outcome.chunks, &outcome.symbols)
            })
            .await
        {
            warn!("Chunks of {} could not be stored: {}", document_id, e);
            summary.errors.push(format!("storing chunks: {}", e));
            summary.failed_chunk_ids = summary.chunks.clone();
            summary.status = IngestStatus::Partial;
            return Ok(self.finish(summary, started));
        }
        emit(events, progress(total, IngestPhase::Chunking)).await;

        // Embedding
        let (embedded, failed, cancelled) = self
            .embed_chunks(&config, &outcome.chunks, cancel, |processed| {
                emit(events, progress(processed, IngestPhase::Embedding))
            })
            .await;
        for (index, error) in &failed {
            let chunk = &outcome.chunks[*index];
            warn!("Chunk {} could not be embedded: {}", chunk.id, error);
            summary.failed_chunk_ids.push(chunk.id.clone());
            summary.errors.push(format!("{}: {}", chunk.id, error));
        }

        // Indexing
        let keyword_items: Vec<(String, String)> = outcome
            .chunks
            .iter()
            .map(|c| (c.id.clone(), c.text.clone()))
            .collect();
        self.keywords.index_batch(&keyword_items);

        let batch_size = config.embedding.max_batch_size.max(1);
        // Vectors embedded before a cancellation are still committed
        let mut indexed = 0;
        for (index, vector) in embedded {
            let chunk = &outcome.chunks[index];
            if let Err(e) = self.vectors.validate(&chunk.id, &vector) {
                warn!("Chunk {} has an unusable embedding: {}", chunk.id, e);
                summary.failed_chunk_ids.push(chunk.id.clone());
                summary.errors.push(format!("{}: {}", chunk.id, e));
                continue;
            }
            let embedding = Embedding::new(&chunk.id, &self.model, vector);
            if let Err(e) = self
                .store_op(&config, "Storing embedding", || {
                    self.store.put_embedding(&embedding)
                })
                .await
            {
                warn!("Embedding of {} could not be stored: {}", chunk.id, e);
                summary.failed_chunk_ids.push(chunk.id.clone());
                summary.errors.push(format!("{}: {}", chunk.id, e));
                continue;
            }
            if let Err(e) = self.vectors.upsert(&chunk.id, &embedding.vector) {
                summary.failed_chunk_ids.push(chunk.id.clone());
                summary.errors.push(format!("{}: {}", chunk.id, e));
                continue;
            }
            indexed += 1;
            if indexed % batch_size == 0 {
                emit(events, progress(indexed, IngestPhase::Indexing)).await;
            }
        }
        emit(events, progress(indexed, IngestPhase::Indexing)).await;

        summary.status = if cancelled {
            IngestStatus::Cancelled
        } else if !summary.failed_chunk_ids.is_empty() {
            IngestStatus::Partial
        } else {
            IngestStatus::Complete
        };
        Ok(self.finish(summary, started))
    }

    /// Embed every chunk, retrying failed ones up to
    /// `ingest.max_chunk_retries` times. Returns the vectors by chunk index,
    /// the chunks that still failed and whether cancellation stopped work.
    async fn embed_chunks<F, Fut>(
        &self,
        config: &Config,
        chunks: &[Chunk],
        cancel: &CancellationToken,
        on_progress: F,
    ) -> (Vec<(usize, Vec<f32>)>, Vec<(usize, EmbeddingError)>, bool)
    where
        F: Fn(usize) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let batch_size = config.embedding.max_batch_size.max(1);
        let mut embedded = Vec::with_capacity(chunks.len());
        let mut failed = Vec::new();
        let mut processed = 0;

        for (batch_no, batch) in chunks.chunks(batch_size).enumerate() {
            if !self.wait_until_resumed(cancel).await {
                return (embedded, failed, true);
            }
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let results = self.embeddings.embed_each(&texts, Some(&self.model)).await;
            for (offset, result) in results.into_iter().enumerate() {
                let index = batch_no * batch_size + offset;
                match result {
                    Ok(vector) => embedded.push((index, vector)),
                    Err(e) => {
                        debug!("Embedding failed for {}: {}", chunks[index].id, e);
                        failed.push((index, e));
                    }
                }
            }
            processed += batch.len();
            on_progress(processed).await;
        }

        let retries = config.ingest.max_chunk_retries;
        let mut attempt = 0;
        while !failed.is_empty() && attempt < retries {
            tokio::select! {
                () = tokio::time::sleep(backoff(config.ingest.retry_backoff_ms, attempt)) => {}
                () = cancel.cancelled() => return (embedded, failed, true),
            }
            attempt += 1;

            let pending = std::mem::take(&mut failed);
            let texts: Vec<String> = pending
                .iter()
                .map(|(index, _)| chunks[*index].text.clone())
                .collect();
            let results = self.embeddings.embed_each(&texts, Some(&self.model)).await;
            for ((index, _), result) in pending.into_iter().zip(results) {
                match result {
                    Ok(vector) => embedded.push((index, vector)),
                    Err(e) => failed.push((index, e)),
                }
            }
            debug!(
                "Embedding retry {} of {}: {} chunks still failing",
                attempt,
                retries,
                failed.len()
            );
        }

        embedded.sort_by_key(|(index, _)| *index);
        failed.sort_by_key(|(index, _)| *index);
        (embedded, failed, false)
    }

    fn finish(&self, mut summary: IngestSummary, started: Instant) -> IngestSummary {
        summary.took_ms = started.elapsed().as_millis() as u64;
        self.stats.record(&summary);
        info!(
            "Ingested {} v{}: {} chunks, {} failed, {:?} in {} ms",
            summary.document_id,
            summary.version,
            summary.chunk_count,
            summary.failed_chunk_ids.len(),
            summary.status,
            summary.took_ms
        );
        summary
    }

    /// Delete a document with its chunks, symbols, embeddings and index
    /// entries. Returns the number of removed chunks.
    pub fn remove(&self, document_id: &str) -> IngestResult<usize> {
        let write_failed = |source| IngestError::IndexWriteFailed {
            document_id: document_id.to_string(),
            source,
        };
        if self
            .store
            .get_document(document_id)
            .map_err(write_failed)?
            .is_none()
        {
            return Err(IngestError::DocumentNotFound(document_id.to_string()));
        }

        let removed = self.store.delete_document(document_id).map_err(write_failed)?;
        self.vectors.delete_many(&removed);
        self.keywords.delete_many(&removed);
        info!("Removed document {} ({} chunks)", document_id, removed.len());
        Ok(removed.len())
    }

    /// Replay the store into both indexes
    pub fn rebuild_indexes(&self) -> IngestResult<RebuildSummary> {
        let started = Instant::now();
        let rebuild_failed = |e: &dyn std::fmt::Display| IngestError::Rebuild(e.to_string());

        let chunks = self.store.all_chunks().map_err(|e| rebuild_failed(&e))?;
        let items: Vec<(String, String)> = chunks
            .into_iter()
            .map(|chunk| (chunk.id, chunk.text))
            .collect();
        self.keywords.rebuild(&items);

        let live: HashSet<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
        let entries: Vec<(String, Vec<f32>)> = self
            .store
            .embeddings_for_model(&self.model)
            .map_err(|e| rebuild_failed(&e))?
            .into_iter()
            .filter(|embedding| live.contains(embedding.chunk_id.as_str()))
            .map(|embedding| (embedding.chunk_id, embedding.vector))
            .collect();
        let vectors = entries.len();
        self.vectors
            .rebuild(entries)
            .map_err(|e| rebuild_failed(&e))?;

        let summary = RebuildSummary {
            chunks: items.len(),
            vectors,
            took_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "Indexes rebuilt: {} chunks, {} vectors in {} ms",
            summary.chunks, summary.vectors, summary.took_ms
        );
        Ok(summary)
    }

    pub fn stats(&self) -> IngestStats {
        self.stats.snapshot(self.is_paused())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::model::Symbol;
    use crate::store::{DocumentInfo, MemoryStore, StoreError, StoreStats};

    const SOURCE: &str = "import os\n\n\
def load_config(path):\n    with open(path) as handle:\n        data = handle.read()\n    return parse(data)\n\n\n\
def save_config(path, data):\n    with open(path, 'w') as handle:\n        handle.write(data)\n    return True\n";

    /// Memory store with injectable write failures and a slow version read
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_chunks: bool,
        fail_embedding_for: Option<String>,
        version_delay: Duration,
        chunk_writes: AtomicUsize,
    }

    impl DocumentStore for FlakyStore {
        fn put_document(&self, document: &Document) -> StoreResult<()> {
            self.inner.put_document(document)
        }

        fn get_document(&self, id: &str) -> StoreResult<Option<Document>> {
            self.inner.get_document(id)
        }

        fn latest_version(&self, id: &str) -> StoreResult<Option<u32>> {
            let version = self.inner.latest_version(id);
            std::thread::sleep(self.version_delay);
            version
        }

        fn list_documents(&self) -> StoreResult<Vec<DocumentInfo>> {
            self.inner.list_documents()
        }

        fn delete_document(&self, id: &str) -> StoreResult<Vec<String>> {
            self.inner.delete_document(id)
        }

        fn put_chunks(&self, chunks: &[Chunk], symbols: &[Symbol]) -> StoreResult<()> {
            self.chunk_writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_chunks {
                return Err(StoreError::Corrupt("disk full".to_string()));
            }
            self.inner.put_chunks(chunks, symbols)
        }

        fn get_chunks(&self, ids: &[String]) -> StoreResult<Vec<Chunk>> {
            self.inner.get_chunks(ids)
        }

        fn chunks_for_document(&self, document_id: &str) -> StoreResult<Vec<Chunk>> {
            self.inner.chunks_for_document(document_id)
        }

        fn all_chunks(&self) -> StoreResult<Vec<Chunk>> {
            self.inner.all_chunks()
        }

        fn symbols_for_document(&self, document_id: &str) -> StoreResult<Vec<Symbol>> {
            self.inner.symbols_for_document(document_id)
        }

        fn put_embedding(&self, embedding: &Embedding) -> StoreResult<()> {
            if self.fail_embedding_for.as_deref() == Some(embedding.chunk_id.as_str()) {
                return Err(StoreError::Corrupt("disk full".to_string()));
            }
            self.inner.put_embedding(embedding)
        }

        fn get_embedding(&self, chunk_id: &str, model: &str) -> StoreResult<Option<Embedding>> {
            self.inner.get_embedding(chunk_id, model)
        }

        fn embeddings_for_model(&self, model: &str) -> StoreResult<Vec<Embedding>> {
            self.inner.embeddings_for_model(model)
        }

        fn stats(&self) -> StoreResult<StoreStats> {
            self.inner.stats()
        }
    }

    fn pipeline() -> (Arc<IngestionPipeline>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (pipeline_over(store.clone()), store)
    }

    fn pipeline_over(store: Arc<dyn DocumentStore>) -> Arc<IngestionPipeline> {
        let mut config = Config::offline();
        config.ingest.retry_backoff_ms = 1;
        config.embedding.requests_per_second = 0.0;
        let embeddings = Arc::new(EmbeddingService::from_config(&config.embedding).unwrap());
        let model = embeddings.default_model();
        let pipeline = IngestionPipeline::new(
            store,
            embeddings,
            Arc::new(VectorIndex::new(384, &config.index)),
            Arc::new(KeywordIndex::new(&config.keyword)),
            Arc::new(ChunkerRegistry::new().unwrap()),
            ConfigHandle::new(config),
            model,
        );
        Arc::new(pipeline)
    }

    #[tokio::test]
    async fn test_ingest_stores_and_indexes() {
        let (pipeline, store) = pipeline();
        let summary = pipeline
            .ingest(Document::new("cfg", "src/cfg.py", SOURCE))
            .await
            .unwrap();

        assert_eq!(summary.version, 1);
        assert_eq!(summary.status, IngestStatus::Complete);
        assert!(summary.chunk_count >= 1);
        assert!(summary.failed_chunk_ids.is_empty());

        let chunks = store.chunks_for_document("cfg").unwrap();
        assert_eq!(chunks.len(), summary.chunk_count);
        for chunk in &chunks {
            assert!(pipeline.vectors.contains(&chunk.id));
            assert!(pipeline.keywords.contains(&chunk.id));
            assert!(store.get_embedding(&chunk.id, pipeline.model()).unwrap().is_some());
        }
        assert_eq!(store.get_document("cfg").unwrap().unwrap().language, "python");
    }

    #[tokio::test]
    async fn test_reingest_supersedes_previous_version() {
        let (pipeline, store) = pipeline();
        let first = pipeline
            .ingest(Document::new("cfg", "cfg.py", SOURCE))
            .await
            .unwrap();
        let second = pipeline
            .ingest(Document::new("cfg", "cfg.py", "def tiny():\n    return 1\n"))
            .await
            .unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(second.superseded_chunks, first.chunk_count);
        for old in &first.chunks {
            assert!(!pipeline.vectors.contains(old));
            assert!(!pipeline.keywords.contains(old));
        }
        let stored = store.chunks_for_document("cfg").unwrap();
        assert!(stored.iter().all(|c| c.id.starts_with("cfg@v2#")));
    }

    #[tokio::test]
    async fn test_invalid_document_is_dead_lettered() {
        let (pipeline, _) = pipeline();
        let err = pipeline
            .ingest(Document::new("blank", "blank.txt", "  \n "))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidDocument { .. }));
        assert_eq!(pipeline.stats().dead_letters, 1);
        assert_eq!(pipeline.stats().documents_processed, 0);
    }

    #[tokio::test]
    async fn test_remove_and_rebuild() {
        let (pipeline, _) = pipeline();
        pipeline
            .ingest(Document::new("a", "a.py", SOURCE))
            .await
            .unwrap();
        let b = pipeline
            .ingest(Document::new("b", "b.md", "Notes about the release.\n\nMore notes."))
            .await
            .unwrap();

        let rebuilt = pipeline.rebuild_indexes().unwrap();
        assert_eq!(rebuilt.chunks, pipeline.keywords.len());
        assert_eq!(rebuilt.vectors, pipeline.vectors.len());

        assert_eq!(pipeline.remove("b").unwrap(), b.chunk_count);
        assert!(b.chunks.iter().all(|id| !pipeline.keywords.contains(id)));
        assert!(matches!(
            pipeline.remove("b"),
            Err(IngestError::DocumentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_ends_each_document_with_summary() {
        let (pipeline, _) = pipeline();
        let documents = vec![
            Document::new("one", "one.py", SOURCE),
            Document::new("two", "two.txt", "First paragraph.\n\nSecond paragraph."),
            Document::new("", "bad.txt", "no id"),
        ];
        let events: Vec<IngestEvent> = pipeline
            .ingest_stream(documents, CancellationToken::new())
            .collect()
            .await;

        for id in ["one", "two"] {
            let own: Vec<&IngestEvent> = events.iter().filter(|e| e.document_id() == id).collect();
            assert!(matches!(own.last(), Some(IngestEvent::Summary(_))));
            assert!(matches!(
                own.first(),
                Some(IngestEvent::Progress {
                    phase: IngestPhase::Chunking,
                    ..
                })
            ));
            assert_eq!(own.iter().filter(|e| e.is_terminal()).count(), 1);
        }
        assert!(events
            .iter()
            .any(|e| matches!(e, IngestEvent::Failed { document_id, .. } if document_id.is_empty())));
    }

    #[tokio::test]
    async fn test_pause_holds_stream_until_resume() {
        let (pipeline, _) = pipeline();
        pipeline.pause();
        let mut stream = pipeline.ingest_stream(
            vec![Document::new("one", "one.py", SOURCE)],
            CancellationToken::new(),
        );

        let early = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(early.is_err());
        assert!(pipeline.stats().paused);

        pipeline.resume();
        let events: Vec<IngestEvent> = stream.collect().await;
        assert!(matches!(events.last(), Some(IngestEvent::Summary(_))));
    }

    #[tokio::test]
    async fn test_cancelled_stream_reports_unstarted_documents() {
        let (pipeline, store) = pipeline();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let events: Vec<IngestEvent> = pipeline
            .ingest_stream(vec![Document::new("one", "one.py", SOURCE)], cancel)
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], IngestEvent::Failed { .. }));
        assert!(store.get_document("one").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unstorable_embedding_is_reported_per_chunk() {
        let store = Arc::new(FlakyStore {
            fail_embedding_for: Some("cfg@v1#0".to_string()),
            ..FlakyStore::default()
        });
        let pipeline = pipeline_over(store.clone());

        let summary = pipeline
            .ingest(Document::new("cfg", "cfg.py", SOURCE))
            .await
            .unwrap();
        assert_eq!(summary.status, IngestStatus::Partial);
        assert_eq!(summary.failed_chunk_ids, vec!["cfg@v1#0".to_string()]);
        assert!(summary.errors[0].starts_with("cfg@v1#0: "));
        assert!(!pipeline.vectors.contains("cfg@v1#0"));
        assert!(pipeline.keywords.contains("cfg@v1#0"));
        for id in &summary.chunks[1..] {
            assert!(pipeline.vectors.contains(id));
        }
    }

    #[tokio::test]
    async fn test_persistent_chunk_write_failure_marks_every_chunk() {
        let store = Arc::new(FlakyStore {
            fail_chunks: true,
            ..FlakyStore::default()
        });
        let pipeline = pipeline_over(store.clone());

        let summary = pipeline
            .ingest(Document::new("cfg", "cfg.py", SOURCE))
            .await
            .unwrap();
        let retries = Config::offline().ingest.store_retries as usize;
        assert_eq!(store.chunk_writes.load(Ordering::SeqCst), retries + 1);
        assert_eq!(summary.status, IngestStatus::Partial);
        assert!(!summary.chunks.is_empty());
        assert_eq!(summary.failed_chunk_ids, summary.chunks);
        assert!(summary.errors[0].contains("disk full"));
        assert!(pipeline.vectors.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_reingest_allocates_distinct_versions() {
        let store = Arc::new(FlakyStore {
            version_delay: Duration::from_millis(50),
            ..FlakyStore::default()
        });
        let pipeline = pipeline_over(store.clone());
        pipeline
            .ingest(Document::new("d", "d.py", "def original():\n    return 0\n"))
            .await
            .unwrap();

        let first = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                pipeline
                    .ingest(Document::new("d", "d.py", "def alpha():\n    return 1\n"))
                    .await
            }
        });
        let second = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move {
                pipeline
                    .ingest(Document::new("d", "d.py", "def beta():\n    return 2\n"))
                    .await
            }
        });
        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();

        let mut versions = vec![a.version, b.version];
        versions.sort_unstable();
        assert_eq!(versions, vec![2, 3]);

        let latest = if a.version == 3 { &a } else { &b };
        let stored = store.chunks_for_document("d").unwrap();
        let stored_ids: Vec<String> = stored.iter().map(|c| c.id.clone()).collect();
        assert_eq!(stored_ids, latest.chunks);
        assert_eq!(pipeline.keywords.len(), stored.len());
        assert_eq!(pipeline.vectors.len(), stored.len());
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff(100, 0), Duration::from_millis(100));
        assert_eq!(backoff(100, 3), Duration::from_millis(800));
    }
}
