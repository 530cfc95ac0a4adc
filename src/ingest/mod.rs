//! Document ingestion: chunk, embed, store and index.
//!
//! Each document runs through three phases (chunking, embedding and
//! indexing) and closes with an [`IngestSummary`]. Streams report progress
//! over a bounded channel so a slow consumer applies backpressure.

mod pipeline;
mod stats;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ValidationError;
use crate::model::{ChunkQuality, ChunkStrategy};
use crate::store::StoreError;

pub use pipeline::{IngestionPipeline, RebuildSummary};
pub use stats::{DeadLetter, IngestStats};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid document '{document_id}': {}", format_errors(.errors))]
    InvalidDocument {
        document_id: String,
        errors: Vec<ValidationError>,
    },

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    /// A store write kept failing after its retries
    #[error("Index write failed for {document_id}: {source}")]
    IndexWriteFailed {
        document_id: String,
        #[source]
        source: StoreError,
    },

    #[error("Index rebuild failed: {0}")]
    Rebuild(String),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestPhase {
    Chunking,
    Embedding,
    Indexing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    /// Every chunk embedded and indexed
    Complete,
    /// Some chunks failed to embed or a store write kept failing
    Partial,
    /// Stopped by cancellation; committed work is kept
    Cancelled,
}

/// Outcome of ingesting one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub document_id: String,
    pub version: u32,
    pub chunk_count: usize,
    /// Chunks whose embedding failed after all retries
    pub failed_chunk_ids: Vec<String>,
    /// Ids of every chunk produced for this version
    pub chunks: Vec<String>,
    pub status: IngestStatus,
    pub strategy: ChunkStrategy,
    pub quality: ChunkQuality,
    /// Chunks of the previous version that were removed
    pub superseded_chunks: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    pub took_ms: u64,
}

/// Progress reported while ingesting. Events of one document are strictly
/// ordered and end with either `Summary` or `Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngestEvent {
    Progress {
        document_id: String,
        chunks_processed: usize,
        total_chunks: usize,
        phase: IngestPhase,
    },
    Summary(IngestSummary),
    Failed { document_id: String, error: String },
}

impl IngestEvent {
    pub fn document_id(&self) -> &str {
        match self {
            Self::Progress { document_id, .. } | Self::Failed { document_id, .. } => document_id,
            Self::Summary(summary) => &summary.document_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Progress { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_event_shape() {
        let event = IngestEvent::Summary(IngestSummary {
            document_id: "doc".to_string(),
            version: 1,
            chunk_count: 3,
            failed_chunk_ids: vec!["doc@v1#1".to_string()],
            chunks: vec![],
            status: IngestStatus::Partial,
            strategy: ChunkStrategy::Ast,
            quality: ChunkQuality::Full,
            superseded_chunks: 0,
            errors: vec![],
            took_ms: 4,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "summary");
        assert_eq!(json["chunk_count"], 3);
        assert_eq!(json["failed_chunk_ids"][0], "doc@v1#1");
        assert_eq!(json["status"], "partial");
        assert!(event.is_terminal());

        let progress = IngestEvent::Progress {
            document_id: "doc".to_string(),
            chunks_processed: 1,
            total_chunks: 3,
            phase: IngestPhase::Embedding,
        };
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["phase"], "embedding");
        assert_eq!(progress.document_id(), "doc");
    }
}
