//! Core data model: documents, chunks, symbols and embeddings
//!
//! Documents are the source of truth. Chunks, symbols and embeddings are
//! derived from them and owned by exactly one document; index entries are
//! caches rebuilt from these records.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chunking::detect_language;
use crate::error::ValidationError;

pub type ChunkId = String;

/// A source document submitted for ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    /// Assigned by the ingestion pipeline; re-ingestion bumps it
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub source_uri: String,
    /// Empty means "detect from `source_uri`"
    #[serde(default)]
    pub language: String,
    pub raw_text: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: impl Into<String>, source_uri: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            source_uri: source_uri.into(),
            language: String::new(),
            raw_text: raw_text.into(),
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Language used for chunking: the declared one, else detected from the
    /// source URI extension, else `"text"`.
    pub fn resolved_language(&self) -> String {
        let declared = self.language.trim();
        if !declared.is_empty() {
            return declared.to_ascii_lowercase();
        }
        detect_language(Path::new(&self.source_uri))
            .map(|lang| lang.id().to_string())
            .unwrap_or_else(|| "text".to_string())
    }

    /// Deterministic chunk id for this document version
    pub fn chunk_id(&self, ordinal: u32) -> ChunkId {
        format!("{}@v{}#{}", self.id, self.version, ordinal)
    }

    pub fn symbol_id(&self, ordinal: usize) -> String {
        format!("{}@v{}$s{}", self.id, self.version, ordinal)
    }

    /// Structural checks applied before ingestion
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push(ValidationError::new("document.id", "Document id cannot be empty"));
        }
        if self.raw_text.trim().is_empty() {
            errors.push(ValidationError::new(
                "document.raw_text",
                "Document text cannot be empty",
            ));
        }
        errors
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Function,
    Class,
    Block,
    Generic,
}

impl ChunkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Block => "block",
            Self::Generic => "generic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "block" => Some(Self::Block),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }
}

/// How a chunk boundary was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    Ast,
    Regex,
    Lines,
    Text,
}

impl ChunkStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ast => "ast",
            Self::Regex => "regex",
            Self::Lines => "lines",
            Self::Text => "text",
        }
    }
}

/// `Partial` marks fallback after a syntax error, `Degraded` a missing or
/// unsupported grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkQuality {
    Full,
    Partial,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub strategy: ChunkStrategy,
    pub quality: ChunkQuality,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 1-based, inclusive, of the chunk's own span
    pub start_line: usize,
    pub end_line: usize,
}

/// A contiguous slice of a document; the unit of embedding and retrieval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: String,
    pub ordinal: u32,
    /// Always `raw_text[start_offset..end_offset]`
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub symbol_refs: Vec<String>,
    pub kind: ChunkKind,
    /// Leading bytes of `text` copied from the previous chunk's tail
    pub overlap_with_prev: usize,
    pub metadata: ChunkMetadata,
}

impl Chunk {
    /// Start of the bytes this chunk owns, excluding the overlap prefix
    pub fn own_start(&self) -> usize {
        self.start_offset + self.overlap_with_prev
    }

    pub fn len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Function,
    Class,
    Import,
    Variable,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Import => "import",
            Self::Variable => "variable",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "function" => Some(Self::Function),
            "class" => Some(Self::Class),
            "import" => Some(Self::Import),
            "variable" => Some(Self::Variable),
            _ => None,
        }
    }
}

/// Byte range within a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

impl TextRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, offset: usize) -> bool {
        offset >= self.start && offset < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Symbol {
    pub id: String,
    pub document_id: String,
    pub kind: SymbolKind,
    pub name: String,
    pub range: TextRange,
}

/// One vector per (chunk, model)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub chunk_id: ChunkId,
    pub model: String,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

impl Embedding {
    pub fn new(chunk_id: impl Into<String>, model: impl Into<String>, vector: Vec<f32>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            model: model.into(),
            vector,
            created_at: Utc::now(),
        }
    }
}
