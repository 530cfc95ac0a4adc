//! Document chunking
//!
//! Code is split along syntax-tree definitions, prose along paragraphs.
//! Anything the syntax-aware path cannot handle goes through regex or
//! line-window fallback, so chunking never fails: problems show up as the
//! `quality` recorded on each chunk.

mod assemble;
mod ast;
mod fallback;
mod languages;
mod text;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::ChunkingConfig;
use crate::error::Result;
use crate::model::{Chunk, ChunkQuality, ChunkStrategy, Document, Symbol};

pub use ast::AstChunker;
pub use fallback::FallbackChunker;
pub use languages::{detect_language, Lang};
pub use text::TextChunker;

/// Result of chunking one document
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOutcome {
    pub chunks: Vec<Chunk>,
    pub symbols: Vec<Symbol>,
    pub strategy: ChunkStrategy,
    pub quality: ChunkQuality,
}

pub trait Chunker: Send + Sync {
    fn language(&self) -> Lang;

    /// Split `document` into chunks that tile its text
    fn chunk(&self, document: &Document, config: &ChunkingConfig) -> ChunkOutcome;
}

#[derive(Debug, Default)]
struct StrategyCounters {
    ast: AtomicU64,
    regex: AtomicU64,
    lines: AtomicU64,
    text: AtomicU64,
    partial: AtomicU64,
    degraded: AtomicU64,
}

impl StrategyCounters {
    fn record(&self, outcome: &ChunkOutcome) {
        let counter = match outcome.strategy {
            ChunkStrategy::Ast => &self.ast,
            ChunkStrategy::Regex => &self.regex,
            ChunkStrategy::Lines => &self.lines,
            ChunkStrategy::Text => &self.text,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        match outcome.quality {
            ChunkQuality::Full => {}
            ChunkQuality::Partial => {
                self.partial.fetch_add(1, Ordering::Relaxed);
            }
            ChunkQuality::Degraded => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Documents chunked per strategy since the registry was built
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChunkerStats {
    pub supported_languages: Vec<String>,
    pub ast_documents: u64,
    pub regex_documents: u64,
    pub line_documents: u64,
    pub text_documents: u64,
    pub partial_documents: u64,
    pub degraded_documents: u64,
}

/// Maps languages to chunkers; unknown languages use line-window fallback
pub struct ChunkerRegistry {
    chunkers: HashMap<Lang, Arc<dyn Chunker>>,
    fallback: Arc<FallbackChunker>,
    counters: StrategyCounters,
}

impl ChunkerRegistry {
    /// Registry with an AST chunker per code language and the paragraph
    /// chunker for text
    pub fn new() -> Result<Self> {
        let fallback = Arc::new(FallbackChunker::new()?);
        let mut registry = Self {
            chunkers: HashMap::new(),
            fallback: Arc::clone(&fallback),
            counters: StrategyCounters::default(),
        };
        for lang in Lang::CODE {
            registry.register(Arc::new(AstChunker::new(lang, Arc::clone(&fallback))));
        }
        registry.register(Arc::new(TextChunker::new()?));
        Ok(registry)
    }

    /// Replace the chunker for its language
    pub fn register(&mut self, chunker: Arc<dyn Chunker>) {
        self.chunkers.insert(chunker.language(), chunker);
    }

    pub fn chunk(&self, document: &Document, config: &ChunkingConfig) -> ChunkOutcome {
        let language = document.resolved_language();
        let outcome = match Lang::from_name(&language).and_then(|l| self.chunkers.get(&l)) {
            Some(chunker) => chunker.chunk(document, config),
            None => self.fallback.chunk_unknown(document, &language, config),
        };
        debug!(
            "Chunked {} ({}) into {} chunks via {} ({:?})",
            document.id,
            language,
            outcome.chunks.len(),
            outcome.strategy.as_str(),
            outcome.quality
        );
        self.counters.record(&outcome);
        outcome
    }

    pub fn supported_languages(&self) -> Vec<Lang> {
        let mut langs: Vec<Lang> = self.chunkers.keys().copied().collect();
        langs.sort();
        langs
    }

    pub fn stats(&self) -> ChunkerStats {
        let c = &self.counters;
        ChunkerStats {
            supported_languages: self
                .supported_languages()
                .into_iter()
                .map(|l| l.id().to_string())
                .collect(),
            ast_documents: c.ast.load(Ordering::Relaxed),
            regex_documents: c.regex.load(Ordering::Relaxed),
            line_documents: c.lines.load(Ordering::Relaxed),
            text_documents: c.text.load(Ordering::Relaxed),
            partial_documents: c.partial.load(Ordering::Relaxed),
            degraded_documents: c.degraded.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_registry_routes_by_language() {
        let registry = ChunkerRegistry::new().unwrap();
        let cfg = Config::default().chunking;

        let code = Document::new("a", "a.py", "def f():\n    return 1\n");
        assert_eq!(registry.chunk(&code, &cfg).strategy, ChunkStrategy::Ast);

        let prose = Document::new("b", "b.md", "Hello world.\n");
        assert_eq!(registry.chunk(&prose, &cfg).strategy, ChunkStrategy::Text);

        let other = Document::new("c", "c.rb", "puts 1\n").with_language("ruby");
        let outcome = registry.chunk(&other, &cfg);
        assert_eq!(outcome.strategy, ChunkStrategy::Lines);
        assert_eq!(outcome.quality, ChunkQuality::Degraded);

        let stats = registry.stats();
        assert_eq!(stats.ast_documents, 1);
        assert_eq!(stats.text_documents, 1);
        assert_eq!(stats.degraded_documents, 1);
        assert_eq!(stats.supported_languages.len(), 6);
    }

    #[test]
    fn test_chunks_tile_document() {
        let registry = ChunkerRegistry::new().unwrap();
        let cfg = Config::default().chunking;
        let source = "\
const LIMIT = 3;

function clamp(x) {
  return Math.min(x, LIMIT);
}

class Box {
  constructor(v) {
    this.v = v;
  }
}
";
        let doc = Document::new("js", "box.js", source);
        let outcome = registry.chunk(&doc, &cfg);

        let mut cursor = 0;
        for chunk in &outcome.chunks {
            assert_eq!(chunk.own_start(), cursor);
            assert_eq!(chunk.text, &source[chunk.start_offset..chunk.end_offset]);
            assert!(chunk.overlap_with_prev <= chunk.len());
            cursor = chunk.end_offset;
        }
        assert_eq!(cursor, source.len());
    }
}
