//! Regex and line-window chunking for input the AST chunker cannot handle

use std::collections::HashMap;

use regex::Regex;

use super::assemble::{assemble, Assembly, LineIndex, Unit};
use super::languages::Lang;
use super::ChunkOutcome;
use crate::config::ChunkingConfig;
use crate::error::{RaglineError, Result};
use crate::model::{
    ChunkKind, ChunkQuality, ChunkStrategy, Document, Symbol, SymbolKind, TextRange,
};

/// Definition line heuristics; each pattern captures `name`
const PATTERNS: &[(Lang, ChunkKind, &str)] = &[
    (Lang::Python, ChunkKind::Class, r"(?m)^class\s+(?P<name>\w+)"),
    (
        Lang::Python,
        ChunkKind::Function,
        r"(?m)^(?:async\s+)?def\s+(?P<name>\w+)\s*\(",
    ),
    (
        Lang::JavaScript,
        ChunkKind::Function,
        r"(?m)^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\*?\s+(?P<name>\w+)\s*\(",
    ),
    (
        Lang::JavaScript,
        ChunkKind::Function,
        r"(?m)^(?:export\s+)?(?:const|let|var)\s+(?P<name>\w+)\s*=\s*(?:async\s+)?\([^)]*\)\s*=>",
    ),
    (
        Lang::JavaScript,
        ChunkKind::Class,
        r"(?m)^(?:export\s+)?(?:default\s+)?class\s+(?P<name>\w+)",
    ),
    (
        Lang::TypeScript,
        ChunkKind::Function,
        r"(?m)^(?:export\s+)?(?:default\s+)?(?:async\s+)?function\*?\s+(?P<name>\w+)\s*[(<]",
    ),
    (
        Lang::TypeScript,
        ChunkKind::Function,
        r"(?m)^(?:export\s+)?(?:const|let|var)\s+(?P<name>\w+)(?:\s*:[^=]+)?\s*=\s*(?:async\s+)?\([^)]*\)[^=]*=>",
    ),
    (
        Lang::TypeScript,
        ChunkKind::Class,
        r"(?m)^(?:export\s+)?(?:default\s+)?(?:abstract\s+)?(?:class|interface|enum)\s+(?P<name>\w+)",
    ),
    (
        Lang::Java,
        ChunkKind::Class,
        r"(?m)^(?:(?:public|protected|private|abstract|final|static|sealed)\s+)*(?:class|interface|enum|record)\s+(?P<name>\w+)",
    ),
    (
        Lang::Cpp,
        ChunkKind::Class,
        r"(?m)^(?:template\s*<[^>]*>\s*)?(?:class|struct|union)\s+(?P<name>\w+)[^;]*$",
    ),
    (
        Lang::Cpp,
        ChunkKind::Function,
        r"(?m)^(?:[\w:<>*&]+[ \t]+)+[*&]*(?P<name>[\w:~]+)\s*\([^;{]*\)\s*(?:const\s*)?\{?\s*$",
    ),
];

struct CompiledPattern {
    kind: ChunkKind,
    regex: Regex,
}

/// Language-agnostic chunker used when no syntax tree is available
pub struct FallbackChunker {
    patterns: HashMap<Lang, Vec<CompiledPattern>>,
}

struct Mark {
    start: usize,
    kind: ChunkKind,
    name: String,
}

impl FallbackChunker {
    pub fn new() -> Result<Self> {
        let mut patterns: HashMap<Lang, Vec<CompiledPattern>> = HashMap::new();
        for (lang, kind, pattern) in PATTERNS {
            let regex = Regex::new(pattern).map_err(|e| {
                RaglineError::Config(format!(
                    "Invalid {} fallback pattern for {}: {}",
                    kind.as_str(),
                    lang,
                    e
                ))
            })?;
            patterns.entry(*lang).or_default().push(CompiledPattern { kind: *kind, regex });
        }
        Ok(Self { patterns })
    }

    /// Chunk `document` as `lang`, recording `quality` on every chunk.
    ///
    /// Uses definition heuristics when the language has them, line windows
    /// otherwise.
    pub fn chunk_as(
        &self,
        document: &Document,
        lang: Lang,
        quality: ChunkQuality,
        config: &ChunkingConfig,
    ) -> ChunkOutcome {
        match self.patterns.get(&lang) {
            Some(patterns) => self.chunk_regex(document, lang.id(), patterns, quality, config),
            None => self.chunk_lines(document, lang.id(), quality, config),
        }
    }

    /// Line windows for a language nothing else understands
    pub fn chunk_unknown(
        &self,
        document: &Document,
        language: &str,
        config: &ChunkingConfig,
    ) -> ChunkOutcome {
        self.chunk_lines(document, language, ChunkQuality::Degraded, config)
    }

    fn chunk_regex(
        &self,
        document: &Document,
        language: &str,
        patterns: &[CompiledPattern],
        quality: ChunkQuality,
        config: &ChunkingConfig,
    ) -> ChunkOutcome {
        let text = document.raw_text.as_str();
        let mut marks: Vec<Mark> = patterns
            .iter()
            .flat_map(|p| {
                p.regex.captures_iter(text).filter_map(move |caps| {
                    let whole = caps.get(0)?;
                    Some(Mark {
                        start: whole.start(),
                        kind: p.kind,
                        name: caps.name("name")?.as_str().to_string(),
                    })
                })
            })
            .collect();
        marks.sort_by(|a, b| a.start.cmp(&b.start).then(a.name.cmp(&b.name)));
        marks.dedup_by_key(|m| m.start);

        if marks.is_empty() {
            return self.chunk_lines(document, language, quality, config);
        }

        let mut units = Vec::with_capacity(marks.len() + 1);
        if marks[0].start > 0 {
            units.push(Unit::new(0, marks[0].start, ChunkKind::Block, None));
        }
        let mut symbols = Vec::with_capacity(marks.len());
        for (i, mark) in marks.iter().enumerate() {
            let end = marks.get(i + 1).map_or(text.len(), |next| next.start);
            units.push(Unit::new(mark.start, end, mark.kind, Some(mark.name.clone())));
            symbols.push(Symbol {
                id: document.symbol_id(i),
                document_id: document.id.clone(),
                kind: if mark.kind == ChunkKind::Class {
                    SymbolKind::Class
                } else {
                    SymbolKind::Function
                },
                name: mark.name.clone(),
                range: TextRange::new(mark.start, end),
            });
        }

        let assembly = Assembly {
            document,
            language,
            strategy: ChunkStrategy::Regex,
            quality,
        };
        ChunkOutcome {
            chunks: assemble(&assembly, units, &symbols, config),
            symbols,
            strategy: ChunkStrategy::Regex,
            quality,
        }
    }

    fn chunk_lines(
        &self,
        document: &Document,
        language: &str,
        quality: ChunkQuality,
        config: &ChunkingConfig,
    ) -> ChunkOutcome {
        let text = document.raw_text.as_str();
        let lines = LineIndex::new(text);
        let window = config.chunk_size.max(1);
        let total = lines.span_lines(0, text.len());

        let units = (0..total)
            .step_by(window)
            .map(|first| {
                let start = lines.line_start(first);
                let end = lines.line_start(first + window);
                Unit::new(start, end, ChunkKind::Generic, None)
            })
            .collect();

        let assembly = Assembly {
            document,
            language,
            strategy: ChunkStrategy::Lines,
            quality,
        };
        ChunkOutcome {
            chunks: assemble(&assembly, units, &[], config),
            symbols: Vec::new(),
            strategy: ChunkStrategy::Lines,
            quality,
        }
    }
}
