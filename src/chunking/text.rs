//! Paragraph packing for prose and markup

use regex::Regex;

use super::assemble::{assemble_sized, Assembly, Unit};
use super::languages::Lang;
use super::{ChunkOutcome, Chunker};
use crate::config::ChunkingConfig;
use crate::error::{RaglineError, Result};
use crate::model::{ChunkKind, ChunkQuality, ChunkStrategy, Document};

pub struct TextChunker {
    paragraph_break: Regex,
}

impl TextChunker {
    pub fn new() -> Result<Self> {
        let paragraph_break = Regex::new(r"\n[ \t]*\n\s*")
            .map_err(|e| RaglineError::Config(format!("Invalid paragraph pattern: {}", e)))?;
        Ok(Self { paragraph_break })
    }

    /// Paragraph spans, each owning its trailing blank lines
    fn paragraphs(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = 0;
        for sep in self.paragraph_break.find_iter(text) {
            if sep.end() > start {
                spans.push((start, sep.end()));
                start = sep.end();
            }
        }
        if start < text.len() {
            spans.push((start, text.len()));
        }
        spans
    }
}

/// Split `[start, end)` into pieces of at most `max_chars` characters
fn hard_split(text: &str, start: usize, end: usize, max_chars: usize) -> Vec<(usize, usize)> {
    let mut pieces = Vec::new();
    let mut piece_start = start;
    for (count, (offset, _)) in text[start..end].char_indices().enumerate() {
        if count > 0 && count % max_chars == 0 {
            pieces.push((piece_start, start + offset));
            piece_start = start + offset;
        }
    }
    pieces.push((piece_start, end));
    pieces
}

impl Chunker for TextChunker {
    fn language(&self) -> Lang {
        Lang::Text
    }

    fn chunk(&self, document: &Document, config: &ChunkingConfig) -> ChunkOutcome {
        let text = document.raw_text.as_str();
        let max_chars = config.text_max_chars.max(1);

        let mut units = Vec::new();
        let mut current: Option<(usize, usize, usize)> = None;
        for (start, end) in self.paragraphs(text) {
            let chars = text[start..end].chars().count();

            if chars > max_chars {
                if let Some((s, e, _)) = current.take() {
                    units.push(Unit::new(s, e, ChunkKind::Generic, None));
                }
                units.extend(
                    hard_split(text, start, end, max_chars)
                        .into_iter()
                        .map(|(s, e)| Unit::new(s, e, ChunkKind::Generic, None)),
                );
                continue;
            }

            current = match current {
                Some((s, _, n)) if n + chars <= max_chars => Some((s, end, n + chars)),
                Some((s, e, _)) => {
                    units.push(Unit::new(s, e, ChunkKind::Generic, None));
                    Some((start, end, chars))
                }
                None => Some((start, end, chars)),
            };
        }
        if let Some((s, e, _)) = current {
            units.push(Unit::new(s, e, ChunkKind::Generic, None));
        }

        let assembly = Assembly {
            document,
            language: Lang::Text.id(),
            strategy: ChunkStrategy::Text,
            quality: ChunkQuality::Full,
        };
        ChunkOutcome {
            chunks: assemble_sized(&assembly, units, config.overlap_ratio),
            symbols: Vec::new(),
            strategy: ChunkStrategy::Text,
            quality: ChunkQuality::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config(max_chars: usize) -> ChunkingConfig {
        let mut cfg = Config::default().chunking;
        cfg.text_max_chars = max_chars;
        cfg.overlap_ratio = 0.0;
        cfg
    }

    #[test]
    fn test_paragraphs_are_packed() {
        let text = "first paragraph\n\nsecond one\n\nthird paragraph here\n";
        let doc = Document::new("t", "notes.md", text);
        let outcome = TextChunker::new().unwrap().chunk(&doc, &config(32));

        assert_eq!(outcome.strategy, ChunkStrategy::Text);
        assert_eq!(outcome.chunks.len(), 2);
        assert_eq!(outcome.chunks[0].text, "first paragraph\n\nsecond one\n\n");
        assert_eq!(outcome.chunks[1].text, "third paragraph here\n");
    }

    #[test]
    fn test_long_paragraph_is_hard_split() {
        let text = "ü".repeat(25);
        let doc = Document::new("t", "notes.txt", text.clone());
        let outcome = TextChunker::new().unwrap().chunk(&doc, &config(10));

        assert_eq!(outcome.chunks.len(), 3);
        assert_eq!(outcome.chunks[0].text.chars().count(), 10);
        assert_eq!(outcome.chunks[2].text.chars().count(), 5);
        let joined: String = outcome.chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_overlap_is_applied() {
        let text = "alpha beta gamma\n\ndelta epsilon zeta\n";
        let doc = Document::new("t", "notes.txt", text);
        let mut cfg = config(20);
        cfg.overlap_ratio = 0.25;
        let outcome = TextChunker::new().unwrap().chunk(&doc, &cfg);

        assert_eq!(outcome.chunks.len(), 2);
        let second = &outcome.chunks[1];
        assert!(second.overlap_with_prev > 0);
        assert_eq!(second.text, &text[second.start_offset..second.end_offset]);
    }
}
