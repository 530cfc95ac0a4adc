//! Turns candidate units into chunks that tile the source text.
//!
//! Shared by the AST and fallback chunkers: merge small units, split large
//! ones, close the gaps between them, then attach the overlap prefix.

use crate::config::ChunkingConfig;
use crate::model::{Chunk, ChunkKind, ChunkMetadata, ChunkQuality, ChunkStrategy, Document, Symbol};

/// A candidate chunk span in byte offsets
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Unit {
    pub start: usize,
    pub end: usize,
    pub kind: ChunkKind,
    pub name: Option<String>,
    /// Comments glue onto the unit that follows them
    pub attach_to_next: bool,
}

impl Unit {
    pub fn new(start: usize, end: usize, kind: ChunkKind, name: Option<String>) -> Self {
        Self {
            start,
            end,
            kind,
            name,
            attach_to_next: false,
        }
    }

    pub fn comment(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            kind: ChunkKind::Block,
            name: None,
            attach_to_next: true,
        }
    }
}

/// Byte offsets of line starts
pub(crate) struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1).filter(|&i| i < text.len()));
        Self {
            starts,
            len: text.len(),
        }
    }

    /// 0-based line containing `offset`
    pub fn line_of(&self, offset: usize) -> usize {
        self.starts.partition_point(|&s| s <= offset).saturating_sub(1)
    }

    pub fn line_start(&self, line: usize) -> usize {
        self.starts.get(line).copied().unwrap_or(self.len)
    }

    /// Number of lines touched by `[start, end)`
    pub fn span_lines(&self, start: usize, end: usize) -> usize {
        if end <= start {
            return 0;
        }
        self.line_of(end - 1) - self.line_of(start) + 1
    }
}

pub(crate) struct Assembly<'a> {
    pub document: &'a Document,
    pub language: &'a str,
    pub strategy: ChunkStrategy,
    pub quality: ChunkQuality,
}

/// Build the final chunk list from candidate units
pub(crate) fn assemble(
    assembly: &Assembly<'_>,
    units: Vec<Unit>,
    symbols: &[Symbol],
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let text = assembly.document.raw_text.as_str();
    let lines = LineIndex::new(text);

    let units = attach_comments(sorted(units));
    let units = split_oversized(units, &lines, config);
    let units = merge_small(units, &lines, config);
    let spans = close_gaps(units, text.len());

    build_chunks(assembly, spans, symbols, &lines, config.overlap_ratio)
}

/// Build chunks from spans that are already sized, skipping merge and split
pub(crate) fn assemble_sized(
    assembly: &Assembly<'_>,
    units: Vec<Unit>,
    overlap_ratio: f32,
) -> Vec<Chunk> {
    let text = assembly.document.raw_text.as_str();
    let lines = LineIndex::new(text);
    let spans = close_gaps(sorted(units), text.len());
    build_chunks(assembly, spans, &[], &lines, overlap_ratio)
}

fn sorted(mut units: Vec<Unit>) -> Vec<Unit> {
    units.retain(|u| u.end > u.start);
    units.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
    units
}

fn attach_comments(units: Vec<Unit>) -> Vec<Unit> {
    let mut out: Vec<Unit> = Vec::with_capacity(units.len());
    let mut pending: Option<usize> = None;

    for mut unit in units {
        if unit.attach_to_next {
            pending.get_or_insert(unit.start);
            continue;
        }
        if let Some(start) = pending.take() {
            unit.start = start;
        }
        out.push(unit);
    }

    // Trailing comments have nothing to attach to
    if let Some(start) = pending {
        match out.last_mut() {
            Some(last) => last.end = last.end.max(start),
            None => out.push(Unit::new(start, start + 1, ChunkKind::Generic, None)),
        }
    }
    out
}

fn split_oversized(units: Vec<Unit>, lines: &LineIndex, config: &ChunkingConfig) -> Vec<Unit> {
    let window = config.chunk_size.max(1);
    let mut out = Vec::with_capacity(units.len());

    for unit in units {
        if lines.span_lines(unit.start, unit.end) <= config.max_chunk_lines.max(window) {
            out.push(unit);
            continue;
        }
        let first = lines.line_of(unit.start);
        let last = lines.line_of(unit.end - 1);
        let mut start = unit.start;
        let mut line = first + window;
        let mut part = 0;
        while line <= last {
            let end = lines.line_start(line);
            out.push(Unit::new(
                start,
                end,
                unit.kind,
                if part == 0 { unit.name.clone() } else { None },
            ));
            start = end;
            line += window;
            part += 1;
        }
        out.push(Unit::new(start, unit.end, unit.kind, None));
    }
    out
}

fn merge_small(units: Vec<Unit>, lines: &LineIndex, config: &ChunkingConfig) -> Vec<Unit> {
    let mut out = Vec::with_capacity(units.len());
    let mut group: Vec<Unit> = Vec::new();

    let flush = |group: &mut Vec<Unit>, out: &mut Vec<Unit>| match group.len() {
        0 => {}
        1 => out.extend(group.drain(..)),
        _ => {
            let start = group[0].start;
            let end = group[group.len() - 1].end;
            group.clear();
            out.push(Unit::new(start, end, ChunkKind::Block, None));
        }
    };

    for unit in units {
        let unit_lines = lines.span_lines(unit.start, unit.end);
        if unit_lines >= config.min_chunk_lines {
            flush(&mut group, &mut out);
            out.push(unit);
            continue;
        }
        let fits = group
            .first()
            .is_some_and(|first| lines.span_lines(first.start, unit.end) <= config.chunk_size);
        if !fits {
            flush(&mut group, &mut out);
        }
        group.push(unit);
    }
    flush(&mut group, &mut out);
    out
}

/// Make spans tile `[0, len)`: each span ends where the next begins
fn close_gaps(mut units: Vec<Unit>, len: usize) -> Vec<Unit> {
    if units.is_empty() {
        return vec![Unit::new(0, len, ChunkKind::Generic, None)];
    }

    units[0].start = 0;
    for i in 1..units.len() {
        let next_start = units[i].start;
        units[i - 1].end = next_start;
    }
    if let Some(last) = units.last_mut() {
        last.end = len;
    }

    let mut closed: Vec<Unit> = Vec::with_capacity(units.len());
    for unit in units {
        if unit.end > unit.start {
            closed.push(unit);
        } else if let Some(prev) = closed.last_mut() {
            prev.end = prev.end.max(unit.end);
        }
    }
    if let Some(last) = closed.last_mut() {
        last.end = len;
    }
    closed
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}

fn build_chunks(
    assembly: &Assembly<'_>,
    spans: Vec<Unit>,
    symbols: &[Symbol],
    lines: &LineIndex,
    overlap_ratio: f32,
) -> Vec<Chunk> {
    let document = assembly.document;
    let text = document.raw_text.as_str();
    let mut chunks = Vec::with_capacity(spans.len());
    let mut prev_own: Option<(usize, usize)> = None;

    for (ordinal, span) in spans.into_iter().enumerate() {
        let own_start = floor_char_boundary(text, span.start);
        let own_end = floor_char_boundary(text, span.end);
        let own_len = own_end - own_start;

        let overlap = match prev_own {
            Some((prev_start, prev_end)) if overlap_ratio > 0.0 => {
                let wanted = ((prev_end - prev_start) as f32 * overlap_ratio) as usize;
                let wanted = wanted.min(own_len);
                let start = ceil_char_boundary(text, own_start - wanted);
                own_start - start
            }
            _ => 0,
        };
        let start_offset = own_start - overlap;

        let symbol_refs = symbols
            .iter()
            .filter(|s| s.range.start >= own_start && s.range.start < own_end)
            .map(|s| s.id.clone())
            .collect();

        let ordinal = ordinal as u32;
        chunks.push(Chunk {
            id: document.chunk_id(ordinal),
            document_id: document.id.clone(),
            ordinal,
            text: text[start_offset..own_end].to_string(),
            start_offset,
            end_offset: own_end,
            symbol_refs,
            kind: span.kind,
            overlap_with_prev: overlap,
            metadata: ChunkMetadata {
                strategy: assembly.strategy,
                quality: assembly.quality,
                language: assembly.language.to_string(),
                name: span.name,
                start_line: lines.line_of(own_start) + 1,
                end_line: lines.line_of(own_end.saturating_sub(1).max(own_start)) + 1,
            },
        });
        prev_own = Some((own_start, own_end));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config() -> ChunkingConfig {
        Config::default().chunking
    }

    fn assembly(doc: &Document) -> Assembly<'_> {
        Assembly {
            document: doc,
            language: "python",
            strategy: ChunkStrategy::Ast,
            quality: ChunkQuality::Full,
        }
    }

    #[test]
    fn test_line_index() {
        let lines = LineIndex::new("a\nbb\n\nccc");
        assert_eq!(lines.line_of(0), 0);
        assert_eq!(lines.line_of(2), 1);
        assert_eq!(lines.line_of(5), 2);
        assert_eq!(lines.line_of(6), 3);
        assert_eq!(lines.span_lines(0, 9), 4);
        assert_eq!(lines.line_start(10), 9);
    }

    #[test]
    fn test_gaps_are_closed() {
        let doc = Document::new("d", "x.py", "\n\nabc\n\ndef\n\n");
        let units = vec![
            Unit::new(2, 5, ChunkKind::Function, Some("abc".into())),
            Unit::new(7, 10, ChunkKind::Function, Some("def".into())),
        ];
        let mut cfg = config();
        cfg.min_chunk_lines = 1;
        cfg.overlap_ratio = 0.0;

        let chunks = assemble(&assembly(&doc), units, &[], &cfg);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].start_offset, 0);
        assert_eq!(chunks[0].end_offset, chunks[1].start_offset);
        assert_eq!(chunks[1].end_offset, doc.raw_text.len());
    }

    #[test]
    fn test_small_units_merge_into_block() {
        let doc = Document::new("d", "x.py", "a = 1\nb = 2\nc = 3\n");
        let units = vec![
            Unit::new(0, 5, ChunkKind::Block, None),
            Unit::new(6, 11, ChunkKind::Block, None),
            Unit::new(12, 17, ChunkKind::Block, None),
        ];
        let chunks = assemble(&assembly(&doc), units, &[], &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Block);
        assert_eq!(chunks[0].text, doc.raw_text);
    }

    #[test]
    fn test_comment_attaches_to_following_unit() {
        let doc = Document::new("d", "x.py", "# adds\ndef add(a, b):\n    return a + b\n");
        let units = vec![
            Unit::comment(0, 6),
            Unit::new(7, 39, ChunkKind::Function, Some("add".into())),
        ];
        let chunks = assemble(&assembly(&doc), units, &[], &config());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, ChunkKind::Function);
        assert!(chunks[0].text.starts_with("# adds"));
    }

    #[test]
    fn test_oversized_unit_is_windowed() {
        let body: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let doc = Document::new("d", "x.py", body.clone());
        let mut cfg = config();
        cfg.chunk_size = 10;
        cfg.max_chunk_lines = 10;
        cfg.min_chunk_lines = 1;
        cfg.overlap_ratio = 0.0;

        let units = vec![Unit::new(0, body.len(), ChunkKind::Function, Some("f".into()))];
        let chunks = assemble(&assembly(&doc), units, &[], &cfg);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.kind == ChunkKind::Function));
        assert_eq!(chunks[0].metadata.name.as_deref(), Some("f"));
        assert_eq!(chunks[1].metadata.start_line, 11);
    }

    #[test]
    fn test_overlap_is_capped_and_on_char_boundary() {
        let text = "ééééééééééééééééééééé\nx\n";
        let doc = Document::new("d", "x.txt", text);
        let split = text.find('x').unwrap();
        let mut cfg = config();
        cfg.min_chunk_lines = 1;
        cfg.overlap_ratio = 0.45;

        let units = vec![
            Unit::new(0, split, ChunkKind::Block, None),
            Unit::new(split, text.len(), ChunkKind::Block, None),
        ];
        let chunks = assemble(&assembly(&doc), units, &[], &cfg);
        assert_eq!(chunks.len(), 2);
        let second = &chunks[1];
        assert!(second.overlap_with_prev <= second.end_offset - second.own_start());
        assert!(text.is_char_boundary(second.start_offset));
        assert_eq!(second.text, &text[second.start_offset..second.end_offset]);
    }
}
