//! Syntax-aware chunking via tree-sitter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};
use tree_sitter::{Node, Parser, Tree};

use super::assemble::{assemble, Assembly, LineIndex, Unit};
use super::fallback::FallbackChunker;
use super::languages::{Lang, NodeRole};
use super::{ChunkOutcome, Chunker};
use crate::config::ChunkingConfig;
use crate::model::{ChunkKind, ChunkQuality, ChunkStrategy, Document, Symbol, SymbolKind, TextRange};

/// Chunks one language along its top-level definitions.
///
/// Falls back to [`FallbackChunker`] when the grammar is missing or the
/// source does not parse cleanly.
pub struct AstChunker {
    lang: Lang,
    grammar: Option<tree_sitter::Language>,
    fallback: Arc<FallbackChunker>,
    warned_missing_grammar: AtomicBool,
}

impl AstChunker {
    pub fn new(lang: Lang, fallback: Arc<FallbackChunker>) -> Self {
        Self::with_grammar(lang, lang.grammar(), fallback)
    }

    pub(crate) fn with_grammar(
        lang: Lang,
        grammar: Option<tree_sitter::Language>,
        fallback: Arc<FallbackChunker>,
    ) -> Self {
        Self {
            lang,
            grammar,
            fallback,
            warned_missing_grammar: AtomicBool::new(false),
        }
    }

    fn parse(&self, grammar: &tree_sitter::Language, source: &str) -> Option<Tree> {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(grammar) {
            warn!("Grammar for {} is incompatible: {}", self.lang, e);
            return None;
        }
        parser.parse(source, None)
    }
}

impl Chunker for AstChunker {
    fn language(&self) -> Lang {
        self.lang
    }

    fn chunk(&self, document: &Document, config: &ChunkingConfig) -> ChunkOutcome {
        let Some(grammar) = &self.grammar else {
            if !self.warned_missing_grammar.swap(true, Ordering::Relaxed) {
                warn!(
                    "No grammar available for {}, using fallback chunking",
                    self.lang
                );
            }
            return self
                .fallback
                .chunk_as(document, self.lang, ChunkQuality::Degraded, config);
        };

        let source = document.raw_text.as_str();
        let tree = match self.parse(grammar, source) {
            Some(tree) if !tree.root_node().has_error() => tree,
            _ => {
                debug!(
                    "Syntax errors in {} ({}), using fallback chunking",
                    document.id, self.lang
                );
                return self
                    .fallback
                    .chunk_as(document, self.lang, ChunkQuality::Partial, config);
            }
        };

        let root = tree.root_node();
        let symbols = SymbolCollector::new(self.lang, document).collect(root);

        let lines = LineIndex::new(source);
        let mut units = Vec::new();
        UnitBuilder {
            lang: self.lang,
            source,
            lines: &lines,
            config,
        }
        .build(root, &mut units);

        let assembly = Assembly {
            document,
            language: self.lang.id(),
            strategy: ChunkStrategy::Ast,
            quality: ChunkQuality::Full,
        };
        let chunks = assemble(&assembly, units, &symbols, config);

        ChunkOutcome {
            chunks,
            symbols,
            strategy: ChunkStrategy::Ast,
            quality: ChunkQuality::Full,
        }
    }
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// Body node holding the members of a class-like definition
fn body_of(node: Node<'_>) -> Option<Node<'_>> {
    node.child_by_field_name("body").or_else(|| {
        named_children(node)
            .into_iter()
            .find(|c| matches!(c.kind(), "declaration_list" | "field_declaration_list"))
    })
}

struct UnitBuilder<'a> {
    lang: Lang,
    source: &'a str,
    lines: &'a LineIndex,
    config: &'a ChunkingConfig,
}

impl UnitBuilder<'_> {
    fn build(&self, parent: Node<'_>, out: &mut Vec<Unit>) {
        for node in named_children(parent) {
            self.visit(node, out);
        }
    }

    fn visit(&self, node: Node<'_>, out: &mut Vec<Unit>) {
        let def = self.lang.definition_of(node);
        let (start, end) = (node.start_byte(), node.end_byte());
        let name = || self.lang.name_of(def, self.source);

        match self.lang.role(def.kind()) {
            NodeRole::Comment => out.push(Unit::comment(start, end)),
            NodeRole::Function => {
                out.push(Unit::new(start, end, ChunkKind::Function, name()));
            }
            role @ (NodeRole::Class | NodeRole::Container) => {
                let kind = if role == NodeRole::Class {
                    ChunkKind::Class
                } else {
                    ChunkKind::Block
                };
                let oversized = self.lines.span_lines(start, end) > self.config.max_chunk_lines;
                match body_of(def).filter(|_| oversized) {
                    Some(body) => self.split_class(start, end, kind, name(), body, out),
                    None => out.push(Unit::new(start, end, kind, name())),
                }
            }
            NodeRole::Variable if self.lang.is_function_binding(def) => {
                out.push(Unit::new(start, end, ChunkKind::Function, name()));
            }
            _ => out.push(Unit::new(start, end, ChunkKind::Block, None)),
        }
    }

    /// Header up to the first member definition, then one unit per member
    fn split_class(
        &self,
        start: usize,
        end: usize,
        kind: ChunkKind,
        name: Option<String>,
        body: Node<'_>,
        out: &mut Vec<Unit>,
    ) {
        let members = named_children(body);
        let Some(first) = members.iter().position(|m| self.is_definition(*m)) else {
            out.push(Unit::new(start, end, kind, name));
            return;
        };
        debug!(
            "Splitting {} {:?} into {} members",
            kind.as_str(),
            name,
            members.len() - first
        );
        out.push(Unit::new(start, members[first].start_byte(), kind, name));
        for member in &members[first..] {
            self.visit(*member, out);
        }
    }

    fn is_definition(&self, node: Node<'_>) -> bool {
        let def = self.lang.definition_of(node);
        match self.lang.role(def.kind()) {
            NodeRole::Function | NodeRole::Class | NodeRole::Container => true,
            NodeRole::Variable => self.lang.is_function_binding(def),
            _ => false,
        }
    }
}

struct SymbolCollector<'a> {
    lang: Lang,
    document: &'a Document,
    found: Vec<(SymbolKind, String, TextRange)>,
}

impl<'a> SymbolCollector<'a> {
    fn new(lang: Lang, document: &'a Document) -> Self {
        Self {
            lang,
            document,
            found: Vec::new(),
        }
    }

    fn collect(mut self, root: Node<'_>) -> Vec<Symbol> {
        for node in named_children(root) {
            self.visit(node, true);
        }

        self.found.sort_by(|a, b| a.2.start.cmp(&b.2.start).then(a.1.cmp(&b.1)));
        self.found
            .into_iter()
            .enumerate()
            .map(|(i, (kind, name, range))| Symbol {
                id: self.document.symbol_id(i),
                document_id: self.document.id.clone(),
                kind,
                name,
                range,
            })
            .collect()
    }

    fn record(&mut self, kind: SymbolKind, name: Option<String>, node: Node<'_>) {
        if let Some(name) = name.filter(|n| !n.trim().is_empty()) {
            self.found.push((
                kind,
                name,
                TextRange::new(node.start_byte(), node.end_byte()),
            ));
        }
    }

    fn visit(&mut self, node: Node<'_>, top_level: bool) {
        let source = self.document.raw_text.as_str();
        let def = self.lang.definition_of(node);
        let name = self.lang.name_of(def, source);

        match self.lang.role(def.kind()) {
            NodeRole::Function => self.record(SymbolKind::Function, name, node),
            NodeRole::Class => {
                self.record(SymbolKind::Class, name, node);
                self.visit_members(def);
            }
            NodeRole::Container => self.visit_members(def),
            NodeRole::Import if top_level => {
                let statement = source
                    .get(node.byte_range())
                    .and_then(|s| s.lines().next())
                    .map(|s| s.trim().to_string());
                self.record(SymbolKind::Import, statement, node);
            }
            NodeRole::Variable if self.lang.is_function_binding(def) => {
                self.record(SymbolKind::Function, name, node);
            }
            NodeRole::Variable if top_level => self.record(SymbolKind::Variable, name, node),
            NodeRole::Other if top_level && self.lang.is_assignment(def) => {
                self.record(SymbolKind::Variable, name, node);
            }
            _ => {}
        }
    }

    fn visit_members(&mut self, def: Node<'_>) {
        if let Some(body) = body_of(def) {
            for member in named_children(body) {
                self.visit(member, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn chunker(lang: Lang) -> AstChunker {
        let fallback = Arc::new(FallbackChunker::new().unwrap());
        AstChunker::new(lang, fallback)
    }

    fn config() -> ChunkingConfig {
        Config::default().chunking
    }

    #[test]
    fn test_single_function_is_one_chunk() {
        let doc = Document::new("math", "math.py", "def add(a, b): return a + b");
        let outcome = chunker(Lang::Python).chunk(&doc, &config());

        assert_eq!(outcome.strategy, ChunkStrategy::Ast);
        assert_eq!(outcome.chunks.len(), 1);
        let chunk = &outcome.chunks[0];
        assert_eq!(chunk.kind, ChunkKind::Function);
        assert_eq!(chunk.text, doc.raw_text);
        assert_eq!(chunk.metadata.name.as_deref(), Some("add"));

        assert_eq!(outcome.symbols.len(), 1);
        assert_eq!(outcome.symbols[0].name, "add");
        assert_eq!(chunk.symbol_refs, vec![outcome.symbols[0].id.clone()]);
    }

    #[test]
    fn test_python_symbols() {
        let source = "\
import os
from typing import List

LIMIT = 10

class Stack:
    def push(self, item):
        self.items.append(item)

    def pop(self):
        return self.items.pop()

@cache
def helper(x):
    return x * 2
";
        let doc = Document::new("s", "stack.py", source);
        let outcome = chunker(Lang::Python).chunk(&doc, &config());

        let names: Vec<(&str, SymbolKind)> = outcome
            .symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("import os", SymbolKind::Import),
                ("from typing import List", SymbolKind::Import),
                ("LIMIT", SymbolKind::Variable),
                ("Stack", SymbolKind::Class),
                ("push", SymbolKind::Function),
                ("pop", SymbolKind::Function),
                ("helper", SymbolKind::Function),
            ]
        );

        let rebuilt: String = outcome
            .chunks
            .iter()
            .map(|c| &c.text[c.overlap_with_prev..])
            .collect();
        assert_eq!(rebuilt, source);
    }

    #[test]
    fn test_large_class_is_split_into_members() {
        let mut source = String::from("class Big:\n    \"\"\"Doc.\"\"\"\n\n");
        for i in 0..8 {
            source.push_str(&format!("    def method_{i}(self):\n"));
            for j in 0..6 {
                source.push_str(&format!("        x_{j} = {j}\n"));
            }
            source.push_str("        return x_0\n\n");
        }
        let doc = Document::new("big", "big.py", source);
        let mut cfg = config();
        cfg.max_chunk_lines = 20;
        cfg.chunk_size = 20;

        let outcome = chunker(Lang::Python).chunk(&doc, &cfg);
        assert!(outcome.chunks.len() > 1);
        assert_eq!(outcome.chunks[0].kind, ChunkKind::Class);
        assert!(outcome.chunks.iter().any(|c| c.kind == ChunkKind::Function));
        assert_eq!(
            outcome
                .symbols
                .iter()
                .filter(|s| s.kind == SymbolKind::Function)
                .count(),
            8
        );
    }

    #[test]
    fn test_syntax_error_falls_back_partial() {
        let doc = Document::new("bad", "bad.py", "def broken(:\n    return\n");
        let outcome = chunker(Lang::Python).chunk(&doc, &config());
        assert_eq!(outcome.quality, ChunkQuality::Partial);
        assert_ne!(outcome.strategy, ChunkStrategy::Ast);
        assert!(outcome
            .chunks
            .iter()
            .all(|c| c.metadata.quality == ChunkQuality::Partial));
    }

    #[test]
    fn test_missing_grammar_degrades() {
        let fallback = Arc::new(FallbackChunker::new().unwrap());
        let chunker = AstChunker::with_grammar(Lang::Java, None, fallback);
        let doc = Document::new("j", "A.java", "class A {\n  void run() {}\n}\n");

        let first = chunker.chunk(&doc, &config());
        let second = chunker.chunk(&doc, &config());
        assert_eq!(first.quality, ChunkQuality::Degraded);
        assert_eq!(first.chunks, second.chunks);
        assert!(chunker.warned_missing_grammar.load(Ordering::Relaxed));
    }

    #[test]
    fn test_typescript_arrow_function_binding() {
        let source = "export const double = (x: number): number => x * 2;\n";
        let doc = Document::new("t", "util.ts", source);
        let outcome = chunker(Lang::TypeScript).chunk(&doc, &config());

        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.chunks[0].kind, ChunkKind::Function);
        assert_eq!(outcome.symbols[0].name, "double");
        assert_eq!(outcome.symbols[0].kind, SymbolKind::Function);
    }

    #[test]
    fn test_cpp_function_name() {
        let source = "#include <vector>\n\nint add(int a, int b) {\n  return a + b;\n}\n";
        let doc = Document::new("c", "add.cpp", source);
        let outcome = chunker(Lang::Cpp).chunk(&doc, &config());

        assert!(outcome
            .symbols
            .iter()
            .any(|s| s.name == "add" && s.kind == SymbolKind::Function));
        assert!(outcome.symbols.iter().any(|s| s.kind == SymbolKind::Import));
    }

    #[test]
    fn test_java_methods_recorded() {
        let source = "\
public class Greeter {
    public String greet(String name) {
        return \"Hello \" + name;
    }
}
";
        let doc = Document::new("g", "Greeter.java", source);
        let outcome = chunker(Lang::Java).chunk(&doc, &config());
        let names: Vec<&str> = outcome.symbols.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Greeter", "greet"]);
        assert_eq!(outcome.chunks[0].kind, ChunkKind::Class);
    }
}
