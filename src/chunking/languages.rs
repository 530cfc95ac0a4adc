//! Language detection and tree-sitter grammar registry.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

/// Source language known to the chunkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Python,
    JavaScript,
    TypeScript,
    Java,
    Cpp,
    /// Prose and markup; handled by the paragraph chunker
    Text,
}

/// What a syntax node contributes to chunking and the symbol table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRole {
    Function,
    Class,
    /// Splittable like a class but records no symbol (namespaces)
    Container,
    Import,
    Variable,
    Comment,
    Other,
}

impl Lang {
    pub const CODE: [Lang; 5] = [
        Lang::Python,
        Lang::JavaScript,
        Lang::TypeScript,
        Lang::Java,
        Lang::Cpp,
    ];

    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::Text => "text",
        }
    }

    /// Resolve a declared language name, accepting common aliases
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "python" | "py" => Some(Self::Python),
            "javascript" | "js" | "jsx" => Some(Self::JavaScript),
            "typescript" | "ts" | "tsx" => Some(Self::TypeScript),
            "java" => Some(Self::Java),
            "cpp" | "c++" | "cxx" | "cc" | "c" => Some(Self::Cpp),
            "text" | "plain" | "plaintext" | "markdown" | "md" | "rst" => Some(Self::Text),
            _ => None,
        }
    }

    /// Get the tree-sitter grammar, `None` for languages without one.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            Self::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            Self::Java => Some(tree_sitter_java::LANGUAGE.into()),
            Self::Cpp => Some(tree_sitter_cpp::LANGUAGE.into()),
            Self::Text => None,
        }
    }

    pub(crate) fn role(self, kind: &str) -> NodeRole {
        match self {
            Self::Python => match kind {
                "function_definition" => NodeRole::Function,
                "class_definition" => NodeRole::Class,
                "import_statement" | "import_from_statement" | "future_import_statement" => {
                    NodeRole::Import
                }
                "comment" => NodeRole::Comment,
                _ => NodeRole::Other,
            },
            Self::JavaScript | Self::TypeScript => match kind {
                "function_declaration"
                | "generator_function_declaration"
                | "method_definition"
                | "function_signature" => NodeRole::Function,
                "class_declaration"
                | "abstract_class_declaration"
                | "interface_declaration"
                | "enum_declaration" => NodeRole::Class,
                "internal_module" | "module" => NodeRole::Container,
                "import_statement" => NodeRole::Import,
                "lexical_declaration" | "variable_declaration" | "type_alias_declaration" => {
                    NodeRole::Variable
                }
                "comment" => NodeRole::Comment,
                _ => NodeRole::Other,
            },
            Self::Java => match kind {
                "method_declaration" | "constructor_declaration" => NodeRole::Function,
                "class_declaration"
                | "interface_declaration"
                | "enum_declaration"
                | "record_declaration" => NodeRole::Class,
                "import_declaration" | "package_declaration" => NodeRole::Import,
                "field_declaration" => NodeRole::Variable,
                "line_comment" | "block_comment" => NodeRole::Comment,
                _ => NodeRole::Other,
            },
            Self::Cpp => match kind {
                "function_definition" => NodeRole::Function,
                "class_specifier" | "struct_specifier" | "union_specifier" => NodeRole::Class,
                "namespace_definition" | "linkage_specification" => NodeRole::Container,
                "preproc_include" | "using_declaration" => NodeRole::Import,
                "declaration" => NodeRole::Variable,
                "comment" => NodeRole::Comment,
                _ => NodeRole::Other,
            },
            Self::Text => NodeRole::Other,
        }
    }

    /// Unwrap decorator, export and template wrappers to the definition they
    /// carry. The wrapper's range is still used for the chunk.
    pub(crate) fn definition_of<'t>(self, node: Node<'t>) -> Node<'t> {
        let inner = match (self, node.kind()) {
            (Self::Python, "decorated_definition") => node.child_by_field_name("definition"),
            (Self::JavaScript | Self::TypeScript, "export_statement") => {
                node.child_by_field_name("declaration")
            }
            (Self::Cpp, "template_declaration") => {
                let mut cursor = node.walk();
                let found = node
                    .named_children(&mut cursor)
                    .find(|c| self.role(c.kind()) != NodeRole::Other);
                found
            }
            _ => None,
        };
        inner.map_or(node, |n| self.definition_of(n))
    }

    /// A JS/TS variable whose value is a function counts as a function
    pub(crate) fn is_function_binding(self, node: Node<'_>) -> bool {
        if !matches!(self, Self::JavaScript | Self::TypeScript) {
            return false;
        }
        let mut cursor = node.walk();
        let declarator = node
            .named_children(&mut cursor)
            .find(|c| c.kind() == "variable_declarator");
        declarator
            .and_then(|d| d.child_by_field_name("value"))
            .is_some_and(|v| {
                matches!(
                    v.kind(),
                    "arrow_function" | "function_expression" | "function" | "generator_function"
                )
            })
    }

    /// Python module-level assignments are wrapped in expression statements
    pub(crate) fn is_assignment(self, node: Node<'_>) -> bool {
        self == Self::Python
            && node.kind() == "expression_statement"
            && node
                .named_child(0)
                .is_some_and(|c| matches!(c.kind(), "assignment" | "augmented_assignment"))
    }

    /// Name of a definition node, if it has one
    pub(crate) fn name_of(self, node: Node<'_>, source: &str) -> Option<String> {
        let text = |n: Node<'_>| source.get(n.byte_range()).map(str::to_string);

        if let Some(name) = node.child_by_field_name("name") {
            return text(name);
        }

        match node.kind() {
            // Python `x = 1`
            "expression_statement" => node
                .named_child(0)
                .and_then(|a| a.child_by_field_name("left"))
                .and_then(text),
            "lexical_declaration" | "variable_declaration" | "field_declaration" => {
                let mut cursor = node.walk();
                let declarator = node
                    .named_children(&mut cursor)
                    .find(|c| c.kind() == "variable_declarator");
                declarator
                    .and_then(|d| d.child_by_field_name("name"))
                    .and_then(text)
                    .or_else(|| {
                        node.child_by_field_name("declarator")
                            .and_then(|d| innermost_declarator(d))
                            .and_then(text)
                    })
            }
            "function_definition" | "declaration" => node
                .child_by_field_name("declarator")
                .and_then(innermost_declarator)
                .and_then(text),
            _ => None,
        }
    }
}

/// Follow C++ `declarator` fields down to the declared identifier
fn innermost_declarator(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "identifier" | "field_identifier" | "qualified_identifier" | "destructor_name"
        | "operator_name" | "type_identifier" => Some(node),
        _ => node
            .child_by_field_name("declarator")
            .and_then(innermost_declarator),
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?;
    match ext.to_ascii_lowercase().as_str() {
        "py" | "pyi" => Some(Lang::Python),
        "js" | "jsx" | "mjs" | "cjs" => Some(Lang::JavaScript),
        "ts" | "tsx" | "mts" | "cts" => Some(Lang::TypeScript),
        "java" => Some(Lang::Java),
        "cpp" | "cc" | "cxx" | "c" | "h" | "hpp" | "hh" | "hxx" => Some(Lang::Cpp),
        "md" | "markdown" | "txt" | "rst" => Some(Lang::Text),
        _ => None,
    }
}
