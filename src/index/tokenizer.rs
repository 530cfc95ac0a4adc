//! Code-aware tokenization on top of tantivy's analyzers

use std::borrow::Cow;

use tantivy::tokenizer::{
    Language, LowerCaser, RemoveLongFilter, SimpleTokenizer, Stemmer, StopWordFilter,
    TextAnalyzer, TokenStream,
};

use crate::config::KeywordConfig;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "this", "that", "these", "those", "i", "you", "he", "she", "it",
    "we", "they", "me", "him", "her", "us", "them",
];

/// Longest token kept; longer ones are usually hashes or base64
const MAX_TOKEN_LEN: usize = 40;

/// Splits text the same way for indexing and querying.
///
/// Identifiers are expanded before analysis: `parseJson` also yields
/// `parse` and `json`. `snake_case` splits naturally on the underscore.
#[derive(Clone)]
pub struct CodeTokenizer {
    analyzer: TextAnalyzer,
    min_token_len: usize,
}

impl CodeTokenizer {
    pub fn new(config: &KeywordConfig) -> Self {
        let stop_words: Vec<String> = if config.stop_words {
            STOP_WORDS.iter().map(|w| w.to_string()).collect()
        } else {
            Vec::new()
        };

        let base = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(MAX_TOKEN_LEN))
            .filter(LowerCaser)
            .filter(StopWordFilter::remove(stop_words));
        let analyzer = if config.stemming {
            base.filter(Stemmer::new(Language::English)).build()
        } else {
            base.build()
        };

        Self {
            analyzer,
            min_token_len: config.min_token_len,
        }
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let expanded = expand_identifiers(text);
        let mut analyzer = self.analyzer.clone();
        let mut stream = analyzer.token_stream(&expanded);
        let mut tokens = Vec::new();
        while stream.advance() {
            let token = &stream.token().text;
            if token.chars().count() >= self.min_token_len {
                tokens.push(token.clone());
            }
        }
        tokens
    }
}

/// Append the parts of camelCase words after the word itself
fn expand_identifiers(text: &str) -> Cow<'_, str> {
    let has_camel = text
        .as_bytes()
        .windows(2)
        .any(|w| w[0].is_ascii_lowercase() && w[1].is_ascii_uppercase());
    if !has_camel {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() * 2);
    for word in text.split_inclusive(|c: char| !c.is_alphanumeric()) {
        out.push_str(word);
        let core = word.trim_end_matches(|c: char| !c.is_alphanumeric());
        let parts = split_camel(core);
        if parts.len() > 1 {
            out.push(' ');
            out.push_str(&parts.join(" "));
            out.push(' ');
        }
    }
    Cow::Owned(out)
}

fn split_camel(word: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;
    for (i, c) in word.char_indices() {
        if let Some(p) = prev {
            if p.is_lowercase() && c.is_uppercase() {
                parts.push(&word[start..i]);
                start = i;
            }
        }
        prev = Some(c);
    }
    if start < word.len() {
        parts.push(&word[start..]);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn tokenizer() -> CodeTokenizer {
        CodeTokenizer::new(&Config::default().keyword)
    }

    #[test]
    fn test_stems_and_drops_stop_words() {
        let tokens = tokenizer().tokenize("function that adds two numbers");
        assert_eq!(tokens, vec!["function", "add", "two", "number"]);
    }

    #[test]
    fn test_code_identifiers() {
        let tokens = tokenizer().tokenize("def parse_json(raw): return loadJson(raw)");
        assert!(tokens.contains(&"pars".to_string()) || tokens.contains(&"parse".to_string()));
        assert!(tokens.contains(&"json".to_string()));
        assert!(tokens.contains(&"loadjson".to_string()));
        assert!(tokens.contains(&"load".to_string()));
    }

    #[test]
    fn test_min_length_and_long_tokens() {
        let long = "x".repeat(60);
        let tokens = tokenizer().tokenize(&format!("a b cd {long}"));
        assert_eq!(tokens, vec!["cd"]);
    }

    #[test]
    fn test_without_stemming_or_stop_words() {
        let mut config = Config::default().keyword;
        config.stemming = false;
        config.stop_words = false;
        let tokens = CodeTokenizer::new(&config).tokenize("The numbers");
        assert_eq!(tokens, vec!["the", "numbers"]);
    }

    #[test]
    fn test_split_camel() {
        assert_eq!(split_camel("parseJsonValue"), vec!["parse", "Json", "Value"]);
        assert_eq!(split_camel("HTTPServer"), vec!["HTTPServer"]);
        assert_eq!(split_camel("plain"), vec!["plain"]);
    }
}
