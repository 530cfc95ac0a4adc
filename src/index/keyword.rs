/// BM25 keyword index for full-text search
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ahash::AHashMap;
use serde::Serialize;
use tracing::info;

use super::CodeTokenizer;
use crate::config::KeywordConfig;

#[derive(Default)]
struct Postings {
    /// term -> chunk id -> term frequency
    terms: AHashMap<String, AHashMap<String, u32>>,
    /// chunk id -> (token count, distinct terms)
    docs: AHashMap<String, (u32, Vec<String>)>,
    total_len: u64,
}

impl Postings {
    fn insert(&mut self, chunk_id: &str, tokens: Vec<String>) {
        self.remove(chunk_id);

        let mut freqs: AHashMap<String, u32> = AHashMap::new();
        for token in tokens {
            *freqs.entry(token).or_default() += 1;
        }
        let len: u32 = freqs.values().sum();
        let mut distinct = Vec::with_capacity(freqs.len());
        for (term, tf) in freqs {
            self.terms
                .entry(term.clone())
                .or_default()
                .insert(chunk_id.to_string(), tf);
            distinct.push(term);
        }
        self.total_len += u64::from(len);
        self.docs.insert(chunk_id.to_string(), (len, distinct));
    }

    fn remove(&mut self, chunk_id: &str) -> bool {
        let Some((len, terms)) = self.docs.remove(chunk_id) else {
            return false;
        };
        self.total_len -= u64::from(len);
        for term in terms {
            if let Some(postings) = self.terms.get_mut(&term) {
                postings.remove(chunk_id);
                if postings.is_empty() {
                    self.terms.remove(&term);
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Bm25Params {
    k1: f32,
    b: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordIndexStats {
    pub documents: usize,
    pub terms: usize,
    pub avg_doc_len: f32,
}

/// In-memory inverted index scored with Okapi BM25.
///
/// `idf = ln(1 + (N - df + 0.5) / (df + 0.5))`, so scores stay positive
/// even for terms present in most chunks.
pub struct KeywordIndex {
    tokenizer: RwLock<CodeTokenizer>,
    params: RwLock<Bm25Params>,
    postings: RwLock<Postings>,
}

impl KeywordIndex {
    pub fn new(config: &KeywordConfig) -> Self {
        Self {
            tokenizer: RwLock::new(CodeTokenizer::new(config)),
            params: RwLock::new(Bm25Params {
                k1: config.k1,
                b: config.b,
            }),
            postings: RwLock::new(Postings::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Postings> {
        self.postings.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Postings> {
        self.postings.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply new BM25 parameters immediately. Tokenizer changes only affect
    /// text indexed afterwards, so a rebuild is needed for a consistent index.
    pub fn configure(&self, config: &KeywordConfig) {
        *self.params.write().unwrap_or_else(PoisonError::into_inner) = Bm25Params {
            k1: config.k1,
            b: config.b,
        };
        *self.tokenizer.write().unwrap_or_else(PoisonError::into_inner) =
            CodeTokenizer::new(config);
    }

    pub fn tokenize(&self, text: &str) -> Vec<String> {
        self.tokenizer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tokenize(text)
    }

    /// Index `text` under `chunk_id`, replacing any previous entry
    pub fn index(&self, chunk_id: &str, text: &str) {
        let tokens = self.tokenize(text);
        self.write().insert(chunk_id, tokens);
    }

    pub fn index_batch(&self, items: &[(String, String)]) {
        let tokenized: Vec<(&str, Vec<String>)> = items
            .iter()
            .map(|(id, text)| (id.as_str(), self.tokenize(text)))
            .collect();
        let mut postings = self.write();
        for (id, tokens) in tokenized {
            postings.insert(id, tokens);
        }
    }

    pub fn delete(&self, chunk_id: &str) -> bool {
        self.write().remove(chunk_id)
    }

    pub fn delete_many(&self, chunk_ids: &[String]) -> usize {
        let mut postings = self.write();
        chunk_ids.iter().filter(|id| postings.remove(id)).count()
    }

    /// Replace the whole index with `items`
    pub fn rebuild(&self, items: &[(String, String)]) {
        let mut fresh = Postings::default();
        for (id, text) in items {
            fresh.insert(id, self.tokenize(text));
        }
        info!("Keyword index rebuilt with {} chunks", fresh.docs.len());
        *self.write() = fresh;
    }

    /// Top `k` chunks as `(chunk_id, bm25)`, ordered by score desc then
    /// chunk id. Chunks sharing no term with the query are not returned.
    pub fn search(&self, query: &str, k: usize) -> Vec<(String, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut terms = self.tokenize(query);
        terms.sort();
        terms.dedup();

        let Bm25Params { k1, b } = *self.params.read().unwrap_or_else(PoisonError::into_inner);
        let postings = self.read();
        let n = postings.docs.len() as f32;
        if n == 0.0 {
            return Vec::new();
        }
        let avg_len = (postings.total_len as f32 / n).max(1.0);

        let mut scores: AHashMap<&str, f32> = AHashMap::new();
        for term in &terms {
            let Some(docs) = postings.terms.get(term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for (chunk_id, &tf) in docs {
                let doc_len = postings.docs.get(chunk_id).map_or(0, |d| d.0) as f32;
                let tf = tf as f32;
                let norm = tf * (k1 + 1.0) / (tf + k1 * (1.0 - b + b * doc_len / avg_len));
                *scores.entry(chunk_id.as_str()).or_default() += idf * norm;
            }
        }

        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.read().docs.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.read().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> KeywordIndexStats {
        let postings = self.read();
        let documents = postings.docs.len();
        KeywordIndexStats {
            documents,
            terms: postings.terms.len(),
            avg_doc_len: if documents == 0 {
                0.0
            } else {
                postings.total_len as f32 / documents as f32
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn index() -> KeywordIndex {
        KeywordIndex::new(&Config::default().keyword)
    }

    #[test]
    fn test_bm25_ranks_matching_chunks() {
        let index = index();
        index.index("c1", "def add(a, b): return a + b");
        index.index("c2", "def subtract(a, b): return a - b");
        index.index("c3", "class Renderer: draws templates");

        let hits = index.search("adds numbers", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "c1");
        assert!(hits[0].1 > 0.0);
    }

    #[test]
    fn test_idf_formula() {
        let index = index();
        index.index("c1", "alpha");
        index.index("c2", "beta");
        let hits = index.search("alpha", 1);
        // N = 2, df = 1, tf = 1, doc_len = avg_len
        let idf = (1.0f32 + (2.0 - 1.0 + 0.5) / (1.0 + 0.5)).ln();
        assert!((hits[0].1 - idf).abs() < 1e-5);
    }

    #[test]
    fn test_reindex_replaces_and_delete_removes() {
        let index = index();
        index.index("c1", "alpha beta");
        index.index("c1", "gamma");
        assert!(index.search("alpha", 5).is_empty());
        assert_eq!(index.search("gamma", 5)[0].0, "c1");

        assert!(index.delete("c1"));
        assert!(index.search("gamma", 5).is_empty());
        assert_eq!(index.stats().terms, 0);
    }

    #[test]
    fn test_ties_break_on_chunk_id() {
        let index = index();
        index.index("b", "token");
        index.index("a", "token");
        let hits = index.search("token", 5);
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "b");
        assert_eq!(hits[0].1, hits[1].1);
    }

    #[test]
    fn test_rebuild_equals_incremental() {
        let items = vec![
            ("c1".to_string(), "open the config file".to_string()),
            ("c2".to_string(), "parse config values".to_string()),
            ("c3".to_string(), "write log lines".to_string()),
        ];
        let incremental = index();
        for (id, text) in &items {
            incremental.index(id, text);
        }
        let rebuilt = index();
        rebuilt.rebuild(&items);
        assert_eq!(
            incremental.search("config file", 3),
            rebuilt.search("config file", 3)
        );
    }
}
