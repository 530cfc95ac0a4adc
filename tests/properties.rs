//! Invariants that hold for any input

use std::sync::Arc;

use proptest::prelude::*;

use ragline::chunking::{ChunkOutcome, ChunkerRegistry, FallbackChunker};
use ragline::config::Config;
use ragline::embedding::{BackendRegistry, EmbeddingService, HashEmbedder};
use ragline::model::Document;
use ragline::retrieval::{reciprocal_rank_fusion, Candidate, FusionConfig, SearchRequest};
use ragline::Collection;

/// Every byte of the document is owned by exactly one chunk, in order
fn assert_tiles(source: &str, outcome: &ChunkOutcome) -> Result<(), TestCaseError> {
    prop_assert!(!outcome.chunks.is_empty());
    let mut cursor = 0;
    for (ordinal, chunk) in outcome.chunks.iter().enumerate() {
        prop_assert_eq!(chunk.ordinal as usize, ordinal);
        prop_assert_eq!(chunk.own_start(), cursor);
        prop_assert_eq!(&chunk.text, &source[chunk.start_offset..chunk.end_offset]);
        prop_assert!(chunk.end_offset > chunk.own_start());
        cursor = chunk.end_offset;
    }
    prop_assert_eq!(cursor, source.len());
    Ok(())
}

fn python_line() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(|name| format!("def {}(x):", name)),
        "[a-z]{1,8}".prop_map(|name| format!("class {}:", name)),
        "[a-z]{1,8}".prop_map(|name| format!("    return {}", name)),
        "[a-z]{1,8}".prop_map(|name| format!("    {} = 1", name)),
        Just("# note".to_string()),
        Just(String::new()),
        Just("    if x: (".to_string()),
    ]
}

fn ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("doc@v1#{}", i)).collect()
}

fn candidates(ids: &[String]) -> Vec<Candidate> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| Candidate::new(id.clone(), 1.0 / (i as f32 + 1.0)))
        .collect()
}

fn fused_score(semantic: &[Candidate], keyword: &[Candidate], id: &str, w: f32) -> f32 {
    let config = FusionConfig::new(60.0, w).unwrap();
    reciprocal_rank_fusion(semantic, keyword, &config)
        .into_iter()
        .find(|c| c.chunk_id == id)
        .map(|c| c.score)
        .unwrap_or(0.0)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn code_chunks_cover_document(
        lines in prop::collection::vec(python_line(), 1..80),
        chunk_size in 2usize..40,
        overlap in 0.0f32..0.5,
    ) {
        let source = lines.join("\n") + "\n";
        prop_assume!(!source.trim().is_empty());

        let mut config = Config::default().chunking;
        config.chunk_size = chunk_size;
        config.min_chunk_lines = 1;
        config.overlap_ratio = overlap;

        let registry = ChunkerRegistry::new().unwrap();
        let outcome = registry.chunk(&Document::new("p", "p.py", source.clone()), &config);
        assert_tiles(&source, &outcome)?;
    }

    #[test]
    fn text_chunks_cover_document(content in "\\PC{1,600}", max_chars in 1usize..200) {
        prop_assume!(!content.trim().is_empty());

        let mut config = Config::default().chunking;
        config.text_max_chars = max_chars;

        let registry = ChunkerRegistry::new().unwrap();
        let outcome = registry.chunk(&Document::new("t", "t.md", content.clone()), &config);
        assert_tiles(&content, &outcome)?;
    }

    #[test]
    fn fallback_is_deterministic(
        lines in prop::collection::vec(python_line(), 1..60),
        chunk_size in 1usize..30,
    ) {
        let source = lines.join("\n");
        prop_assume!(!source.trim().is_empty());

        let mut config = Config::default().chunking;
        config.chunk_size = chunk_size;
        let document = Document::new("f", "f.unknown", source.clone());
        let fallback = FallbackChunker::new().unwrap();

        let first = fallback.chunk_unknown(&document, "cobol", &config);
        let second = fallback.chunk_unknown(&document, "cobol", &config);
        prop_assert_eq!(&first, &second);
        assert_tiles(&source, &first)?;
    }

    #[test]
    fn hash_embedding_is_idempotent(text in "\\PC{0,300}") {
        let embedder = HashEmbedder::new("hash", 64);
        let first = embedder.embed_text(&text);
        prop_assert_eq!(first.len(), 64);
        prop_assert_eq!(first, embedder.embed_text(&text));
    }

    #[test]
    fn promoting_a_candidate_never_lowers_its_score(
        n in 2usize..30,
        position in 1usize..30,
        weight in 0.0f32..=1.0,
        rotation in 0usize..30,
    ) {
        let position = position % n;
        prop_assume!(position > 0);

        let semantic_ids = ids(n);
        let mut keyword_ids = semantic_ids.clone();
        keyword_ids.rotate_left(rotation % n);
        let keyword = candidates(&keyword_ids);

        let target = semantic_ids[position].clone();
        let before = fused_score(&candidates(&semantic_ids), &keyword, &target, weight);

        let mut promoted = semantic_ids.clone();
        promoted.swap(position, position - 1);
        let after = fused_score(&candidates(&promoted), &keyword, &target, weight);

        prop_assert!(after >= before, "score dropped from {} to {}", before, after);
    }

    #[test]
    fn fused_scores_are_descending(n in 1usize..30, rotation in 0usize..30, weight in 0.0f32..=1.0) {
        let semantic_ids = ids(n);
        let mut keyword_ids = semantic_ids.clone();
        keyword_ids.rotate_left(rotation % n);
        keyword_ids.truncate(n / 2 + 1);

        let config = FusionConfig::new(60.0, weight).unwrap();
        let fused = reciprocal_rank_fusion(
            &candidates(&semantic_ids),
            &candidates(&keyword_ids),
            &config,
        );
        prop_assert_eq!(fused.len(), n);
        for pair in fused.windows(2) {
            prop_assert!(pair[0].score >= pair[1].score);
        }
    }
}

#[tokio::test]
async fn service_embedding_is_idempotent() {
    let config = Config::offline();
    let mut registry = BackendRegistry::new();
    registry.register(Arc::new(HashEmbedder::new("hash-384", 384)));
    let service = EmbeddingService::new(registry, &config.embedding);

    let texts = vec!["fn main() {}".to_string(), "def main(): pass".to_string()];
    let first = service.embed(&texts, None).await.unwrap();
    let cached = service.embed(&texts, None).await.unwrap();
    service.cache().clear();
    let fresh = service.embed(&texts, None).await.unwrap();

    assert_eq!(first, cached);
    assert_eq!(first, fresh);
}

#[tokio::test]
async fn rebuild_preserves_search_results() {
    let collection = Collection::in_memory(Config::offline()).unwrap();
    let documents = [
        ("auth", "auth.py", "def login(user, password):\n    return check(user, password)\n"),
        ("cache", "cache.py", "class Cache:\n    def get(self, key):\n        return self.items[key]\n"),
        ("readme", "README.md", "Login flow and cache invalidation are described here."),
        ("util", "util.js", "function debounce(fn, ms) {\n  return fn;\n}\n"),
    ];
    for (id, uri, text) in documents {
        collection.ingest(Document::new(id, uri, text)).await.unwrap();
    }

    let queries = ["login password", "cache get key", "debounce function", "invalidation"];
    let mut before = Vec::new();
    for query in queries {
        before.push(collection.search(&SearchRequest::new(query, 5)).await.unwrap().results);
    }

    let summary = collection.rebuild().unwrap();
    assert_eq!(summary.chunks, collection.stats().unwrap().store.chunk_count);

    for (query, expected) in queries.iter().zip(before) {
        let after = collection.search(&SearchRequest::new(*query, 5)).await.unwrap().results;
        let ids = |results: &[ragline::retrieval::SearchResult]| {
            results.iter().map(|r| r.chunk_id.clone()).collect::<Vec<_>>()
        };
        assert_eq!(ids(&after), ids(&expected), "query {:?}", query);
    }
}
