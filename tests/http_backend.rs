//! A collection backed by a remote embedding server

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use ragline::config::{Config, ModelConfig};
use ragline::embedding::HashEmbedder;
use ragline::ingest::IngestStatus;
use ragline::model::Document;
use ragline::retrieval::{SearchMode, SearchRequest};
use ragline::Collection;

const DIMENSION: usize = 32;

/// Answers `/api/embed` with hash embeddings of the submitted inputs
struct HashServer;

impl Respond for HashServer {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = match request.body_json() {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let embedder = HashEmbedder::new("remote", DIMENSION);
        let embeddings: Vec<Vec<f32>> = body["input"]
            .as_array()
            .map(|inputs| {
                inputs
                    .iter()
                    .map(|t| embedder.embed_text(t.as_str().unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "embeddings": embeddings }))
    }
}

fn remote_config(server: &MockServer) -> Config {
    let mut config = Config::offline();
    config.embedding.default_model = "remote".to_string();
    config.embedding.models = vec![ModelConfig {
        id: "remote".to_string(),
        backend: "http".to_string(),
        dimension: DIMENSION,
        url: Some(server.uri()),
        remote_model: Some("nomic-embed-text".to_string()),
    }];
    config.embedding.requests_per_second = 0.0;
    config.embedding.max_retries = 1;
    config.embedding.retry_base_ms = 1;
    config.embedding.failure_threshold = 2;
    config.ingest.max_chunk_retries = 0;
    config.ingest.retry_backoff_ms = 1;
    config
}

#[tokio::test]
async fn ingest_and_search_through_remote_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(HashServer)
        .mount(&server)
        .await;

    let collection = Collection::in_memory(remote_config(&server)).unwrap();
    collection.warm_up().await.unwrap();

    let summary = collection
        .ingest(Document::new(
            "net",
            "net.py",
            "def open_socket(host, port):\n    return connect(host, port)\n",
        ))
        .await
        .unwrap();
    assert_eq!(summary.status, IngestStatus::Complete);

    let response = collection
        .search(&SearchRequest::new("open socket", 3).with_mode(SearchMode::Semantic))
        .await
        .unwrap();
    assert_eq!(response.results[0].document_id, "net");
    assert!(response.results[0].source_scores.semantic.is_some());
}

#[tokio::test]
async fn failing_server_degrades_to_keywords() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let collection = Collection::in_memory(remote_config(&server)).unwrap();
    assert!(collection.warm_up().await.is_err());

    let summary = collection
        .ingest(Document::new(
            "net",
            "net.py",
            "def open_socket(host, port):\n    return connect(host, port)\n",
        ))
        .await
        .unwrap();
    assert_eq!(summary.status, IngestStatus::Partial);
    assert_eq!(summary.failed_chunk_ids, summary.chunks);

    let response = collection
        .search(&SearchRequest::new("open socket", 3))
        .await
        .unwrap();
    assert!(response.degraded);
    assert_eq!(response.results[0].document_id, "net");
    assert!(response.results[0].source_scores.semantic.is_none());

    // Nothing left to fall back on
    let semantic_only = SearchRequest::new("open socket", 3).with_mode(SearchMode::Semantic);
    assert!(collection.search(&semantic_only).await.is_err());
}
