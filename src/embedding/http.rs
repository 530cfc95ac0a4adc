use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{EmbeddingBackend, EmbeddingError, EmbeddingResult};

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Remote inference server speaking the Ollama `/api/embed` protocol
pub struct HttpEmbedder {
    model_id: String,
    remote_model: String,
    endpoint: String,
    dimension: usize,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(
        model_id: &str,
        remote_model: &str,
        base_url: &str,
        dimension: usize,
        timeout_ms: u64,
    ) -> EmbeddingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms.max(1)))
            .build()
            .map_err(|e| EmbeddingError::Initialization {
                model: model_id.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            model_id: model_id.to_string(),
            remote_model: remote_model.to_string(),
            endpoint: format!("{}/api/embed", base_url.trim_end_matches('/')),
            dimension,
            client,
        })
    }

    fn classify(&self, error: reqwest::Error) -> EmbeddingError {
        if error.is_timeout() {
            EmbeddingError::Transient(format!("request to {} timed out", self.endpoint))
        } else if error.is_connect() || error.is_request() {
            EmbeddingError::Transient(format!(
                "connection error (is the server running at {}?): {}",
                self.endpoint, error
            ))
        } else {
            EmbeddingError::Generation(error.to_string())
        }
    }
}

#[async_trait]
impl EmbeddingBackend for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    /// Probe the server with a one-word request
    async fn load(&self) -> EmbeddingResult<()> {
        self.embed_batch(&["ping".to_string()]).await.map(|_| ())
    }

    async fn embed_batch(&self, texts: &[String]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .json(&EmbedRequest {
                model: &self.remote_model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("embedding API error {}: {}", status, body);
            return Err(if status.as_u16() == 429 || status.is_server_error() {
                EmbeddingError::Transient(message)
            } else {
                EmbeddingError::Generation(message)
            });
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Generation(format!("invalid embedding response: {}", e)))?;

        if parsed.embeddings.len() != texts.len() {
            return Err(EmbeddingError::Generation(format!(
                "Embedding count mismatch: expected {}, got {}",
                texts.len(),
                parsed.embeddings.len()
            )));
        }
        if let Some(bad) = parsed.embeddings.iter().find(|v| v.len() != self.dimension) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn embedder(server: &MockServer) -> HttpEmbedder {
        HttpEmbedder::new("remote", "nomic-embed-text", &server.uri(), 3, 2_000).unwrap()
    }

    #[tokio::test]
    async fn test_embeds_via_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .and(body_partial_json(serde_json::json!({"model": "nomic-embed-text"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
            })))
            .mount(&server)
            .await;

        let vectors = embedder(&server)
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[1], vec![0.4, 0.5, 0.6]);
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = embedder(&server)
            .embed_batch(&["a".to_string()])
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_client_errors_are_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .mount(&server)
            .await;

        let err = embedder(&server)
            .embed_batch(&["a".to_string()])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_dimension_checked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"embeddings": [[0.1, 0.2]]})),
            )
            .mount(&server)
            .await;

        let err = embedder(&server)
            .embed_batch(&["a".to_string()])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EmbeddingError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
    }
}
