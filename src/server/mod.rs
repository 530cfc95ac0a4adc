//! JSON HTTP service over a [`Collection`].
//!
//! | Method   | Path                   | Description                          |
//! |----------|------------------------|--------------------------------------|
//! | `POST`   | `/v1/ingest`           | Ingest documents, NDJSON event stream |
//! | `POST`   | `/v1/search`           | Hybrid, semantic or keyword search   |
//! | `GET`    | `/v1/config`           | Current configuration                |
//! | `PUT`    | `/v1/config`           | Validate and apply a configuration   |
//! | `DELETE` | `/v1/documents/{id}`   | Remove a document and its chunks     |
//! | `POST`   | `/v1/rebuild`          | Rebuild both indexes from the store  |
//! | `GET`    | `/v1/stats`            | Collection statistics                |
//! | `GET`    | `/health`              | Liveness and version                 |
//!
//! Errors share one body shape:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::collection::{Collection, CollectionStats};
use crate::config::Config;
use crate::embedding::EmbeddingError;
use crate::error::{RaglineError, Result, ValidationError};
use crate::ingest::{IngestError, RebuildSummary};
use crate::model::Document;
use crate::retrieval::{RetrievalError, SearchRequest, SearchResponse};
use crate::store::StoreError;

/// Build the router; every handler shares `collection`
pub fn router(collection: Arc<Collection>) -> Router {
    Router::new()
        .route("/v1/ingest", post(handle_ingest))
        .route("/v1/search", post(handle_search))
        .route("/v1/config", get(handle_get_config).put(handle_put_config))
        .route("/v1/documents/{id}", delete(handle_delete_document))
        .route("/v1/rebuild", post(handle_rebuild))
        .route("/v1/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(collection)
}

/// Serve on `bind` until Ctrl-C
pub async fn serve(collection: Arc<Collection>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| RaglineError::Io {
            source: e,
            context: format!("Failed to bind {}", bind),
        })?;
    info!("Listening on http://{}", bind);

    axum::serve(listener, router(collection))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        })
        .await
        .map_err(|e| RaglineError::Io {
            source: e,
            context: "Server error".to_string(),
        })
}

// ============ Errors ============

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    details: Vec<ValidationError>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Vec<ValidationError>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: Vec::new(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<RaglineError> for ApiError {
    fn from(error: RaglineError) -> Self {
        let message = error.to_string();
        match error {
            RaglineError::ConfigValidation { errors } => Self {
                details: errors,
                ..Self::new(StatusCode::BAD_REQUEST, "invalid_config", message)
            },
            RaglineError::Ingest(IngestError::InvalidDocument { errors, .. }) => Self {
                details: errors,
                ..Self::bad_request(message)
            },
            RaglineError::InvalidInput(_)
            | RaglineError::InvalidConfigValue { .. }
            | RaglineError::Retrieval(RetrievalError::InvalidQuery(_))
            | RaglineError::Embedding(EmbeddingError::InvalidInput(_)) => {
                Self::bad_request(message)
            }
            RaglineError::DocumentNotFound { .. }
            | RaglineError::Ingest(IngestError::DocumentNotFound(_))
            | RaglineError::Store(StoreError::MissingDocument(_)) => {
                Self::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            RaglineError::Retrieval(RetrievalError::BackendUnavailable(_))
            | RaglineError::Embedding(EmbeddingError::ModelUnavailable { .. })
            | RaglineError::Embedding(EmbeddingError::Timeout(_))
            | RaglineError::Embedding(EmbeddingError::Transient(_)) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
            }
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!("Request failed: {}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Handlers ============

/// A single document or a batch
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IngestBody {
    Batch(Vec<Document>),
    Single(Box<Document>),
}

/// Streams one JSON line per [`crate::ingest::IngestEvent`]. Dropping the
/// connection cancels documents that have not started yet.
async fn handle_ingest(
    State(collection): State<Arc<Collection>>,
    Json(body): Json<IngestBody>,
) -> ApiResult<Response> {
    let documents = match body {
        IngestBody::Batch(documents) => documents,
        IngestBody::Single(document) => vec![*document],
    };
    if documents.is_empty() {
        return Err(ApiError::bad_request("no documents to ingest"));
    }

    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let events = collection.ingest_stream(documents, cancel);

    let lines = events.map(move |event| {
        let _connection = &guard;
        let mut line = serde_json::to_string(&event).unwrap_or_else(|e| {
            serde_json::json!({"type": "failed", "document_id": event.document_id(), "error": e.to_string()})
                .to_string()
        });
        line.push('\n');
        Ok::<_, Infallible>(line)
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}

async fn handle_search(
    State(collection): State<Arc<Collection>>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    Ok(Json(collection.search(&request).await?))
}

async fn handle_get_config(State(collection): State<Arc<Collection>>) -> Json<Config> {
    Json((*collection.config()).clone())
}

async fn handle_put_config(
    State(collection): State<Arc<Collection>>,
    Json(config): Json<Config>,
) -> ApiResult<Json<Config>> {
    let applied = collection.update_config(config)?;
    Ok(Json((*applied).clone()))
}

#[derive(Debug, Serialize)]
struct DeleteResponse {
    document_id: String,
    removed_chunks: usize,
}

async fn handle_delete_document(
    State(collection): State<Arc<Collection>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    let removed_chunks = collection.remove(&id)?;
    Ok(Json(DeleteResponse {
        document_id: id,
        removed_chunks,
    }))
}

async fn handle_rebuild(
    State(collection): State<Arc<Collection>>,
) -> ApiResult<Json<RebuildSummary>> {
    Ok(Json(collection.rebuild()?))
}

async fn handle_stats(
    State(collection): State<Arc<Collection>>,
) -> ApiResult<Json<CollectionStats>> {
    Ok(Json(collection.stats()?))
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    model: String,
}

async fn handle_health(State(collection): State<Arc<Collection>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        model: collection.model().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<Collection>) {
        let collection = Arc::new(Collection::in_memory(Config::offline()).unwrap());
        (router(collection.clone()), collection)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_ingest_streams_summary_per_document() {
        let (app, _) = app();
        let body = serde_json::json!([
            {"id": "a", "source_uri": "a.py", "raw_text": "def add(a, b):\n    return a + b\n"},
            {"id": "b", "source_uri": "b.md", "raw_text": "Notes about subtraction."}
        ]);
        let response = app
            .oneshot(json_request("POST", "/v1/ingest", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/x-ndjson"
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let events: Vec<serde_json::Value> = String::from_utf8(bytes.to_vec())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        let summaries: Vec<_> = events.iter().filter(|e| e["type"] == "summary").collect();
        assert_eq!(summaries.len(), 2);
        for summary in summaries {
            assert!(summary["chunk_count"].as_u64().unwrap() >= 1);
            assert_eq!(summary["failed_chunk_ids"], serde_json::json!([]));
        }
    }

    #[tokio::test]
    async fn test_search_and_validation_errors() {
        let (app, collection) = app();
        collection
            .ingest(Document::new("math", "math.py", "def add(a, b):\n    return a + b\n"))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/search",
                serde_json::json!({"query": "add numbers", "k": 3}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["results"][0]["document_id"], "math");
        assert_eq!(body["degraded"], false);

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/search",
                serde_json::json!({"query": "add", "semantic_weight": 1.5}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"]["code"], "bad_request");
    }

    #[tokio::test]
    async fn test_delete_unknown_document_is_not_found() {
        let (app, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/v1/documents/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "not_found");
    }

    #[tokio::test]
    async fn test_config_update_is_validated() {
        let (app, collection) = app();

        let mut config = serde_json::to_value(&*collection.config()).unwrap();
        config["search"]["semantic_weight"] = serde_json::json!(3.0);
        let response = app
            .clone()
            .oneshot(json_request("PUT", "/v1/config", config))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "invalid_config");
        assert_eq!(body["error"]["details"][0]["path"], "search.semantic_weight");

        let mut config = serde_json::to_value(&*collection.config()).unwrap();
        config["search"]["rrf_k"] = serde_json::json!(15.0);
        let response = app
            .oneshot(json_request("PUT", "/v1/config", config))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(collection.config().search.rrf_k, 15.0);
    }

    #[tokio::test]
    async fn test_stats_and_rebuild() {
        let (app, collection) = app();
        collection
            .ingest(Document::new("notes", "notes.md", "Some notes."))
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/rebuild")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["chunks"], 1);

        let response = app
            .oneshot(Request::builder().uri("/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["store"]["document_count"], 1);
    }
}
