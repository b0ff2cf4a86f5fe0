//! HTTP API surface.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/check/healthy` | liveness probe, `{"result":"ok"}` |
//! | `POST` | `/api/v1/request` | answer a prompt from the corpus |
//! | `POST` | `/api/v1/upload` | multipart upload into the drop directory |
//! | `POST` | `/api/v1/config` | patch the LLM endpoint configuration |
//!
//! # Error contract
//!
//! - malformed JSON bodies → `400 {"code":400,"error":"invalid JSON request"}`
//! - validation failures → `422 {"status":422,"errors":{"prompt":"failed on 'required' tag"}}`
//! - upstream failures (embedder, store, LLM) → `500 {"code":500,"error":...}`
//!
//! CORS is fully permissive: browser clients upload and query directly.

use axum::extract::multipart::Multipart;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::retrieval::{QueryError, RetrievalService};
use crate::store::{LlmConfig, LlmConfigPatch, Store};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub retrieval: Arc<RetrievalService>,
    pub store: Arc<dyn Store>,
    pub drop_dir: PathBuf,
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/check/healthy", get(handle_healthy))
        .route("/api/v1/request", post(handle_request))
        .route("/api/v1/upload", post(handle_upload))
        .route("/api/v1/config", post(handle_config))
        // PDF uploads regularly exceed the 2 MB extractor default.
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the process receives SIGINT.
pub async fn run(addr: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    tracing::info!(%addr, "http server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

// ============ Errors ============

/// Handler-level error that renders the documented contract.
pub enum AppError {
    BadRequest(String),
    Validation(HashMap<String, String>),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    error: String,
}

#[derive(Serialize)]
struct ValidationBody {
    status: u16,
    errors: HashMap<String, String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(ErrorBody {
                    code: StatusCode::BAD_REQUEST.as_u16(),
                    error: message,
                }),
            )
                .into_response(),
            AppError::Validation(errors) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(ValidationBody {
                    status: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
                    errors,
                }),
            )
                .into_response(),
            AppError::Internal(message) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    code: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    error: message,
                }),
            )
                .into_response(),
        }
    }
}

fn bad_request() -> AppError {
    AppError::BadRequest("invalid JSON request".to_string())
}

/// The `validator`-style envelope for a missing required field.
fn required_field(field: &str) -> AppError {
    let mut errors = HashMap::new();
    errors.insert(field.to_string(), "failed on 'required' tag".to_string());
    AppError::Validation(errors)
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::EmptyPrompt => required_field("prompt"),
            other => {
                tracing::error!(error = %other, "query failed");
                AppError::Internal(other.to_string())
            }
        }
    }
}

// ============ GET /check/healthy ============

async fn handle_healthy() -> Json<serde_json::Value> {
    Json(json!({ "result": "ok" }))
}

// ============ POST /api/v1/request ============

/// Request body for `POST /api/v1/request`.
#[derive(Deserialize)]
pub struct QueryRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub use_local: bool,
}

async fn handle_request(
    State(state): State<AppState>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|_| bad_request())?;

    if request.prompt.trim().is_empty() {
        return Err(required_field("prompt"));
    }

    let answer = state
        .retrieval
        .answer(&request.prompt, request.use_local)
        .await?;

    tracing::info!(
        sources = answer.sources.len(),
        confidence = answer.confidence,
        "request answered"
    );
    Ok(Json(answer).into_response())
}

// ============ POST /api/v1/upload ============

async fn handle_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<&'static str>, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| bad_request())?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(|n| n.to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(bad_request)?;
        // Strip any client-supplied directory components.
        let file_name = PathBuf::from(&file_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(bad_request)?;

        let bytes = field
            .bytes()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let dest = state.drop_dir.join(&file_name);
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        tracing::info!(path = %dest.display(), size = bytes.len(), "file uploaded");
        return Ok(Json("ok"));
    }

    Err(bad_request())
}

// ============ POST /api/v1/config ============

async fn handle_config(
    State(state): State<AppState>,
    payload: Result<Json<LlmConfigPatch>, JsonRejection>,
) -> Result<Json<LlmConfig>, AppError> {
    let Json(patch) = payload.map_err(|_| bad_request())?;

    if patch.fields().is_empty() {
        return Err(bad_request());
    }

    let updated = state
        .store
        .set_llm_config(1, &patch)
        .await
        .map_err(|e| AppError::Internal(e.to_string()))?;
    tracing::info!("llm config updated");
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_request_defaults_use_local_to_false() {
        let request: QueryRequest = serde_json::from_str(r#"{"prompt":"x"}"#).unwrap();
        assert_eq!(request.prompt, "x");
        assert!(!request.use_local);
    }

    #[test]
    fn missing_prompt_deserializes_to_empty() {
        let request: QueryRequest = serde_json::from_str(r#"{"use_local":true}"#).unwrap();
        assert!(request.prompt.is_empty());
        assert!(request.use_local);
    }

    #[test]
    fn validation_envelope_names_the_field() {
        let AppError::Validation(errors) = required_field("prompt") else {
            panic!("expected validation error");
        };
        assert_eq!(errors["prompt"], "failed on 'required' tag");
    }
}
