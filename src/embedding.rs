//! Embedding provider abstraction and the HTTP implementation.
//!
//! [`Embedder`] is the seam the chunker and the retrieval service depend
//! on; [`OllamaEmbedder`] implements it against an Ollama-compatible
//! `/api/embeddings` endpoint (`POST {model, prompt}` →
//! `{embedding: [float]}`).
//!
//! Returned vectors are L2-normalised before being handed back, so cosine
//! and inner-product orderings agree and the retrieval threshold stays
//! meaningful. The normalised vector is the one returned, not a copy of
//! the raw response.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Per-call wall-clock limit for the embedding service.
const EMBED_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised by embedding providers.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Empty input cannot be embedded.
    #[error("embedding input must not be empty")]
    EmptyInput,
    /// The provider was unreachable or answered with a failure status.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
    /// The provider returned a vector of the wrong length.
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Produce a unit-norm embedding vector for the supplied text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

/// Embedding client for an Ollama-compatible endpoint.
pub struct OllamaEmbedder {
    http: reqwest::Client,
    url: String,
    model: String,
    dimension: usize,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(url: String, model: String, dimension: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            model,
            dimension,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }

        let response = self
            .http
            .post(&self.url)
            .timeout(EMBED_TIMEOUT)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::ModelUnavailable(format!(
                "status {status}: {body}"
            )));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::ModelUnavailable(e.to_string()))?;

        if body.embedding.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                got: body.embedding.len(),
            });
        }

        let mut vector = body.embedding;
        normalize(&mut vector);
        Ok(vector)
    }
}

/// L2-normalise a vector in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn l2(v: &[f32]) -> f32 {
        v.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    #[test]
    fn normalize_produces_unit_norm() {
        let mut v = vec![3.0, 4.0];
        normalize(&mut v);
        assert!((l2(&v) - 1.0).abs() < 1e-5);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn normalize_leaves_zero_vector_alone() {
        let mut v = vec![0.0, 0.0, 0.0];
        normalize(&mut v);
        assert_eq!(v, vec![0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn embed_returns_normalised_vector() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(200)
                    .json_body(json!({ "embedding": [3.0, 0.0, 4.0] }));
            })
            .await;

        let embedder = OllamaEmbedder::new(
            format!("{}/api/embeddings", server.base_url()),
            "bge-m3".to_string(),
            3,
        );
        let vector = embedder.embed("hello").await.expect("embedding");
        assert!((l2(&vector) - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn embed_rejects_empty_input() {
        let embedder = OllamaEmbedder::new("http://localhost:1/x".to_string(), "m".to_string(), 3);
        let err = embedder.embed("   ").await.expect_err("empty input");
        assert!(matches!(err, EmbeddingError::EmptyInput));
    }

    #[tokio::test]
    async fn embed_surfaces_error_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(500).body("boom");
            })
            .await;

        let embedder = OllamaEmbedder::new(
            format!("{}/api/embeddings", server.base_url()),
            "bge-m3".to_string(),
            3,
        );
        let err = embedder.embed("hello").await.expect_err("server error");
        assert!(matches!(err, EmbeddingError::ModelUnavailable(_)));
    }

    #[tokio::test]
    async fn embed_checks_dimension() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/embeddings");
                then.status(200).json_body(json!({ "embedding": [1.0, 2.0] }));
            })
            .await;

        let embedder = OllamaEmbedder::new(
            format!("{}/api/embeddings", server.base_url()),
            "bge-m3".to_string(),
            4,
        );
        let err = embedder.embed("hello").await.expect_err("short vector");
        assert!(matches!(
            err,
            EmbeddingError::DimensionMismatch { expected: 4, got: 2 }
        ));
    }
}
