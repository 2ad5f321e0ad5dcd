//! Embedding service contract and the OpenAI-compatible client.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::OpenAiConfig;
use crate::error::{RagError, RagResult};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model name recorded in the build manifest and cache key.
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>>;

    /// Embeddings for `texts`, in input order.
    async fn embed_batch(&self, texts: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

/// Async client for `POST {base_url}/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &OpenAiConfig) -> RagResult<Self> {
        let client = build_client(&config.api_key, config.timeout_secs)?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.embedding_model.clone(),
            batch_size: config.embedding_batch_size.max(1),
        })
    }

    async fn request(&self, inputs: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        let request = EmbeddingRequest { model: &self.model, input: inputs };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| RagError::EmbeddingService(format!("Request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::EmbeddingService(format!("{status}: {body}")));
        }

        let mut parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| RagError::EmbeddingService(format!("Failed to parse response: {e}")))?;
        parsed.data.sort_by_key(|entry| entry.index);
        if parsed.data.len() != inputs.len() {
            return Err(RagError::EmbeddingService(format!(
                "Service returned {} embeddings for {} inputs",
                parsed.data.len(),
                inputs.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|entry| entry.embedding).collect())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        self.request(&[text])
            .await?
            .pop()
            .ok_or_else(|| RagError::EmbeddingService("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> RagResult<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (n, batch) in texts.chunks(self.batch_size).enumerate() {
            tracing::debug!(batch = n, size = batch.len(), model = %self.model, "Embedding batch");
            vectors.extend(self.request(batch).await?);
        }
        Ok(vectors)
    }
}

/// Client with bearer auth and JSON content type set on every request.
pub(crate) fn build_client(api_key: &str, timeout_secs: u64) -> RagResult<reqwest::Client> {
    if api_key.trim().is_empty() {
        return Err(RagError::Config("missing OpenAI API key".into()));
    }
    let mut headers = HeaderMap::new();
    let auth = format!("Bearer {}", api_key.trim());
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&auth).map_err(|_| RagError::Config("invalid OpenAI API key".into()))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .default_headers(headers)
        .build()
        .map_err(|e| RagError::Internal(format!("HTTP client error: {e}")))
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::serve_mock;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    fn config(base_url: String, batch_size: usize) -> OpenAiConfig {
        OpenAiConfig {
            api_key: "sk-test".into(),
            base_url,
            embedding_batch_size: batch_size,
            ..OpenAiConfig::default()
        }
    }

    /// Echoes each input's length as a 1-d vector, listing entries in reverse order.
    async fn reversed_lengths(headers: AxumHeaders, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
        }
        let inputs = body["input"].as_array().cloned().unwrap_or_default();
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .rev()
            .map(|(i, s)| json!({"index": i, "embedding": [s.as_str().unwrap_or("").len() as f32]}))
            .collect();
        (StatusCode::OK, Json(json!({"data": data})))
    }

    #[test]
    fn test_missing_api_key() {
        let config = OpenAiConfig::default();
        assert!(matches!(OpenAiEmbedder::new(&config), Err(RagError::Config(_))));
    }

    #[tokio::test]
    async fn test_embed_batch_ordered_by_index() {
        let base = serve_mock(Router::new().route("/embeddings", post(reversed_lengths))).await;
        let embedder = OpenAiEmbedder::new(&config(base, 2)).unwrap();
        let vectors = embedder.embed_batch(&["a", "bbb", "cc", "dddd", "e"]).await.unwrap();
        assert_eq!(vectors, vec![vec![1.0], vec![3.0], vec![2.0], vec![4.0], vec![1.0]]);
        assert_eq!(embedder.embed("xyz").await.unwrap(), vec![3.0]);
    }

    #[tokio::test]
    async fn test_service_error_status() {
        let router = Router::new().route(
            "/embeddings",
            post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
        );
        let base = serve_mock(router).await;
        let embedder = OpenAiEmbedder::new(&config(base, 8)).unwrap();
        let err = embedder.embed("text").await.unwrap_err();
        assert!(matches!(err, RagError::EmbeddingService(ref m) if m.contains("429")));
    }

    #[tokio::test]
    async fn test_count_mismatch_rejected() {
        let router = Router::new().route(
            "/embeddings",
            post(|| async { Json(json!({"data": [{"index": 0, "embedding": [1.0]}]})) }),
        );
        let base = serve_mock(router).await;
        let embedder = OpenAiEmbedder::new(&config(base, 8)).unwrap();
        assert!(embedder.embed_batch(&["a", "b"]).await.is_err());
    }
}
