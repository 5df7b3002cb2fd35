//! Embedding client: a trait around `embed(texts) -> vectors`, with a
//! concrete remote HTTP implementation. The transport itself — the
//! embedding-model HTTP client — is treated as an external collaborator; what
//! lives here is the retry/backoff policy and batching contract the indexer
//! depends on.

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>>;
    fn dimensions(&self) -> usize;
    fn model_id(&self) -> &str;
}

/// OpenAI-embeddings-style remote client (`embedding.model`/`embedding.api_key`
/// from configuration). Retries with exponential backoff (base 1s, factor 2,
/// 3 attempts) per the timeout/backoff policy; exhaustion surfaces as
/// `UpstreamUnavailable`.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    dimensions: usize,
}

impl RemoteEmbedder {
    pub fn new(model: String, api_key: Option<String>, endpoint: Option<String>, dimensions: usize) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build embedding HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| "https://api.openai.com/v1/embeddings".to_string()),
            model,
            api_key,
            dimensions,
        })
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, String> {
        let mut request = self.client.post(&self.endpoint).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err("quota_exhausted".to_string());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("upstream returned {status}: {body}"));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|e| e.to_string())?;
        let mut data = parsed.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        const MAX_ATTEMPTS: u32 = 3;
        let mut backoff = Duration::from_secs(1);
        let mut last_err = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.embed_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e == "quota_exhausted" => {
                    return Err(AppError::QuotaExhausted(format!(
                        "embedding model '{}' reports quota exhaustion",
                        self.model
                    )));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "embedding request failed, retrying");
                    last_err = e;
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(AppError::UpstreamUnavailable(format!(
            "embedding model '{}' unavailable after {MAX_ATTEMPTS} attempts: {last_err}",
            self.model
        )))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    index: usize,
}

/// Deterministic embedder for tests: hashes each text into a fixed-size
/// vector so equality/near-equality of inputs is preserved without a network
/// dependency (see the dependency-wiring design note).
pub struct FakeEmbedder {
    dimensions: usize,
}

impl FakeEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, texts: &[String]) -> AppResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| deterministic_vector(t, self.dimensions)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_id(&self) -> &str {
        "fake-embedder"
    }
}

fn deterministic_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let digest = md5::compute(text.as_bytes());
    let mut vector = vec![0f32; dimensions];
    for (i, slot) in vector.iter_mut().enumerate() {
        *slot = digest[i % digest.len()] as f32 / 255.0;
    }
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_embedder_is_deterministic() {
        let embedder = FakeEmbedder::new(8);
        let a = embedder.embed(&["hello".to_string()]).await.unwrap();
        let b = embedder.embed(&["hello".to_string()]).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn fake_embedder_differs_on_different_text() {
        let embedder = FakeEmbedder::new(8);
        let a = embedder.embed(&["hello".to_string()]).await.unwrap();
        let b = embedder.embed(&["world".to_string()]).await.unwrap();
        assert_ne!(a, b);
    }
}
