//! Cross-encoder reranker: `rerank(query, docs) -> scores`. Scores are an
//! implementation-defined floating scale (sometimes negative); callers must
//! never compare them against distance-based similarity from the vector
//! repository (see the query service's mode note).

use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>>;
    fn model_id(&self) -> &str;
}

/// Remote cross-encoder HTTP client. Default model
/// `ms-marco-TinyBERT-L-2-v2`, per the configuration table.
pub struct RemoteReranker {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl RemoteReranker {
    pub fn new(model: String, endpoint: Option<String>) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| AppError::Config(format!("failed to build rerank HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.unwrap_or_else(|| "http://127.0.0.1:8787/rerank".to_string()),
            model,
        })
    }

    async fn rerank_once(&self, query: &str, documents: &[String]) -> Result<Vec<f32>, String> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&RerankRequest {
                model: &self.model,
                query,
                documents,
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err("quota_exhausted".to_string());
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("upstream returned {status}: {body}"));
        }

        let parsed: RerankResponse = response.json().await.map_err(|e| e.to_string())?;
        let mut results = parsed.results;
        results.sort_by_key(|r| r.index);
        Ok(results.into_iter().map(|r| r.score).collect())
    }
}

#[async_trait]
impl Reranker for RemoteReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        const MAX_ATTEMPTS: u32 = 3;
        let mut backoff = Duration::from_secs(1);
        let mut last_err = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.rerank_once(query, documents).await {
                Ok(scores) => return Ok(scores),
                Err(e) if e == "quota_exhausted" => {
                    return Err(AppError::QuotaExhausted(format!(
                        "rerank model '{}' reports quota exhaustion",
                        self.model
                    )));
                }
                Err(e) => {
                    warn!(attempt, error = %e, "rerank request failed, retrying");
                    last_err = e;
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(AppError::UpstreamUnavailable(format!(
            "rerank model '{}' unavailable after {MAX_ATTEMPTS} attempts: {last_err}",
            self.model
        )))
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    score: f32,
}

/// Deterministic reranker for tests: scores by token overlap with the query,
/// so relative ordering is predictable without a network dependency.
pub struct FakeReranker;

#[async_trait]
impl Reranker for FakeReranker {
    async fn rerank(&self, query: &str, documents: &[String]) -> AppResult<Vec<f32>> {
        let query_tokens: std::collections::HashSet<&str> = query.split_whitespace().collect();
        Ok(documents
            .iter()
            .map(|doc| {
                let doc_tokens: std::collections::HashSet<&str> = doc.split_whitespace().collect();
                query_tokens.intersection(&doc_tokens).count() as f32
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        "fake-reranker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_reranker_ranks_overlap_higher() {
        let reranker = FakeReranker;
        let scores = reranker
            .rerank(
                "quarterly goals",
                &["no overlap here".to_string(), "quarterly goals review".to_string()],
            )
            .await
            .unwrap();
        assert!(scores[1] > scores[0]);
    }
}
