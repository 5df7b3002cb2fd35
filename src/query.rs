//! Query pipeline: embed once, retrieve a filtered candidate set, optionally
//! rerank, and return the top-k. Mirrors `semantic_search` in the operation
//! surface.

use crate::embedder::Embedder;
use crate::error::AppResult;
use crate::reranker::Reranker;
use crate::repository::{MetadataFilter, VectorRepository};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct QueryFilters {
    pub source_id: Option<String>,
    pub folder: Option<String>,
    pub tags: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub text: String,
    /// Reranker score when reranking is active, else `1 - distance`. Never
    /// compare scores across the two modes.
    pub similarity: f32,
    pub source_id: String,
    pub file_path: String,
    pub note_title: String,
    pub folder: String,
    pub header_context: String,
    pub chunk_index: usize,
    pub tags: String,
}

pub struct QueryService {
    repo: Arc<VectorRepository>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl QueryService {
    pub fn new(repo: Arc<VectorRepository>, embedder: Arc<dyn Embedder>, reranker: Option<Arc<dyn Reranker>>) -> Self {
        Self {
            repo,
            embedder,
            reranker,
        }
    }

    pub async fn search(&self, query: &str, k: usize, filters: QueryFilters) -> AppResult<Vec<SearchHit>> {
        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await?
            .into_iter()
            .next()
            .unwrap_or_default();

        let factor = if self.reranker.is_some() { 5 } else { 1 };
        let k_fetch = k * factor;

        let filter = MetadataFilter {
            source_id: filters.source_id,
            folder: filters.folder,
            tag: filters.tags,
        };

        let candidates = self.repo.query(&query_vector, k_fetch.max(k), &filter)?;

        let hits = match &self.reranker {
            Some(reranker) => {
                let texts: Vec<String> = candidates.iter().map(|h| h.record.text.clone()).collect();
                let scores = reranker.rerank(query, &texts).await?;
                let mut scored: Vec<(f32, &_)> = scores.into_iter().zip(candidates.iter()).collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                scored
                    .into_iter()
                    .take(k)
                    .map(|(score, hit)| to_search_hit(&hit.record, score))
                    .collect()
            }
            None => candidates
                .iter()
                .take(k)
                .map(|hit| to_search_hit(&hit.record, 1.0 - hit.distance))
                .collect(),
        };

        Ok(hits)
    }
}

fn to_search_hit(record: &crate::repository::ChunkRecord, similarity: f32) -> SearchHit {
    SearchHit {
        text: record.text.clone(),
        similarity,
        source_id: record.source_id.clone(),
        file_path: record.file_path.clone(),
        note_title: record.note_title.clone(),
        folder: record.folder.clone(),
        header_context: record.header_context.clone(),
        chunk_index: record.chunk_index,
        tags: record.tags.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::FakeEmbedder;
    use crate::reranker::FakeReranker;
    use crate::repository::ChunkRecord;
    use tempfile::TempDir;

    fn record(id: &str, tags: &str, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            source_id: "vault".to_string(),
            file_path: format!("{id}.md"),
            note_title: id.to_string(),
            folder: "".to_string(),
            chunk_index: 0,
            header_context: "".to_string(),
            content_hash: "h".to_string(),
            text: text.to_string(),
            token_count: 2,
            tags: tags.to_string(),
            outbound_links: "".to_string(),
        }
    }

    #[tokio::test]
    async fn tag_filter_excludes_non_matching_files() {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(crate::repository::VectorRepository::open(dir.path(), 8, "fake").unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(8));

        for (id, tags, text) in [
            ("work-a", "work", "quarterly goals review"),
            ("work-b", "work", "quarterly planning notes"),
            ("personal-a", "personal", "grocery list"),
        ] {
            let vector = embedder.embed(&[text.to_string()]).await.unwrap().remove(0);
            repo.upsert(vec![(record(id, tags, text), vector)]).unwrap();
        }

        let service = QueryService::new(repo, embedder, Some(Arc::new(FakeReranker)));
        let hits = service
            .search(
                "quarterly goals",
                5,
                QueryFilters {
                    tags: Some("work".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.tags == "work"));
    }
}
