//! The query pipeline and indexing/analytics operations: `semantic_search`,
//! `reindex_vault`, `index_note`, `get_index_stats`, `suggest_links`, and the
//! link-graph analytics (`get_orphaned_notes`, `get_most_linked_notes`,
//! `get_duplicate_content`) from the operation surface, §6.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::AppResult;
use crate::query::QueryFilters;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SemanticSearchRequest {
    pub query: String,
    #[serde(default = "default_n_results")]
    pub n_results: usize,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(default)]
    pub tags: Option<String>,
}

fn default_n_results() -> usize {
    10
}

#[instrument(skip(state, req), fields(query = %req.query, n = req.n_results))]
pub async fn semantic_search(
    State(state): State<AppState>,
    Json(req): Json<SemanticSearchRequest>,
) -> AppResult<Json<Vec<crate::query::SearchHit>>> {
    if req.query.trim().is_empty() {
        return Err(crate::error::AppError::BadRequest("query must not be empty".to_string()));
    }
    if req.query.len() > crate::config::MAX_SEARCH_QUERY_LENGTH {
        return Err(crate::error::AppError::BadRequest(format!(
            "query exceeds maximum length of {} characters",
            crate::config::MAX_SEARCH_QUERY_LENGTH
        )));
    }
    let filters = QueryFilters {
        source_id: req.source,
        folder: req.folder,
        tags: req.tags,
    };
    let hits = state.query_service.search(&req.query, req.n_results.max(1), filters).await?;
    Ok(Json(hits))
}

#[derive(Debug, Deserialize, Default)]
pub struct ReindexRequest {
    #[serde(default)]
    pub force: bool,
}

#[instrument(skip(state))]
pub async fn reindex_vault(
    State(state): State<AppState>,
    Json(req): Json<ReindexRequest>,
) -> AppResult<Json<crate::indexer::IndexAllResult>> {
    let _ = state.event_tx.send(crate::state::ServerEvent::ReindexStarted);
    let result = state.indexer.index_all(req.force).await?;
    let _ = state.event_tx.send(crate::state::ServerEvent::ReindexCompleted {
        processed: result.processed,
        chunks_created: result.chunks_created,
        duration_ms: result.duration_ms,
    });
    Ok(Json(result))
}

#[derive(Debug, Deserialize)]
pub struct NotePathRequest {
    pub source: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct IndexNoteResponse {
    pub success: bool,
    pub chunks: usize,
    pub skipped: bool,
}

#[instrument(skip(state), fields(source = %req.source, path = %req.path))]
pub async fn index_note(
    State(state): State<AppState>,
    Json(req): Json<NotePathRequest>,
) -> AppResult<Json<IndexNoteResponse>> {
    let result = state.indexer.index_single(&req.source, &req.path).await?;
    Ok(Json(IndexNoteResponse {
        success: true,
        chunks: result.chunks_indexed,
        skipped: result.skipped,
    }))
}

#[derive(Debug, Serialize)]
pub struct IndexStatsResponse {
    pub chunks: usize,
    pub files: usize,
    pub model: String,
    pub sources: usize,
    pub rerank_enabled: bool,
    pub watch_enabled: bool,
}

pub async fn get_index_stats(State(state): State<AppState>) -> AppResult<Json<IndexStatsResponse>> {
    let stats = state.repo.stats();
    Ok(Json(IndexStatsResponse {
        chunks: stats.chunk_count,
        files: stats.file_count,
        model: stats.embedding_model,
        sources: state.sources.iter().count(),
        rerank_enabled: state.reranker.is_some(),
        watch_enabled: state.config.watch.enabled,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SuggestLinksRequest {
    pub source: String,
    pub path: String,
    #[serde(default = "default_suggest_n")]
    pub n: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_exclude_current")]
    pub exclude_current: bool,
}

fn default_suggest_n() -> usize {
    5
}

fn default_min_similarity() -> f32 {
    0.5
}

fn default_exclude_current() -> bool {
    true
}

#[instrument(skip(state, req), fields(source = %req.source, path = %req.path))]
pub async fn suggest_links(
    State(state): State<AppState>,
    Json(req): Json<SuggestLinksRequest>,
) -> AppResult<Json<Vec<crate::link_analytics::LinkSuggestion>>> {
    let suggestions = state
        .link_analytics
        .suggest_links(&req.source, &req.path, req.n, req.min_similarity, req.exclude_current)
        .await?;
    Ok(Json(suggestions))
}

#[derive(Debug, Serialize)]
pub struct OrphanedNote {
    pub source: String,
    pub path: String,
}

pub async fn get_orphaned_notes(State(state): State<AppState>) -> AppResult<Json<Vec<OrphanedNote>>> {
    let orphans = state
        .link_analytics
        .orphans()
        .into_iter()
        .map(|(source, path)| OrphanedNote { source, path })
        .collect();
    Ok(Json(orphans))
}

#[derive(Debug, Deserialize)]
pub struct MostLinkedQuery {
    #[serde(default = "default_most_linked_n")]
    pub n: usize,
}

fn default_most_linked_n() -> usize {
    20
}

#[derive(Debug, Serialize)]
pub struct MostLinkedEntry {
    pub title: String,
    pub count: usize,
}

pub async fn get_most_linked_notes(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<MostLinkedQuery>,
) -> AppResult<Json<Vec<MostLinkedEntry>>> {
    let ranked = state
        .link_analytics
        .most_linked(q.n)
        .into_iter()
        .map(|(title, count)| MostLinkedEntry { title, count })
        .collect();
    Ok(Json(ranked))
}

#[derive(Debug, Deserialize)]
pub struct DuplicatesQuery {
    #[serde(default = "default_duplicate_threshold")]
    pub threshold: f32,
}

fn default_duplicate_threshold() -> f32 {
    0.95
}

pub async fn get_duplicate_content(
    State(state): State<AppState>,
    axum::extract::Query(q): axum::extract::Query<DuplicatesQuery>,
) -> AppResult<Json<Vec<crate::link_analytics::DuplicatePair>>> {
    let pairs = state.link_analytics.duplicates(q.threshold);
    Ok(Json(pairs))
}
