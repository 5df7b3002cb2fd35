//! Direct note CRUD plus filename search and directory-tree listing:
//! `read_note`, `write_note`, `append_to_note`, `delete_note`,
//! `search_notes`, `get_vault_structure` from the operation surface, §6.
//! Write operations validate the resolved path stays under the source root;
//! writes additionally re-run the indexing pipeline so the vector repository
//! never drifts from what's on disk.

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::metadata;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReadNoteRequest {
    pub source: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct NoteMetadata {
    pub note_title: String,
    pub folder: String,
    pub tags: Vec<String>,
    pub outbound_links: Vec<String>,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct ReadNoteResponse {
    pub content: String,
    pub metadata: NoteMetadata,
}

#[instrument(skip(state), fields(source = %req.source, path = %req.path))]
pub async fn read_note(
    State(state): State<AppState>,
    Json(req): Json<ReadNoteRequest>,
) -> AppResult<Json<ReadNoteResponse>> {
    let source = state.sources.get(&req.source)?;
    let absolute = source.validate_path(&req.path)?;
    if !absolute.is_file() {
        return Err(AppError::NotFound(req.path.clone()));
    }

    let content = tokio::fs::read_to_string(&absolute).await?;
    let fs_meta = tokio::fs::metadata(&absolute).await?;
    let extracted = metadata::extract(&content);

    Ok(Json(ReadNoteResponse {
        metadata: NoteMetadata {
            note_title: metadata::note_title(&req.path),
            folder: metadata::folder(&req.path),
            tags: extracted.tags,
            outbound_links: extracted.outbound_links,
            size: fs_meta.len(),
            modified: fs_meta.modified().ok().map(DateTime::from),
        },
        content,
    }))
}

#[derive(Debug, Deserialize)]
pub struct WriteNoteRequest {
    pub source: String,
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub create_dirs: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteNoteResponse {
    pub created: bool,
    pub size: usize,
    pub chunks: usize,
}

#[instrument(skip(state, req), fields(source = %req.source, path = %req.path))]
pub async fn write_note(
    State(state): State<AppState>,
    Json(req): Json<WriteNoteRequest>,
) -> AppResult<Json<WriteNoteResponse>> {
    let source = state.sources.get(&req.source)?;
    let absolute = source.resolve_new_path(&req.path)?;
    let created = !absolute.exists();

    if let Some(parent) = absolute.parent() {
        if req.create_dirs {
            tokio::fs::create_dir_all(parent).await?;
        } else if !parent.exists() {
            return Err(AppError::NotFound(format!("parent directory of '{}'", req.path)));
        }
    }

    tokio::fs::write(&absolute, &req.content).await?;
    let size = req.content.len();
    let index_result = state.indexer.index_single(&req.source, &req.path).await?;

    info!(path = %req.path, size, created, "note written");
    let _ = state.event_tx.send(crate::state::ServerEvent::FileIndexed {
        source_id: req.source,
        path: req.path,
        chunks: index_result.chunks_indexed,
    });

    Ok(Json(WriteNoteResponse {
        created,
        size,
        chunks: index_result.chunks_indexed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AppendNoteRequest {
    pub source: String,
    pub path: String,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct AppendNoteResponse {
    pub size: usize,
    pub chunks: usize,
}

#[instrument(skip(state, req), fields(source = %req.source, path = %req.path))]
pub async fn append_to_note(
    State(state): State<AppState>,
    Json(req): Json<AppendNoteRequest>,
) -> AppResult<Json<AppendNoteResponse>> {
    let source = state.sources.get(&req.source)?;
    let absolute = source.resolve_new_path(&req.path)?;

    let mut combined = match tokio::fs::read_to_string(&absolute).await {
        Ok(existing) => existing,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    combined.push_str(&req.content);

    if let Some(parent) = absolute.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&absolute, &combined).await?;
    let size = combined.len();
    let index_result = state.indexer.index_single(&req.source, &req.path).await?;

    Ok(Json(AppendNoteResponse {
        size,
        chunks: index_result.chunks_indexed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteNoteRequest {
    pub source: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct DeleteNoteResponse {
    pub deleted: bool,
}

/// Removes from the repository then from disk (R3: a second call on an
/// already-deleted note returns `NotFound`, with no further side effects).
#[instrument(skip(state), fields(source = %req.source, path = %req.path))]
pub async fn delete_note(
    State(state): State<AppState>,
    Json(req): Json<DeleteNoteRequest>,
) -> AppResult<Json<DeleteNoteResponse>> {
    let source = state.sources.get(&req.source)?;
    let absolute = source.validate_path(&req.path)?;
    if !absolute.is_file() {
        return Err(AppError::NotFound(req.path.clone()));
    }

    state.indexer.remove_file(&req.source, &req.path).await?;
    tokio::fs::remove_file(&absolute).await?;

    info!(path = %req.path, "note deleted");
    Ok(Json(DeleteNoteResponse { deleted: true }))
}

#[derive(Debug, Deserialize)]
pub struct SearchNotesRequest {
    #[serde(default)]
    pub source: Option<String>,
    pub pattern: String,
    #[serde(default)]
    pub root: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NotePathResult {
    pub source: String,
    pub path: String,
}

/// Filename/path search, distinct from `semantic_search`: a case-insensitive
/// substring match over each source's discovered file paths.
#[instrument(skip(state), fields(pattern = %req.pattern))]
pub async fn search_notes(
    State(state): State<AppState>,
    Json(req): Json<SearchNotesRequest>,
) -> AppResult<Json<Vec<NotePathResult>>> {
    let pattern_lower = req.pattern.to_lowercase();
    let root_prefix = req.root.as_deref().unwrap_or("");

    let mut results = Vec::new();
    for source in state.sources.iter() {
        if let Some(only) = &req.source {
            if &source.id != only {
                continue;
            }
        }
        for path in source.discover_files()? {
            if !root_prefix.is_empty() && !path.starts_with(root_prefix) {
                continue;
            }
            if path.to_lowercase().contains(&pattern_lower) {
                results.push(NotePathResult {
                    source: source.id.clone(),
                    path,
                });
            }
        }
    }
    Ok(Json(results))
}

#[derive(Debug, Deserialize)]
pub struct VaultStructureRequest {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default = "default_tree_depth")]
    pub depth: usize,
}

fn default_tree_depth() -> usize {
    3
}

#[derive(Debug, Serialize)]
pub struct TreeNode {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

/// Builds a nested directory tree. With no `source` given, the top level is
/// one node per configured source; with `source` given, the tree starts at
/// that source's root (or `root`, if also given).
#[instrument(skip(state))]
pub async fn get_vault_structure(
    State(state): State<AppState>,
    Json(req): Json<VaultStructureRequest>,
) -> AppResult<Json<Vec<TreeNode>>> {
    if let Some(source_id) = &req.source {
        let source = state.sources.get(source_id)?;
        let start = match &req.root {
            Some(root) if !root.is_empty() => source.validate_path(root)?,
            _ => source.root_path.clone(),
        };
        let mut node = build_tree(&start, &source.root_path, req.depth)?;
        node.name = source.display_name.clone();
        return Ok(Json(vec![node]));
    }

    let mut roots = Vec::new();
    for source in state.sources.iter() {
        let mut node = build_tree(&source.root_path, &source.root_path, req.depth)?;
        node.name = source.display_name.clone();
        roots.push(node);
    }
    Ok(Json(roots))
}

fn build_tree(dir: &std::path::Path, root: &std::path::Path, depth_remaining: usize) -> AppResult<TreeNode> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.to_string_lossy().to_string());
    let relative = dir
        .strip_prefix(root)
        .unwrap_or(dir)
        .to_string_lossy()
        .replace('\\', "/");

    let mut children = Vec::new();
    if depth_remaining > 0 {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().to_string();
            if crate::config::is_excluded_directory(&file_name) || file_name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                children.push(build_tree(&path, root, depth_remaining - 1)?);
            } else {
                let child_relative = path.strip_prefix(root).unwrap_or(&path).to_string_lossy().replace('\\', "/");
                children.push(TreeNode {
                    name: file_name,
                    path: child_relative,
                    is_dir: false,
                    children: Vec::new(),
                });
            }
        }
    }

    Ok(TreeNode {
        name,
        path: relative,
        is_dir: true,
        children,
    })
}
