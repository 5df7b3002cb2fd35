//! Read-only listing of the configured sources. Sources are declared in
//! configuration and immutable at runtime (reconfiguration requires a
//! restart), so there is no create/update/delete surface here — only the
//! per-note operations below accept a `source` id to address one.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub display_name: String,
    pub root_path: String,
    pub kind: crate::config::SourceKind,
}

pub async fn list_sources(State(state): State<AppState>) -> AppResult<Json<Vec<SourceInfo>>> {
    let sources = state
        .sources
        .iter()
        .map(|s| SourceInfo {
            id: s.id.clone(),
            display_name: s.display_name.clone(),
            root_path: s.root_path.to_string_lossy().to_string(),
            kind: s.kind,
        })
        .collect();
    Ok(Json(sources))
}
