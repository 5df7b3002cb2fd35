//! Source roots: named, typed directories configured for ingestion. Declared
//! in configuration and immutable for the lifetime of a run (I6's reconfig
//! note: changing a source requires a restart).

use crate::config::{is_excluded_directory, SourceConfig, SourceKind};
use crate::error::{AppError, AppResult};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

pub struct Source {
    pub id: String,
    pub display_name: String,
    pub root_path: PathBuf,
    pub kind: SourceKind,
    include: GlobSet,
    exclude: GlobSet,
}

impl Source {
    pub fn from_config(cfg: &SourceConfig) -> AppResult<Self> {
        let root_path = dunce::canonicalize(&cfg.path)
            .map_err(|_| AppError::Config(format!("source '{}': path does not exist: {}", cfg.id, cfg.path)))?;

        Ok(Self {
            id: cfg.id.clone(),
            display_name: cfg.display_name().to_string(),
            root_path,
            kind: cfg.kind,
            include: build_globset(&cfg.include)?,
            exclude: build_globset(&cfg.exclude)?,
        })
    }

    /// Lists every file under the source root that passes gitignore rules,
    /// the build/output exclusion list, and the source's own include/exclude
    /// globs. Returns paths relative to the source root with forward slashes.
    pub fn discover_files(&self) -> AppResult<Vec<String>> {
        let mut out = Vec::new();
        let walker = WalkBuilder::new(&self.root_path)
            .hidden(false)
            .git_ignore(true)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !is_excluded_directory(name))
                    .unwrap_or(true)
            })
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| AppError::Io(std::io::Error::other(e)))?;
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.root_path)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");

            if self.is_indexable(&relative) {
                out.push(relative);
            }
        }
        Ok(out)
    }

    pub fn is_indexable(&self, relative_path: &str) -> bool {
        if !self.exclude.is_empty() && self.exclude.is_match(relative_path) {
            return false;
        }
        if self.include.is_empty() {
            return true;
        }
        self.include.is_match(relative_path)
    }

    /// Resolves a relative path against the source root, rejecting anything
    /// that would escape it (symlinks included). The Open Question on
    /// out-of-root includes is resolved against the spec's text: forbidden.
    pub fn validate_path(&self, relative_path: &str) -> AppResult<PathBuf> {
        let candidate = self.root_path.join(relative_path);
        let canonical = dunce::canonicalize(&candidate).or_else(|_| {
            let parent = candidate
                .parent()
                .ok_or_else(|| AppError::InvalidPath(relative_path.to_string()))?;
            let canonical_parent = dunce::canonicalize(parent)
                .map_err(|_| AppError::NotFound(relative_path.to_string()))?;
            Ok::<_, AppError>(canonical_parent.join(candidate.file_name().unwrap_or_default()))
        })?;

        if !canonical.starts_with(&self.root_path) {
            return Err(AppError::InvalidPath(format!(
                "'{relative_path}' escapes source '{}'",
                self.id
            )));
        }
        Ok(canonical)
    }

    /// Resolves a relative path against the source root without requiring the
    /// target to already exist — needed by note creation, which may write
    /// into intermediate directories that don't exist yet. Rejects `..`
    /// traversal and absolute paths lexically, since there's nothing on disk
    /// to canonicalize against yet.
    pub fn resolve_new_path(&self, relative_path: &str) -> AppResult<PathBuf> {
        let rel = Path::new(relative_path);
        if rel.is_absolute() || rel.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(AppError::InvalidPath(format!(
                "'{relative_path}' escapes source '{}'",
                self.id
            )));
        }
        Ok(self.root_path.join(rel))
    }

    pub fn relative_path_of(&self, absolute: &Path) -> Option<String> {
        absolute
            .strip_prefix(&self.root_path)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

fn build_globset(patterns: &[String]) -> AppResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| AppError::Config(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| AppError::Config(format!("invalid glob set: {e}")))
}

/// Registry of all configured sources, looked up by id during indexing and
/// query filtering.
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    pub fn new(configs: &[SourceConfig]) -> AppResult<Self> {
        let sources = configs
            .iter()
            .map(Source::from_config)
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { sources })
    }

    pub fn get(&self, id: &str) -> AppResult<&Source> {
        self.sources
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| AppError::NotFound(format!("source '{id}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Source> {
        self.sources.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_include_matches_everything() {
        let empty = build_globset(&[]).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn include_glob_filters() {
        let include = build_globset(&["**/*.md".to_string()]).unwrap();
        assert!(include.is_match("notes/a.md"));
        assert!(!include.is_match("notes/a.txt"));
    }
}
