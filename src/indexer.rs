//! Orchestrates Source -> Discovery -> Hash -> Chunk -> Embed -> Upsert, and
//! owns reconciliation against the actual file tree. This is the one
//! component allowed to mutate the vector repository.

use crate::chunker::chunk_text;
use crate::config::ChunkConfig;
use crate::embedder::Embedder;
use crate::error::{AppError, AppResult};
use crate::hash::content_hash;
use crate::metadata;
use crate::repository::{ChunkRecord, VectorRepository};
use crate::source::SourceRegistry;
use crate::tokenizer::TokenCounter;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexFileError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexAllResult {
    pub processed: usize,
    pub skipped: usize,
    pub chunks_created: usize,
    pub duration_ms: u64,
    pub errors: Vec<IndexFileError>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexSingleResult {
    pub chunks_indexed: usize,
    pub skipped: bool,
}

/// A file's processing outcome, reported back from the per-file pipeline to
/// the `index_all` aggregator.
enum FileOutcome {
    Processed { chunks: usize },
    Skipped,
    Failed(IndexFileError),
}

pub struct Indexer {
    sources: Arc<SourceRegistry>,
    repo: Arc<VectorRepository>,
    embedder: Arc<dyn Embedder>,
    counter: Arc<dyn TokenCounter>,
    chunk_config: ChunkConfig,
    embedding_batch_size: usize,
    concurrency: usize,
    /// Per-(source_id, file_path) mutex, created on demand: the cheapest way
    /// to guarantee at most one delete/upsert pair in flight per file.
    file_locks: DashMap<(String, String), Arc<AsyncMutex<()>>>,
}

impl Indexer {
    pub fn new(
        sources: Arc<SourceRegistry>,
        repo: Arc<VectorRepository>,
        embedder: Arc<dyn Embedder>,
        counter: Arc<dyn TokenCounter>,
        chunk_config: ChunkConfig,
        embedding_batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            sources,
            repo,
            embedder,
            counter,
            chunk_config,
            embedding_batch_size,
            concurrency,
            file_locks: DashMap::new(),
        }
    }

    fn lock_for(&self, source_id: &str, file_path: &str) -> Arc<AsyncMutex<()>> {
        self.file_locks
            .entry((source_id.to_string(), file_path.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .value()
            .clone()
    }

    #[instrument(skip(self))]
    pub async fn index_all(&self, force: bool) -> AppResult<IndexAllResult> {
        let start = Instant::now();
        let mut worklist: Vec<(String, String)> = Vec::new();
        for source in self.sources.iter() {
            for relative_path in source.discover_files()? {
                worklist.push((source.id.clone(), relative_path));
            }
        }

        let concurrency = self.concurrency;
        let outcomes: Vec<FileOutcome> = stream::iter(worklist)
            .map(|(source_id, relative_path)| async move {
                match self.index_single_inner(&source_id, &relative_path, force).await {
                    Ok(result) if result.skipped => FileOutcome::Skipped,
                    Ok(result) => FileOutcome::Processed {
                        chunks: result.chunks_indexed,
                    },
                    Err(e) => FileOutcome::Failed(IndexFileError {
                        path: format!("{source_id}::{relative_path}"),
                        message: e.to_string(),
                    }),
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut result = IndexAllResult::default();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Processed { chunks } => {
                    result.processed += 1;
                    result.chunks_created += chunks;
                }
                FileOutcome::Skipped => result.skipped += 1,
                FileOutcome::Failed(e) => {
                    warn!(path = %e.path, error = %e.message, "indexing failed for file");
                    result.errors.push(e);
                }
            }
        }

        let removed = self.reconcile().await?;
        if removed > 0 {
            info!(removed, "reconciliation removed stale chunks");
        }

        // One save for the whole pass rather than one per file: a full-index
        // save is O(total chunks), so doing it per file would make a bulk
        // reindex quadratic.
        if result.processed > 0 || removed > 0 {
            self.repo.persist()?;
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn index_single(&self, source_id: &str, file_path: &str) -> AppResult<IndexSingleResult> {
        let result = self.index_single_inner(source_id, file_path, false).await?;
        if !result.skipped {
            self.repo.persist()?;
        }
        Ok(result)
    }

    async fn index_single_inner(
        &self,
        source_id: &str,
        file_path: &str,
        force: bool,
    ) -> AppResult<IndexSingleResult> {
        let lock = self.lock_for(source_id, file_path);
        let _guard = lock.lock().await;

        let source = self.sources.get(source_id)?;
        let absolute = source.validate_path(file_path)?;

        // Step 1: read bytes, compute content_hash.
        let bytes = tokio::fs::read(&absolute).await?;
        let hash = content_hash(&bytes);

        // Step 2: compare against stored content_hash; skip unless forced.
        // A file that chunks to zero rows has no chunk row to compare
        // against, so its hash is tracked separately via the empty-file
        // marker (B2) — otherwise a repeat call on an unchanged empty file
        // could never report `skipped` (R2).
        let existing = self.repo.get_by_path(source_id, file_path);
        if !force {
            if let Some(first) = existing.first() {
                if first.content_hash == hash {
                    debug!(source_id, file_path, "unchanged, skipping");
                    return Ok(IndexSingleResult {
                        chunks_indexed: 0,
                        skipped: true,
                    });
                }
            } else if self.repo.empty_hash(source_id, file_path).as_deref() == Some(hash.as_str()) {
                debug!(source_id, file_path, "unchanged empty file, skipping");
                return Ok(IndexSingleResult {
                    chunks_indexed: 0,
                    skipped: true,
                });
            }
        }

        let text = String::from_utf8_lossy(&bytes).to_string();

        // Step 3: extract metadata (tags, links, folder, title).
        let extracted = metadata::extract(&text);
        let title = metadata::note_title(file_path);
        let folder = metadata::folder(file_path);

        // Step 4: chunk.
        let raw_chunks = chunk_text(
            &text,
            self.counter.as_ref(),
            self.chunk_config.target,
            self.chunk_config.max,
            self.chunk_config.min,
        );

        if raw_chunks.is_empty() {
            // Empty file: no rows, but still clear any stale chunks from a
            // prior non-empty version (B2), and record the marker so a
            // repeat call on the same unchanged bytes reports `skipped`.
            self.repo.delete_by(source_id, file_path)?;
            self.repo.mark_empty(source_id, file_path, &hash);
            return Ok(IndexSingleResult {
                chunks_indexed: 0,
                skipped: false,
            });
        }

        // Step 5: batch-embed through the embedding client.
        let texts: Vec<String> = raw_chunks.iter().map(|c| c.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.embedding_batch_size.max(1)) {
            let embedded = self.embedder.embed(batch).await?;
            vectors.extend(embedded);
        }
        if vectors.len() != raw_chunks.len() {
            return Err(AppError::Inconsistency(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                raw_chunks.len()
            )));
        }

        let tags_joined = extracted.tags.join(",");
        let links_joined = extracted.outbound_links.join(",");

        let records: Vec<(ChunkRecord, Vec<f32>)> = raw_chunks
            .into_iter()
            .zip(vectors)
            .enumerate()
            .map(|(chunk_index, (chunk, vector))| {
                (
                    ChunkRecord {
                        id: chunk_id(source_id, file_path, chunk_index),
                        source_id: source_id.to_string(),
                        file_path: file_path.to_string(),
                        note_title: title.clone(),
                        folder: folder.clone(),
                        chunk_index,
                        header_context: chunk.header_context,
                        content_hash: hash.clone(),
                        text: chunk.text,
                        token_count: chunk.token_count,
                        tags: tags_joined.clone(),
                        outbound_links: links_joined.clone(),
                    },
                    vector,
                )
            })
            .collect();

        let chunk_count = records.len();

        // Steps 6-7: clear stale chunks, then upsert. A failure here leaves
        // the repository temporarily inconsistent; the next full pass's
        // reconcile() restores I1/I2/I4.
        self.repo.delete_by(source_id, file_path)?;
        self.repo.upsert(records)?;

        Ok(IndexSingleResult {
            chunks_indexed: chunk_count,
            skipped: false,
        })
    }

    /// Removes stored chunks for files that no longer exist under their
    /// source root. Runs at startup and after every `index_all`. Also
    /// considers files tracked only via an empty-file marker (B2), so a
    /// deleted empty file doesn't leave a stale hash behind (I4) —
    /// `delete_by` clears both the chunk rows and the marker together.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> AppResult<usize> {
        let mut removed = 0;
        let stored: Vec<(String, String)> = self
            .repo
            .scan_metadata()
            .into_iter()
            .map(|r| (r.source_id, r.file_path))
            .chain(self.repo.empty_file_paths())
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();

        for (source_id, file_path) in stored {
            let still_exists = match self.sources.get(&source_id) {
                Ok(source) => source.validate_path(&file_path).is_ok_and(|p| p.exists()),
                Err(_) => false,
            };
            if !still_exists {
                removed += self.repo.delete_by(&source_id, &file_path)?;
            }
        }
        Ok(removed)
    }

    pub async fn remove_file(&self, source_id: &str, file_path: &str) -> AppResult<usize> {
        let lock = self.lock_for(source_id, file_path);
        let _guard = lock.lock().await;
        let removed = self.repo.delete_by(source_id, file_path)?;
        if removed > 0 {
            self.repo.persist()?;
        }
        Ok(removed)
    }

    /// Atomic move handler: remove the old path's chunks, then index the new
    /// one, so no ghost entries survive a rename (event semantics, §4.5).
    pub async fn move_file(&self, source_id: &str, from: &str, to: &str) -> AppResult<IndexSingleResult> {
        self.remove_file(source_id, from).await?;
        self.index_single(source_id, to).await
    }
}

/// `"{source_id}::{relative_path}::{chunk_index}"`, forward-slash separated.
/// The repository's primary key; must be stable across restarts.
pub fn chunk_id(source_id: &str, relative_path: &str, chunk_index: usize) -> String {
    format!("{source_id}::{relative_path}::{chunk_index}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChunkConfig, SourceConfig, SourceKind};
    use crate::embedder::FakeEmbedder;
    use crate::tokenizer::WhitespaceCounter;
    use std::fs;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<SourceRegistry>, Arc<VectorRepository>, Indexer) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.md"), "# Title\n\nhello world").unwrap();

        let sources = Arc::new(
            SourceRegistry::new(&[SourceConfig {
                id: "vault".to_string(),
                name: None,
                path: dir.path().to_string_lossy().to_string(),
                kind: SourceKind::Markdown,
                include: vec![],
                exclude: vec![],
            }])
            .unwrap(),
        );
        let store_dir = TempDir::new().unwrap();
        let repo = Arc::new(VectorRepository::open(store_dir.path(), 8, "fake-embedder").unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(FakeEmbedder::new(8));
        let counter: Arc<dyn TokenCounter> = Arc::new(WhitespaceCounter);

        let indexer = Indexer::new(
            sources.clone(),
            repo.clone(),
            embedder,
            counter,
            ChunkConfig {
                target: 1000,
                max: 2000,
                min: 1,
            },
            100,
            4,
        );
        (dir, sources, repo, indexer)
    }

    #[tokio::test]
    async fn index_single_then_repeat_skips() {
        let (_dir, _sources, repo, indexer) = setup();
        let first = indexer.index_single("vault", "a.md").await.unwrap();
        assert!(first.chunks_indexed > 0);
        assert!(!first.skipped);

        let second = indexer.index_single("vault", "a.md").await.unwrap();
        assert!(second.skipped);
        assert_eq!(second.chunks_indexed, 0);
        assert_eq!(repo.scan_metadata().len(), first.chunks_indexed);
    }

    #[tokio::test]
    async fn index_single_on_unchanged_empty_file_reports_skipped() {
        let (dir, _sources, repo, indexer) = setup();
        fs::write(dir.path().join("empty.md"), "").unwrap();

        let first = indexer.index_single("vault", "empty.md").await.unwrap();
        assert_eq!(first.chunks_indexed, 0);
        assert!(!first.skipped);
        assert!(repo.get_by_path("vault", "empty.md").is_empty());

        let second = indexer.index_single("vault", "empty.md").await.unwrap();
        assert_eq!(second.chunks_indexed, 0);
        assert!(second.skipped, "repeat call on unchanged empty file must report skipped (R2/B2)");
    }

    #[tokio::test]
    async fn reconcile_removes_deleted_file_chunks() {
        let (dir, _sources, repo, indexer) = setup();
        indexer.index_single("vault", "a.md").await.unwrap();
        assert!(!repo.scan_metadata().is_empty());

        std::fs::remove_file(dir.path().join("a.md")).unwrap();
        let removed = indexer.reconcile().await.unwrap();
        assert!(removed > 0);
        assert!(repo.scan_metadata().is_empty());
    }

    #[tokio::test]
    async fn index_all_skips_unchanged_on_second_pass() {
        let (_dir, _sources, _repo, indexer) = setup();
        let first = indexer.index_all(false).await.unwrap();
        assert_eq!(first.processed, 1);
        assert_eq!(first.skipped, 0);

        let second = indexer.index_all(false).await.unwrap();
        assert_eq!(second.processed, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(second.chunks_created, 0);
    }
}
