//! Persistent vector store: `{id, vector, text, metadata}` rows addressed by
//! the chunk id primary key, with metadata-filtered k-NN via usearch's HNSW
//! index. usearch keys are `u64`; this module owns the string-id <-> u64-key
//! mapping the rest of the engine never has to think about.

use crate::error::{AppError, AppResult};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;
use usearch::ffi::{IndexOptions, MetricKind, ScalarKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub source_id: String,
    pub file_path: String,
    pub note_title: String,
    pub folder: String,
    pub chunk_index: usize,
    pub header_context: String,
    pub content_hash: String,
    pub text: String,
    pub token_count: usize,
    /// Comma-joined, case-preserving, deduplicated (I6).
    pub tags: String,
    /// Comma-joined referenced note titles.
    pub outbound_links: String,
}

#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub source_id: Option<String>,
    pub folder: Option<String>,
    /// Membership-in-joined-string match against `tags` (Open Question:
    /// the spec mandates exact-set membership at the API level; this layer
    /// implements it via substring-on-comma-boundaries, see DESIGN.md).
    pub tag: Option<String>,
}

impl MetadataFilter {
    fn matches(&self, record: &ChunkRecord) -> bool {
        if let Some(source_id) = &self.source_id {
            if &record.source_id != source_id {
                return false;
            }
        }
        if let Some(folder) = &self.folder {
            if &record.folder != folder {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            let has_tag = record
                .tags
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(tag.trim()));
            if !has_tag {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct QueryHit {
    pub record: ChunkRecord,
    pub distance: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub chunk_count: usize,
    pub file_count: usize,
    pub embedding_model: String,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedMeta {
    records: HashMap<u64, ChunkRecord>,
    id_to_key: HashMap<String, u64>,
    next_key: u64,
    #[serde(default)]
    empty_files: HashMap<String, String>,
}

pub struct VectorRepository {
    index: RwLock<usearch::Index>,
    records: RwLock<HashMap<u64, ChunkRecord>>,
    id_to_key: RwLock<HashMap<String, u64>>,
    next_key: AtomicU64,
    /// Marker for files that chunk to zero rows (B2): `"{source_id}::{file_path}"`
    /// -> the `content_hash` last seen for that file. Without this, a file with
    /// no chunks has no row anywhere to compare `content_hash` against, so a
    /// repeat `index_single` on an unchanged empty file could never report
    /// `skipped` (R2 is unqualified and covers the empty-file case too).
    empty_files: RwLock<HashMap<String, String>>,
    /// Serializes upsert/delete so an id's key-mapping and its usearch entry
    /// never observe a torn update from a concurrent writer.
    write_lock: Mutex<()>,
    index_path: PathBuf,
    meta_path: PathBuf,
    embedding_model: RwLock<String>,
}

fn empty_marker_key(source_id: &str, file_path: &str) -> String {
    format!("{source_id}::{file_path}")
}

impl VectorRepository {
    pub fn open(store_dir: &Path, dimensions: usize, embedding_model: &str) -> AppResult<Self> {
        std::fs::create_dir_all(store_dir)?;
        let index_path = store_dir.join("index.usearch");
        let meta_path = store_dir.join("metadata.json");

        let options = IndexOptions {
            dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: 16,
            expansion_add: 128,
            expansion_search: 64,
            multi: false,
        };
        let index = usearch::Index::new(&options)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to create vector index: {e}")))?;

        let (records, id_to_key, next_key, empty_files) = if index_path.exists() && meta_path.exists() {
            match index.load(&index_path.to_string_lossy()) {
                Ok(()) => {
                    let persisted: PersistedMeta = std::fs::read_to_string(&meta_path)
                        .ok()
                        .and_then(|raw| serde_json::from_str(&raw).ok())
                        .unwrap_or_default();
                    (
                        persisted.records,
                        persisted.id_to_key,
                        persisted.next_key,
                        persisted.empty_files,
                    )
                }
                Err(e) => {
                    warn!("failed to load existing vector index, rebuilding: {e}");
                    index
                        .reserve(65536)
                        .map_err(|e| AppError::Internal(anyhow::anyhow!("{e}")))?;
                    (HashMap::new(), HashMap::new(), 0, HashMap::new())
                }
            }
        } else {
            index
                .reserve(65536)
                .map_err(|e| AppError::Internal(anyhow::anyhow!("{e}")))?;
            (HashMap::new(), HashMap::new(), 0, HashMap::new())
        };

        Ok(Self {
            index: RwLock::new(index),
            records: RwLock::new(records),
            id_to_key: RwLock::new(id_to_key),
            next_key: AtomicU64::new(next_key),
            empty_files: RwLock::new(empty_files),
            write_lock: Mutex::new(()),
            index_path,
            meta_path,
            embedding_model: RwLock::new(embedding_model.to_string()),
        })
    }

    /// Idempotent by primary key: existing ids are overwritten in place.
    pub fn upsert(&self, chunks: Vec<(ChunkRecord, Vec<f32>)>) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        let index = self.index.write();
        let mut records = self.records.write();
        let mut id_to_key = self.id_to_key.write();

        let needed = records.len() + chunks.len();
        if needed > index.capacity() {
            index
                .reserve(needed.max(index.capacity() * 2).max(1024))
                .map_err(|e| AppError::Internal(anyhow::anyhow!("{e}")))?;
        }

        for (record, vector) in chunks {
            if let Some(&existing_key) = id_to_key.get(&record.id) {
                let _ = index.remove(existing_key);
                index
                    .add(existing_key, &vector)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("{e}")))?;
                records.insert(existing_key, record);
            } else {
                let key = self.next_key.fetch_add(1, Ordering::SeqCst);
                index
                    .add(key, &vector)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!("{e}")))?;
                id_to_key.insert(record.id.clone(), key);
                records.insert(key, record);
            }
        }
        Ok(())
    }

    /// Removes all chunks for one file. Must be called before re-inserting
    /// that file's chunks so stale rows never linger (I4). Also clears the
    /// empty-file marker for the path, so a file that goes from empty back
    /// to non-empty (or is removed entirely) leaves no stale hash behind.
    pub fn delete_by(&self, source_id: &str, file_path: &str) -> AppResult<usize> {
        let _guard = self.write_lock.lock();
        let index = self.index.write();
        let mut records = self.records.write();
        let mut id_to_key = self.id_to_key.write();

        let keys: Vec<u64> = records
            .iter()
            .filter(|(_, r)| r.source_id == source_id && r.file_path == file_path)
            .map(|(k, _)| *k)
            .collect();

        for key in &keys {
            let _ = index.remove(*key);
            if let Some(record) = records.remove(key) {
                id_to_key.remove(&record.id);
            }
        }
        self.empty_files.write().remove(&empty_marker_key(source_id, file_path));
        Ok(keys.len())
    }

    /// Records that `(source_id, file_path)` chunked to zero rows at
    /// `content_hash`, so a repeat `index_single` call on the same bytes can
    /// recognize "unchanged, still empty" and report `skipped` (B2, R2).
    pub fn mark_empty(&self, source_id: &str, file_path: &str, content_hash: &str) {
        self.empty_files
            .write()
            .insert(empty_marker_key(source_id, file_path), content_hash.to_string());
    }

    /// The `content_hash` last recorded by `mark_empty` for this path, if any.
    pub fn empty_hash(&self, source_id: &str, file_path: &str) -> Option<String> {
        self.empty_files.read().get(&empty_marker_key(source_id, file_path)).cloned()
    }

    /// All `(source_id, file_path)` pairs with an empty-file marker, for
    /// `reconcile()` to clear alongside ordinary chunk rows (I4).
    pub fn empty_file_paths(&self) -> Vec<(String, String)> {
        self.empty_files
            .read()
            .keys()
            .filter_map(|key| key.split_once("::").map(|(s, p)| (s.to_string(), p.to_string())))
            .collect()
    }

    pub fn delete_by_id(&self, ids: &[String]) -> AppResult<usize> {
        let _guard = self.write_lock.lock();
        let index = self.index.write();
        let mut records = self.records.write();
        let mut id_to_key = self.id_to_key.write();

        let mut deleted = 0;
        for id in ids {
            if let Some(key) = id_to_key.remove(id) {
                let _ = index.remove(key);
                records.remove(&key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// k-NN under cosine distance with a pre-retrieval metadata filter.
    /// usearch has no native predicate pushdown, so we over-fetch and filter
    /// in-process; this is acceptable at the corpus sizes this engine targets.
    pub fn query(&self, vector: &[f32], k: usize, filter: &MetadataFilter) -> AppResult<Vec<QueryHit>> {
        let index = self.index.read();
        if index.size() == 0 {
            return Ok(Vec::new());
        }
        let records = self.records.read();

        let has_filter =
            filter.source_id.is_some() || filter.folder.is_some() || filter.tag.is_some();
        let fetch = if has_filter { (k * 8).max(k) } else { k };
        let capped = fetch.min(index.size());

        let result = index
            .search(vector, capped)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("vector search failed: {e}")))?;

        let mut hits = Vec::new();
        for (key, distance) in result.keys.iter().zip(result.distances.iter()) {
            if let Some(record) = records.get(key) {
                if filter.matches(record) {
                    hits.push(QueryHit {
                        record: record.clone(),
                        distance: *distance,
                    });
                }
            }
            if hits.len() >= k && !has_filter {
                break;
            }
        }
        hits.truncate(k.max(hits.len().min(k)));
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    /// All chunks (with their stored vectors reconstructible by id) for a
    /// file — used by `suggest_links` to avoid re-embedding unchanged notes.
    pub fn get_by_path(&self, source_id: &str, file_path: &str) -> Vec<ChunkRecord> {
        let records = self.records.read();
        let mut out: Vec<ChunkRecord> = records
            .values()
            .filter(|r| r.source_id == source_id && r.file_path == file_path)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.chunk_index);
        out
    }

    pub fn vector_for_id(&self, id: &str) -> Option<Vec<f32>> {
        let id_to_key = self.id_to_key.read();
        let key = *id_to_key.get(id)?;
        let index = self.index.read();
        let mut buf = vec![0f32; index.dimensions()];
        match index.get(key, &mut buf) {
            Ok(found) if found > 0 => Some(buf),
            _ => None,
        }
    }

    /// Full projection over all stored chunks, for link analytics.
    pub fn scan_metadata(&self) -> Vec<ChunkRecord> {
        self.records.read().values().cloned().collect()
    }

    pub fn stats(&self) -> RepositoryStats {
        let records = self.records.read();
        let file_count = records
            .values()
            .map(|r| (r.source_id.clone(), r.file_path.clone()))
            .collect::<std::collections::HashSet<_>>()
            .len();
        RepositoryStats {
            chunk_count: records.len(),
            file_count,
            embedding_model: self.embedding_model.read().clone(),
        }
    }

    pub fn persist(&self) -> AppResult<()> {
        let _guard = self.write_lock.lock();
        let index = self.index.read();
        index
            .save(&self.index_path.to_string_lossy())
            .map_err(|e| AppError::Internal(anyhow::anyhow!("failed to save vector index: {e}")))?;

        let persisted = PersistedMeta {
            records: self.records.read().clone(),
            id_to_key: self.id_to_key.read().clone(),
            next_key: self.next_key.load(Ordering::SeqCst),
            empty_files: self.empty_files.read().clone(),
        };
        let json = serde_json::to_string(&persisted)?;
        let tmp = self.meta_path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &self.meta_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, source_id: &str, file_path: &str, chunk_index: usize) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            source_id: source_id.to_string(),
            file_path: file_path.to_string(),
            note_title: "note".to_string(),
            folder: "".to_string(),
            chunk_index,
            header_context: "".to_string(),
            content_hash: "h".to_string(),
            text: "text".to_string(),
            token_count: 1,
            tags: "work,personal".to_string(),
            outbound_links: "".to_string(),
        }
    }

    #[test]
    fn upsert_then_query_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let repo = VectorRepository::open(dir.path(), 4, "test-model").unwrap();
        repo.upsert(vec![(record("vault::a.md::0", "vault", "a.md", 0), vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        let hits = repo.query(&[1.0, 0.0, 0.0, 0.0], 5, &MetadataFilter::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "vault::a.md::0");
    }

    #[test]
    fn delete_by_removes_all_chunks_for_file() {
        let dir = tempfile::tempdir().unwrap();
        let repo = VectorRepository::open(dir.path(), 4, "test-model").unwrap();
        repo.upsert(vec![
            (record("vault::a.md::0", "vault", "a.md", 0), vec![1.0, 0.0, 0.0, 0.0]),
            (record("vault::a.md::1", "vault", "a.md", 1), vec![0.0, 1.0, 0.0, 0.0]),
        ])
        .unwrap();
        let removed = repo.delete_by("vault", "a.md").unwrap();
        assert_eq!(removed, 2);
        assert!(repo.get_by_path("vault", "a.md").is_empty());
    }

    #[test]
    fn empty_file_marker_roundtrips_and_clears_on_delete_by() {
        let dir = tempfile::tempdir().unwrap();
        let repo = VectorRepository::open(dir.path(), 4, "test-model").unwrap();
        repo.mark_empty("vault", "empty.md", "h1");
        assert_eq!(repo.empty_hash("vault", "empty.md"), Some("h1".to_string()));
        assert_eq!(repo.empty_file_paths(), vec![("vault".to_string(), "empty.md".to_string())]);

        repo.delete_by("vault", "empty.md").unwrap();
        assert_eq!(repo.empty_hash("vault", "empty.md"), None);
        assert!(repo.empty_file_paths().is_empty());
    }

    #[test]
    fn tag_filter_matches_joined_tags() {
        let dir = tempfile::tempdir().unwrap();
        let repo = VectorRepository::open(dir.path(), 4, "test-model").unwrap();
        repo.upsert(vec![(record("vault::a.md::0", "vault", "a.md", 0), vec![1.0, 0.0, 0.0, 0.0])])
            .unwrap();
        let filter = MetadataFilter {
            tag: Some("personal".to_string()),
            ..Default::default()
        };
        let hits = repo.query(&[1.0, 0.0, 0.0, 0.0], 5, &filter).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
