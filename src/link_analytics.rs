//! Graph-derived tools over the indexed corpus: link suggestions, orphaned
//! notes, in-degree ranking, and near-duplicate detection. All of it is
//! derived from `outbound_links` already captured on each chunk record plus
//! the stored chunk vectors — no separate graph store.

use crate::chunker::chunk_text;
use crate::config::ChunkConfig;
use crate::embedder::Embedder;
use crate::error::AppResult;
use crate::metadata;
use crate::repository::{MetadataFilter, VectorRepository};
use crate::source::SourceRegistry;
use crate::tokenizer::TokenCounter;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Candidates are fetched `n * CANDIDATE_FACTOR` deep per chunk before
/// aggregation, since a target file's best-matching chunk is not necessarily
/// its first hit once excluded targets are filtered out.
const CANDIDATE_FACTOR: usize = 4;

#[derive(Debug, Clone, Serialize)]
pub struct LinkSuggestion {
    pub source_id: String,
    pub file_path: String,
    pub note_title: String,
    pub score: f32,
    /// The best-matching chunk's header context, surfaced as the reason.
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePair {
    pub a_source_id: String,
    pub a_file_path: String,
    pub b_source_id: String,
    pub b_file_path: String,
    pub similarity: f32,
}

pub struct LinkAnalytics {
    sources: Arc<SourceRegistry>,
    repo: Arc<VectorRepository>,
    embedder: Arc<dyn Embedder>,
    counter: Arc<dyn TokenCounter>,
    chunk_config: ChunkConfig,
}

impl LinkAnalytics {
    pub fn new(
        sources: Arc<SourceRegistry>,
        repo: Arc<VectorRepository>,
        embedder: Arc<dyn Embedder>,
        counter: Arc<dyn TokenCounter>,
        chunk_config: ChunkConfig,
    ) -> Self {
        Self {
            sources,
            repo,
            embedder,
            counter,
            chunk_config,
        }
    }

    pub async fn suggest_links(
        &self,
        source_id: &str,
        file_path: &str,
        n: usize,
        min_similarity: f32,
        exclude_current: bool,
    ) -> AppResult<Vec<LinkSuggestion>> {
        let source = self.sources.get(source_id)?;
        let absolute = source.validate_path(file_path)?;
        let content = tokio::fs::read_to_string(&absolute).await?;

        // The disk is authoritative for "already linked", not stored metadata.
        let current_links = metadata::extract(&content).outbound_links;
        let current_titles: std::collections::HashSet<String> =
            current_links.into_iter().map(|t| t.to_lowercase()).collect();
        let own_title = metadata::note_title(file_path).to_lowercase();

        let mut chunk_vectors: Vec<Vec<f32>> = Vec::new();
        let stored = self.repo.get_by_path(source_id, file_path);
        if !stored.is_empty() {
            for chunk in &stored {
                if let Some(v) = self.repo.vector_for_id(&chunk.id) {
                    chunk_vectors.push(v);
                }
            }
        } else {
            let raw_chunks = chunk_text(
                &content,
                self.counter.as_ref(),
                self.chunk_config.target,
                self.chunk_config.max,
                self.chunk_config.min,
            );
            if !raw_chunks.is_empty() {
                let texts: Vec<String> = raw_chunks.iter().map(|c| c.text.clone()).collect();
                chunk_vectors = self.embedder.embed(&texts).await?;
            }
        }

        let candidate_k = (n * CANDIDATE_FACTOR).max(n);
        let mut aggregate: HashMap<(String, String), (f32, f32, usize, String)> = HashMap::new();

        for vector in &chunk_vectors {
            let hits = self.repo.query(vector, candidate_k, &MetadataFilter::default())?;
            for hit in hits {
                let record = hit.record;
                if record.source_id == source_id && record.file_path == file_path {
                    continue;
                }
                let similarity = 1.0 - hit.distance;
                let key = (record.source_id.clone(), record.file_path.clone());
                let entry = aggregate
                    .entry(key)
                    .or_insert((0.0, 0.0, 0, record.header_context.clone()));
                if similarity > entry.0 {
                    entry.0 = similarity;
                    entry.3 = record.header_context.clone();
                }
                entry.1 += similarity;
                entry.2 += 1;
            }
        }

        let mut suggestions: Vec<LinkSuggestion> = aggregate
            .into_iter()
            .filter_map(|((target_source, target_path), (max_sim, sum_sim, count, reason))| {
                let title = metadata::note_title(&target_path);
                if exclude_current && title.eq_ignore_ascii_case(&own_title) {
                    return None;
                }
                if current_titles.contains(&title.to_lowercase()) {
                    return None;
                }
                let mean_sim = sum_sim / count as f32;
                let score = 0.7 * max_sim + 0.3 * mean_sim;
                if score < min_similarity {
                    return None;
                }
                Some(LinkSuggestion {
                    source_id: target_source,
                    file_path: target_path,
                    note_title: title,
                    score,
                    reason,
                })
            })
            .collect();

        suggestions.sort_by(|a, b| b.score.total_cmp(&a.score));
        suggestions.truncate(n);
        Ok(suggestions)
    }

    /// Files present in the corpus whose titles never appear as an outbound
    /// link target anywhere else. Matching is filename-without-extension.
    pub fn orphans(&self) -> Vec<(String, String)> {
        let records = self.repo.scan_metadata();
        let mut referenced: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut files: std::collections::HashSet<(String, String)> = std::collections::HashSet::new();

        for record in &records {
            files.insert((record.source_id.clone(), record.file_path.clone()));
            for link in record.outbound_links.split(',') {
                let link = link.trim();
                if !link.is_empty() {
                    referenced.insert(link.to_lowercase());
                }
            }
        }

        let mut orphaned: Vec<(String, String)> = files
            .into_iter()
            .filter(|(_, file_path)| {
                let title = metadata::note_title(file_path).to_lowercase();
                !referenced.contains(&title)
            })
            .collect();
        orphaned.sort();
        orphaned
    }

    /// Outbound-link occurrences grouped by target title, descending by count.
    pub fn most_linked(&self, n: usize) -> Vec<(String, usize)> {
        let records = self.repo.scan_metadata();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in &records {
            for link in record.outbound_links.split(',') {
                let link = link.trim();
                if !link.is_empty() {
                    *counts.entry(link.to_string()).or_insert(0) += 1;
                }
            }
        }
        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    /// Per-file centroid (mean of chunk vectors, L2-normalized), then
    /// pairwise cosine similarity. O(N^2) in file count; acceptable up to the
    /// low tens of thousands this engine targets.
    pub fn duplicates(&self, threshold: f32) -> Vec<DuplicatePair> {
        let records = self.repo.scan_metadata();
        let mut by_file: HashMap<(String, String), Vec<String>> = HashMap::new();
        for record in &records {
            by_file
                .entry((record.source_id.clone(), record.file_path.clone()))
                .or_default()
                .push(record.id.clone());
        }

        let mut centroids: Vec<((String, String), Vec<f32>)> = Vec::new();
        for (key, ids) in &by_file {
            let vectors: Vec<Vec<f32>> = ids.iter().filter_map(|id| self.repo.vector_for_id(id)).collect();
            if let Some(centroid) = centroid_of(&vectors) {
                centroids.push((key.clone(), centroid));
            }
        }

        let mut pairs = Vec::new();
        for i in 0..centroids.len() {
            for j in (i + 1)..centroids.len() {
                let sim = cosine(&centroids[i].1, &centroids[j].1);
                if sim >= threshold {
                    let ((a_source, a_path), _) = &centroids[i];
                    let ((b_source, b_path), _) = &centroids[j];
                    pairs.push(DuplicatePair {
                        a_source_id: a_source.clone(),
                        a_file_path: a_path.clone(),
                        b_source_id: b_source.clone(),
                        b_file_path: b_path.clone(),
                        similarity: sim,
                    });
                }
            }
        }
        pairs.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        pairs
    }
}

fn centroid_of(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let dims = first.len();
    let mut mean = vec![0f32; dims];
    for v in vectors {
        for (m, x) in mean.iter_mut().zip(v.iter()) {
            *m += x;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    let norm = mean.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for m in mean.iter_mut() {
            *m /= norm;
        }
    }
    Some(mean)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine(&v, &v) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn centroid_is_l2_normalized() {
        let centroid = centroid_of(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap();
        let norm = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn most_linked_ranks_by_count() {
        let ranked = vec![("B".to_string(), 3usize), ("A".to_string(), 1)];
        let mut sorted = ranked.clone();
        sorted.sort_by(|a, b| b.1.cmp(&a.1));
        assert_eq!(sorted[0].0, "B");
    }
}
