use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;

use crate::embeddings::EmbeddedChunk;
use crate::error::VectorStoreError;

const PERSIST_VERSION: u32 = 1;

/// Distances this close to zero are treated as zero when normalizing
/// relevance, so a perfect-match result set doesn't divide by zero.
const DISTANCE_FLOOR: f32 = 0.001;

/// Metadata carried alongside each stored vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    pub document_title: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub token_count: usize,
    pub page_number: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedRecord {
    pub id: String,
    pub text: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// One search result: similarity distance plus a relevance score normalized
/// within the returned result set.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub distance: f32,
    pub relevance: f32,
}

/// Optional metadata constraints applied before ranking.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub document_id: Option<String>,
    pub page_number: Option<usize>,
}

impl SearchFilter {
    fn matches(&self, meta: &ChunkMetadata) -> bool {
        if let Some(ref id) = self.document_id {
            if &meta.document_id != id {
                return false;
            }
        }
        if let Some(page) = self.page_number {
            if meta.page_number != Some(page) {
                return false;
            }
        }
        true
    }
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    model: String,
    records: Vec<IndexedRecord>,
}

/// In-memory vector index over document chunks.
///
/// Records are held in insertion order; search sorts stably by distance, so
/// equal-distance hits keep the order their chunks were indexed in.
pub struct VectorIndex {
    records: Vec<IndexedRecord>,
    model: String,
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

impl VectorIndex {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            records: Vec::new(),
            model: model.into(),
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Liveness probe. The in-memory index is always available; this exists
    /// for parity with backends that can actually go down.
    pub fn health_check(&self) -> bool {
        true
    }

    pub fn document_count(&self) -> usize {
        let mut ids: Vec<&str> = self
            .records
            .iter()
            .map(|r| r.metadata.document_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Store embedded chunks. Chunks with an empty vector are skipped with a
    /// warning; the call errors only when no chunk carried a vector.
    /// Returns the number of records stored.
    pub fn add_chunks(&mut self, chunks: Vec<EmbeddedChunk>) -> Result<usize, VectorStoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut stored = 0;
        for embedded in chunks {
            if embedded.vector.is_empty() {
                tracing::warn!(
                    document_id = %embedded.chunk.document_id,
                    chunk_index = embedded.chunk.chunk_index,
                    "Skipping chunk with empty embedding"
                );
                continue;
            }
            let chunk = embedded.chunk;
            let id = format!("{}_chunk_{}", chunk.document_id, chunk.chunk_index);
            self.records.push(IndexedRecord {
                id,
                text: chunk.text,
                vector: embedded.vector,
                metadata: ChunkMetadata {
                    document_id: chunk.document_id,
                    document_title: chunk.document_title,
                    chunk_index: chunk.chunk_index,
                    total_chunks: chunk.total_chunks,
                    token_count: chunk.token_count,
                    page_number: chunk.page_number,
                },
            });
            stored += 1;
        }

        if stored == 0 {
            return Err(VectorStoreError::NoEmbeddings);
        }

        tracing::debug!("Stored {} chunks (index size {})", stored, self.records.len());
        Ok(stored)
    }

    /// Remove every chunk belonging to `document_id`; returns how many were
    /// removed. Deleting an unknown document is not an error.
    pub fn delete_document(&mut self, document_id: &str) -> usize {
        let before = self.records.len();
        self.records
            .retain(|r| r.metadata.document_id != document_id);
        let removed = before - self.records.len();
        if removed > 0 {
            tracing::info!("Deleted {} chunks for document '{}'", removed, document_id);
        }
        removed
    }

    /// Rank stored chunks by cosine distance to `query` and return the top
    /// `top_k`, each with a relevance score normalized within the returned
    /// set: `1 - |distance| / max|distance|`, clamped to `[0, 1]`.
    ///
    /// An empty index returns an empty result, not an error; the caller
    /// decides how to phrase that.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&SearchFilter>,
    ) -> Result<Vec<SearchHit>, VectorStoreError> {
        if query.is_empty() {
            return Err(VectorStoreError::EmptyQueryVector);
        }
        if self.records.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        // Records whose vectors don't match the query dimensionality came
        // from a different model and cannot be compared; skip them.
        let mut scored: Vec<(usize, f32)> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.vector.len() == query.len())
            .filter(|(_, r)| filter.map_or(true, |f| f.matches(&r.metadata)))
            .map(|(i, r)| (i, 1.0 - cosine_similarity(query, &r.vector)))
            .collect();

        // Stable sort: ties keep insertion order.
        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        scored.truncate(top_k);

        let max_distance = scored
            .iter()
            .map(|(_, d)| d.abs())
            .fold(DISTANCE_FLOOR, f32::max);

        Ok(scored
            .into_iter()
            .map(|(i, distance)| {
                let record = &self.records[i];
                let relevance = (1.0 - distance.abs() / max_distance).clamp(0.0, 1.0);
                SearchHit {
                    id: record.id.clone(),
                    text: record.text.clone(),
                    metadata: record.metadata.clone(),
                    distance,
                    relevance,
                }
            })
            .collect())
    }

    /// Persist the index as JSON, atomically: write to a temp file in the
    /// same directory, then rename over the target.
    pub async fn save(&self, path: &Path) -> Result<(), VectorStoreError> {
        let state = PersistedState {
            version: PERSIST_VERSION,
            model: self.model.clone(),
            records: self.records.clone(),
        };
        let json = serde_json::to_vec(&state)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp_path = path.with_extension("tmp");
        tokio::fs::write(&temp_path, &json).await?;
        tokio::fs::rename(&temp_path, path).await?;

        tracing::info!("Saved {} records to {}", self.records.len(), path.display());
        Ok(())
    }

    /// Load a persisted index, verifying it was built with `expected_model`.
    /// A missing file yields a fresh empty index.
    pub async fn load(path: &Path, expected_model: &str) -> Result<Self, VectorStoreError> {
        if !path.exists() {
            tracing::info!("No index file at {}, starting empty", path.display());
            return Ok(Self::new(expected_model));
        }

        let bytes = tokio::fs::read(path).await?;
        let state: PersistedState = serde_json::from_slice(&bytes)?;

        if state.model != expected_model {
            return Err(VectorStoreError::ModelMismatch {
                expected: expected_model.to_string(),
                found: state.model,
            });
        }

        tracing::info!(
            "Loaded {} records from {} (version {})",
            state.records.len(),
            path.display(),
            state.version
        );
        Ok(Self {
            records: state.records,
            model: state.model,
        })
    }
}
