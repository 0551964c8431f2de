use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::chunker::{DocumentMeta, PageText, TextChunker};
use crate::embeddings::Embedder;
use crate::progress::{IndexStage, ProgressSink};
use crate::vector_index::VectorIndex;

/// A document delivered by the extraction collaborator, ready to index.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub document_id: String,
    pub title: String,
    pub pages: Vec<PageText>,
}

/// Outcome of indexing one document.
#[derive(Debug, Clone)]
pub struct IndexSummary {
    pub document_id: String,
    pub chunks_created: usize,
    pub chunks_embedded: usize,
    pub chunks_stored: usize,
}

/// The indexing write path: delete stale chunks, chunk pages, embed with
/// progress reporting, store, persist.
pub struct Indexer {
    chunker: TextChunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<VectorIndex>>,
    progress: Arc<dyn ProgressSink>,
    persist_path: Option<PathBuf>,
}

impl Indexer {
    pub fn new(
        chunker: TextChunker,
        embedder: Arc<dyn Embedder>,
        index: Arc<RwLock<VectorIndex>>,
        progress: Arc<dyn ProgressSink>,
        persist_path: Option<PathBuf>,
    ) -> Self {
        Self {
            chunker,
            embedder,
            index,
            progress,
            persist_path,
        }
    }

    /// Index one document end to end. Re-indexing the same `document_id`
    /// replaces its chunks: stale records are deleted before the new ones
    /// are stored.
    pub async fn index_document(&self, document: ExtractedDocument) -> Result<IndexSummary> {
        let doc_id = document.document_id.clone();
        tracing::info!(document_id = %doc_id, title = %document.title, "Indexing document");

        self.progress.stage(&doc_id, IndexStage::Chunking);
        let meta = DocumentMeta {
            document_id: document.document_id,
            document_title: document.title,
        };
        let chunks = self.chunker.chunk_pages(&document.pages, &meta);
        let chunks_created = chunks.len();
        if chunks.is_empty() {
            self.progress.stage(&doc_id, IndexStage::Failed);
            bail!("document '{doc_id}' produced no chunks (empty or whitespace-only text)");
        }

        self.progress.stage(&doc_id, IndexStage::Embedding);
        let progress = self.progress.clone();
        let doc_for_progress = doc_id.clone();
        let report = move |done: usize, total: usize| {
            progress.chunk_progress(&doc_for_progress, done, total);
        };
        let embedded = self
            .embedder
            .embed_batch(chunks, Some(&report))
            .await
            .with_context(|| format!("embedding chunks for document '{doc_id}'"))?;
        let chunks_embedded = embedded.len();

        if chunks_embedded * 2 < chunks_created {
            tracing::warn!(
                document_id = %doc_id,
                chunks_embedded,
                chunks_created,
                "More than half the chunks failed to embed"
            );
        }

        self.progress.stage(&doc_id, IndexStage::Storing);
        let chunks_stored = {
            let mut index = self.index.write().await;
            let removed = index.delete_document(&doc_id);
            if removed > 0 {
                tracing::info!(document_id = %doc_id, removed, "Replaced stale chunks");
            }
            index
                .add_chunks(embedded)
                .with_context(|| format!("storing chunks for document '{doc_id}'"))?
        };

        if let Some(ref path) = self.persist_path {
            let index = self.index.read().await;
            index
                .save(path)
                .await
                .with_context(|| format!("persisting index to {}", path.display()))?;
        }

        self.progress.stage(&doc_id, IndexStage::Completed);
        tracing::info!(
            document_id = %doc_id,
            chunks_created,
            chunks_embedded,
            chunks_stored,
            "Document indexed"
        );

        Ok(IndexSummary {
            document_id: doc_id,
            chunks_created,
            chunks_embedded,
            chunks_stored,
        })
    }

    /// Remove a document's chunks from the index; returns how many were
    /// deleted.
    pub async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let removed = {
            let mut index = self.index.write().await;
            index.delete_document(document_id)
        };

        if removed > 0 {
            if let Some(ref path) = self.persist_path {
                let index = self.index.read().await;
                index
                    .save(path)
                    .await
                    .with_context(|| format!("persisting index to {}", path.display()))?;
            }
        }

        Ok(removed)
    }
}
