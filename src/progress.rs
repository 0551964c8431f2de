use std::fmt;

/// Indexing pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStage {
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
}

impl fmt::Display for IndexStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexStage::Chunking => "chunking",
            IndexStage::Embedding => "embedding",
            IndexStage::Storing => "storing",
            IndexStage::Completed => "completed",
            IndexStage::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Receives progress updates from the indexing write path.
///
/// Implementations must be cheap: the embedder invokes `chunk_progress`
/// per batch while holding no locks, but a slow sink still stalls indexing.
pub trait ProgressSink: Send + Sync {
    fn stage(&self, document_id: &str, stage: IndexStage);
    fn chunk_progress(&self, document_id: &str, done: usize, total: usize);
}

/// Progress sink that reports through the tracing subscriber.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn stage(&self, document_id: &str, stage: IndexStage) {
        tracing::info!(document_id, %stage, "indexing stage");
    }

    fn chunk_progress(&self, document_id: &str, done: usize, total: usize) {
        let percent = if total > 0 {
            (done as f64 / total as f64 * 100.0) as u32
        } else {
            100
        };
        tracing::debug!(document_id, done, total, percent, "embedding progress");
    }
}

/// Progress sink that drops everything. Useful for callers that only want
/// the final result.
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn stage(&self, _document_id: &str, _stage: IndexStage) {}
    fn chunk_progress(&self, _document_id: &str, _done: usize, _total: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display_names() {
        assert_eq!(IndexStage::Chunking.to_string(), "chunking");
        assert_eq!(IndexStage::Embedding.to_string(), "embedding");
        assert_eq!(IndexStage::Storing.to_string(), "storing");
    }
}
