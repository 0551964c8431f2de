use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::StreamExt;

use rag_service::cache::MemoryCache;
use rag_service::chunker::{PageText, TextChunker};
use rag_service::config::Settings;
use rag_service::embeddings::{EmbedProgress, EmbeddedChunk, Embedder};
use rag_service::error::{EmbeddingError, LlmError};
use rag_service::generator::GenerationBackend;
use rag_service::indexer::{ExtractedDocument, Indexer};
use rag_service::orchestrator::{QueryOrchestrator, QueryRequest, StreamEvent};
use rag_service::progress::NullProgress;
use rag_service::vector_index::VectorIndex;

fn test_settings() -> Settings {
    Settings {
        ollama_url: "http://localhost:11434".to_string(),
        embedding_model: "mock-embed".to_string(),
        llm_model: "mock-llm".to_string(),
        data_dir: "./data".to_string(),
        chunk_size: 50,
        chunk_overlap: 10,
        top_k_default: 5,
        min_relevance: 0.3,
        max_context_chars: 8000,
        temperature: 0.7,
        max_answer_tokens: 500,
        embed_timeout_secs: 5,
        search_timeout_secs: 5,
        generate_timeout_secs: 5,
        cache_ttl_secs: 3600,
        embedding_cache_size: 100,
    }
}

/// Deterministic 3-dim embedding keyed on topic words, so queries about
/// "license" land near license chunks and far from "roadwork" chunks.
fn mock_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    if lower.contains("license") {
        vec![1.0, 0.1, 0.0]
    } else if lower.contains("roadwork") {
        vec![0.0, 0.1, 1.0]
    } else {
        vec![0.3, 1.0, 0.3]
    }
}

struct MockEmbedder {
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl MockEmbedder {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        }
    }

    fn failing_on(call: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_on_call: Some(call),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(EmbeddingError::Backend("mock backend failure".to_string()));
        }
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        Ok(mock_vector(text))
    }

    async fn embed_batch(
        &self,
        chunks: Vec<rag_service::chunker::Chunk>,
        progress: Option<EmbedProgress<'_>>,
    ) -> Result<Vec<EmbeddedChunk>, EmbeddingError> {
        let total = chunks.len();
        let mut embedded = Vec::new();
        let mut failures = Vec::new();
        for (i, chunk) in chunks.into_iter().enumerate() {
            match self.embed(&chunk.text).await {
                Ok(vector) => embedded.push(EmbeddedChunk { chunk, vector }),
                Err(e) => failures.push(e.to_string()),
            }
            if let Some(report) = progress {
                report(i + 1, total);
            }
        }
        if embedded.is_empty() && total > 0 {
            return Err(EmbeddingError::AllChunksFailed {
                total,
                summary: failures.join("; "),
            });
        }
        Ok(embedded)
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

struct MockGenerator {
    calls: AtomicUsize,
    fragments: Vec<String>,
    fail_mid_stream: bool,
}

impl MockGenerator {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fragments: vec![
                "The license fee ".to_string(),
                "is fifty dollars, ".to_string(),
                "payable at any office.".to_string(),
            ],
            fail_mid_stream: false,
        }
    }

    fn failing_mid_stream() -> Self {
        Self {
            fail_mid_stream: true,
            ..Self::new()
        }
    }

    fn with_fragments(fragments: Vec<&str>) -> Self {
        Self {
            fragments: fragments.into_iter().map(String::from).collect(),
            ..Self::new()
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for MockGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.fragments.concat())
    }

    async fn generate_stream(
        &self,
        _prompt: &str,
        _temperature: f32,
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        let fragments = self.fragments.clone();
        let fail = self.fail_mid_stream;
        tokio::spawn(async move {
            for (i, fragment) in fragments.into_iter().enumerate() {
                if fail && i == 1 {
                    let _ = tx
                        .send(Err(LlmError::Stream("mock stream failure".to_string())))
                        .await;
                    return;
                }
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    fn model_name(&self) -> &str {
        "mock-llm"
    }
}

/// Embedder that never answers within any reasonable budget.
struct SlowEmbedder;

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(vec![1.0, 0.0, 0.0])
    }

    async fn embed_batch(
        &self,
        _chunks: Vec<rag_service::chunker::Chunk>,
        _progress: Option<EmbedProgress<'_>>,
    ) -> Result<Vec<EmbeddedChunk>, EmbeddingError> {
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(Vec::new())
    }

    fn model_name(&self) -> &str {
        "mock-embed"
    }
}

struct Harness {
    orchestrator: Arc<QueryOrchestrator>,
    embedder: Arc<MockEmbedder>,
    generator: Arc<MockGenerator>,
    index: Arc<RwLock<VectorIndex>>,
}

async fn harness_with(generator: MockGenerator, documents: &[(&str, &str)]) -> Harness {
    let settings = test_settings();
    let embedder = Arc::new(MockEmbedder::new());
    let generator = Arc::new(generator);
    let index = Arc::new(RwLock::new(VectorIndex::new("mock-embed")));

    if !documents.is_empty() {
        let chunker = TextChunker::new(settings.chunk_size, settings.chunk_overlap).unwrap();
        let indexer = Indexer::new(
            chunker,
            embedder.clone(),
            index.clone(),
            Arc::new(NullProgress),
            None,
        );
        for (id, text) in documents {
            indexer
                .index_document(ExtractedDocument {
                    document_id: id.to_string(),
                    title: format!("{id} title"),
                    pages: vec![PageText {
                        page_number: 1,
                        text: text.to_string(),
                    }],
                })
                .await
                .unwrap();
        }
        // Reset counters so tests observe query-path calls only.
        embedder.calls.store(0, Ordering::SeqCst);
    }

    let orchestrator = Arc::new(QueryOrchestrator::new(
        settings,
        embedder.clone(),
        index.clone(),
        generator.clone(),
        Arc::new(MemoryCache::new()),
    ));

    Harness {
        orchestrator,
        embedder,
        generator,
        index,
    }
}

async fn default_harness() -> Harness {
    harness_with(
        MockGenerator::new(),
        &[
            ("license-guide", "The license fee is fifty dollars. A license renewal requires your identity document and the license fee."),
            ("roadwork-notice", "Roadwork on the northern route continues through March. Expect roadwork delays."),
        ],
    )
    .await
}

#[tokio::test]
async fn greeting_bypasses_embedding_and_generation() {
    let h = default_harness().await;

    let response = h.orchestrator.query(QueryRequest::new("Good morning!")).await;

    assert_eq!(response.confidence, Some(1.0));
    assert!(response.sources.is_empty());
    assert!(response.error.is_none());
    assert_eq!(h.embedder.call_count(), 0, "greeting must not embed");
    assert_eq!(h.generator.call_count(), 0, "greeting must not generate");
}

#[tokio::test]
async fn repeated_question_is_served_from_cache() {
    let h = default_harness().await;

    let first = h
        .orchestrator
        .query(QueryRequest::new("What is the license fee?"))
        .await;
    assert!(first.error.is_none());
    let embeds_after_first = h.embedder.call_count();
    let generates_after_first = h.generator.call_count();
    assert_eq!(generates_after_first, 1);

    // Same question, different casing and whitespace: same cache key.
    let second = h
        .orchestrator
        .query(QueryRequest::new("  what is the LICENSE fee?  "))
        .await;

    assert_eq!(second.answer, first.answer);
    assert_eq!(second.sources, first.sources);
    assert_eq!(second.confidence, first.confidence);
    assert_eq!(h.embedder.call_count(), embeds_after_first, "cache hit must not embed");
    assert_eq!(h.generator.call_count(), generates_after_first, "cache hit must not generate");
}

#[tokio::test]
async fn empty_index_and_no_match_answers_differ() {
    let empty = harness_with(MockGenerator::new(), &[]).await;
    let empty_answer = empty
        .orchestrator
        .query(QueryRequest::new("What is the license fee?"))
        .await;
    assert!(empty_answer.sources.is_empty());
    assert_eq!(empty_answer.confidence, Some(0.0));
    assert_eq!(empty.generator.call_count(), 0);

    // Populated index whose vectors can't match the query's dimensionality:
    // the search comes back empty even though documents exist.
    let populated = default_harness().await;
    {
        let mut index = populated.index.write().await;
        let records = std::mem::replace(&mut *index, VectorIndex::new("mock-embed"));
        drop(records);
        index
            .add_chunks(vec![EmbeddedChunk {
                chunk: rag_service::chunker::Chunk {
                    text: "other-model chunk".to_string(),
                    chunk_index: 0,
                    total_chunks: 1,
                    token_count: 3,
                    start_char: 0,
                    end_char: 17,
                    page_number: None,
                    document_id: "legacy-doc".to_string(),
                    document_title: "Legacy".to_string(),
                },
                vector: vec![1.0, 0.0],
            }])
            .unwrap();
    }
    let no_match = populated
        .orchestrator
        .query(QueryRequest::new("What is the license fee?"))
        .await;

    assert!(no_match.sources.is_empty());
    assert_ne!(
        empty_answer.answer, no_match.answer,
        "empty index and no-match must read differently"
    );
}

#[tokio::test]
async fn partial_embedding_failure_still_indexes_surviving_chunks() {
    let embedder = Arc::new(MockEmbedder::failing_on(2));
    let index = Arc::new(RwLock::new(VectorIndex::new("mock-embed")));
    // Zero overlap so three short pages become exactly three chunks.
    let chunker = TextChunker::new(10, 0).unwrap();
    let indexer = Indexer::new(
        chunker,
        embedder.clone(),
        index.clone(),
        Arc::new(NullProgress),
        None,
    );

    let summary = indexer
        .index_document(ExtractedDocument {
            document_id: "doc".to_string(),
            title: "Doc".to_string(),
            pages: vec![
                PageText {
                    page_number: 1,
                    text: "First page text here.".to_string(),
                },
                PageText {
                    page_number: 2,
                    text: "Second page text here.".to_string(),
                },
                PageText {
                    page_number: 3,
                    text: "Third page text here.".to_string(),
                },
            ],
        })
        .await
        .unwrap();

    assert_eq!(summary.chunks_created, 3);
    assert_eq!(summary.chunks_embedded, 2, "the failed chunk is dropped");
    assert_eq!(summary.chunks_stored, 2);

    let index = index.read().await;
    assert_eq!(index.len(), 2);
    let hits = index.search(&[0.3, 1.0, 0.3], 5, None).unwrap();
    let indices: Vec<usize> = hits.iter().map(|h| h.metadata.chunk_index).collect();
    assert!(indices.contains(&0) && indices.contains(&2));
    assert!(!indices.contains(&1), "failed chunk must not be stored");
}

#[tokio::test]
async fn query_response_sources_are_ranked_and_bounded() {
    let h = default_harness().await;

    let response = h
        .orchestrator
        .query(QueryRequest::new("How do I renew my license?"))
        .await;

    assert!(response.error.is_none());
    assert!(!response.sources.is_empty());
    assert_eq!(
        response.sources[0].document_id, "license-guide",
        "the on-topic document ranks first"
    );
    for source in &response.sources {
        assert!((0.0..=1.0).contains(&source.relevance));
    }
    let confidence = response.confidence.unwrap();
    assert!((0.0..=1.0).contains(&confidence));
}

#[tokio::test]
async fn stream_emits_metadata_then_chunks_then_done() {
    let h = default_harness().await;

    let events: Vec<StreamEvent> = h
        .orchestrator
        .clone()
        .query_stream(QueryRequest::new("What is the license fee?"))
        .await
        .collect()
        .await;

    assert!(
        matches!(events.first(), Some(StreamEvent::Metadata { .. })),
        "first event must be metadata"
    );
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    let chunk_count = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Chunk { .. }))
        .count();
    assert!(chunk_count >= 1, "at least one content fragment");

    // No content after done, no error events on the happy path.
    let done_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Done))
        .unwrap();
    assert_eq!(done_pos, events.len() - 1);
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::Error { .. })));

    let answer: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(answer, "The license fee is fifty dollars, payable at any office.");
}

#[tokio::test]
async fn stream_failure_ends_with_single_error_event() {
    let h = harness_with(
        MockGenerator::failing_mid_stream(),
        &[("license-guide", "The license fee is fifty dollars.")],
    )
    .await;

    let events: Vec<StreamEvent> = h
        .orchestrator
        .clone()
        .query_stream(QueryRequest::new("What is the license fee?"))
        .await
        .collect()
        .await;

    assert!(matches!(events.first(), Some(StreamEvent::Metadata { .. })));
    assert!(
        matches!(events.last(), Some(StreamEvent::Error { .. })),
        "stream must terminate with the error event"
    );
    let error_count = events
        .iter()
        .filter(|e| matches!(e, StreamEvent::Error { .. }))
        .count();
    assert_eq!(error_count, 1, "exactly one error event");
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Done)));

    if let Some(StreamEvent::Error { error, .. }) = events.last() {
        assert_eq!(error, "LLM_ERROR");
    }
}

#[tokio::test]
async fn greeting_stream_reports_full_confidence_and_no_sources() {
    let h = default_harness().await;

    let events: Vec<StreamEvent> = h
        .orchestrator
        .clone()
        .query_stream(QueryRequest::new("hello"))
        .await
        .collect()
        .await;

    match events.first() {
        Some(StreamEvent::Metadata {
            sources,
            confidence,
        }) => {
            assert!(sources.is_empty());
            assert_eq!(*confidence, 1.0);
        }
        other => panic!("expected metadata first, got {other:?}"),
    }
    assert!(matches!(events.last(), Some(StreamEvent::Done)));
    assert_eq!(h.embedder.call_count(), 0);
    assert_eq!(h.generator.call_count(), 0);
}

#[tokio::test]
async fn cached_answer_replays_over_the_stream() {
    let h = default_harness().await;

    let first = h
        .orchestrator
        .query(QueryRequest::new("What is the license fee?"))
        .await;
    let generates_after_first = h.generator.call_count();

    let events: Vec<StreamEvent> = h
        .orchestrator
        .clone()
        .query_stream(QueryRequest::new("What is the license fee?"))
        .await
        .collect()
        .await;

    assert_eq!(
        h.generator.call_count(),
        generates_after_first,
        "replay must not call the generator"
    );
    assert!(matches!(events.first(), Some(StreamEvent::Metadata { .. })));
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    let replayed: String = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(replayed, first.answer);
}

#[tokio::test]
async fn weak_hits_fall_back_to_the_unfiltered_result_set() {
    // Both documents sit far from a "license" query, so every hit scores
    // below min_relevance = 0.3: equal distances normalize to relevance 0.
    let h = harness_with(
        MockGenerator::new(),
        &[
            ("roadwork-north", "Roadwork on the northern route."),
            ("roadwork-south", "Roadwork on the southern route."),
        ],
    )
    .await;

    let response = h
        .orchestrator
        .query(QueryRequest::new("What is the license fee?"))
        .await;

    assert!(response.error.is_none());
    assert_eq!(
        h.generator.call_count(),
        1,
        "the unfiltered fallback must still reach generation"
    );
    assert!(
        !response.sources.is_empty(),
        "fallback keeps the unfiltered sources"
    );
    assert_eq!(response.sources.len(), 2);
}

#[tokio::test]
async fn embedding_timeout_yields_a_typed_timeout_response() {
    let mut settings = test_settings();
    settings.embed_timeout_secs = 0;

    let generator = Arc::new(MockGenerator::new());
    let orchestrator = Arc::new(QueryOrchestrator::new(
        settings,
        Arc::new(SlowEmbedder),
        Arc::new(RwLock::new(VectorIndex::new("mock-embed"))),
        generator.clone(),
        Arc::new(MemoryCache::new()),
    ));

    let response = orchestrator
        .query(QueryRequest::new("What is the license fee?"))
        .await;

    assert_eq!(response.error.as_deref(), Some("TIMEOUT_ERROR"));
    assert!(!response.answer.is_empty(), "apology text, not a bare code");
    assert!(response.sources.is_empty());
    assert_eq!(generator.call_count(), 0);

    // Streaming variant terminates with the same typed error.
    let events: Vec<StreamEvent> = orchestrator
        .clone()
        .query_stream(QueryRequest::new("Where do I renew a permit?"))
        .await
        .collect()
        .await;
    match events.as_slice() {
        [StreamEvent::Error { error, .. }] => assert_eq!(error, "TIMEOUT_ERROR"),
        other => panic!("expected a single error event, got {other:?}"),
    }
}

#[tokio::test]
async fn streamed_answer_is_postprocessed_before_caching() {
    let h = harness_with(
        MockGenerator::with_fragments(vec!["Email info@example.com ", "for assistance."]),
        &[("license-guide", "The license office email is info@example.com.")],
    )
    .await;

    let events: Vec<StreamEvent> = h
        .orchestrator
        .clone()
        .query_stream(QueryRequest::new("How do I contact the license office?"))
        .await
        .collect()
        .await;
    assert!(matches!(events.last(), Some(StreamEvent::Done)));

    // Re-asking without streaming serves the cached answer, which must be
    // formatted exactly as a live non-streaming answer would be.
    let cached = h
        .orchestrator
        .query(QueryRequest::new("How do I contact the license office?"))
        .await;

    assert_eq!(
        h.generator.call_count(),
        1,
        "second ask must be a cache hit"
    );
    assert_eq!(
        cached.answer,
        rag_service::generator::postprocess_answer("Email info@example.com for assistance."),
    );
    assert!(cached.answer.starts_with("**"), "contact line is emphasized");
}

#[tokio::test]
async fn empty_question_returns_wellformed_error_response() {
    let h = default_harness().await;

    let response = h.orchestrator.query(QueryRequest::new("   ")).await;

    assert_eq!(response.error.as_deref(), Some("LLM_ERROR"));
    assert!(!response.answer.is_empty(), "apology text, not a bare code");
    assert!(response.sources.is_empty());
    assert_eq!(h.generator.call_count(), 0);
}
