use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use crate::cache::{cache_key, CacheBackend, CachedAnswer};
use crate::config::Settings;
use crate::embeddings::Embedder;
use crate::error::{QueryError, TimeoutStage};
use crate::generator::{postprocess_answer, AnswerGenerator, ContextChunk, GenerationBackend};
use crate::vector_index::{SearchHit, VectorIndex};

const MAX_TOP_K: usize = 10;

/// Artificial pacing between words when replaying a cached answer on the
/// streaming path, for parity with live generation.
const CACHE_REPLAY_DELAY: Duration = Duration::from_millis(20);

const GREETING_ANSWER: &str = "Hello! I'm a document assistant. Ask me anything about the \
     indexed documents and I'll do my best to help.";

const EMPTY_INDEX_ANSWER: &str = "There are no documents indexed yet, so I have nothing to \
     search. Please index some documents and ask again.";

const NO_MATCH_ANSWER: &str = "I couldn't find any relevant information in the available \
     documents to answer your question. Please try rephrasing your question or contact support \
     directly for assistance.";

/// An incoming question. `top_k` is clamped into `1..=10`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            top_k: None,
        }
    }

    fn effective_top_k(&self, default: usize) -> usize {
        self.top_k.unwrap_or(default).clamp(1, MAX_TOP_K)
    }
}

/// One source document reference in a response, deduplicated by document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub document_id: String,
    pub title: String,
    pub relevance: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<usize>,
}

/// The externally observable answer shape. Always well-formed: failures
/// surface as an apology answer plus a machine-readable `error` code, never
/// as a bare crash.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub confidence: Option<f32>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Streaming event protocol: one `metadata`, then zero or more `chunk`s,
/// then exactly one `done`, or one `error` terminating the stream early.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Metadata {
        sources: Vec<SourceDocument>,
        confidence: f32,
    },
    Chunk {
        content: String,
    },
    Done,
    Error {
        error: String,
        message: String,
    },
}

/// Recognize pure greetings and small talk with no informational content.
/// Deliberately conservative: anything that looks like a real question falls
/// through to the pipeline.
pub fn is_greeting(question: &str) -> bool {
    let normalized: String = question
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'')
        .collect();
    let normalized = normalized.split_whitespace().collect::<Vec<_>>().join(" ");

    matches!(
        normalized.as_str(),
        "hi" | "hello"
            | "hey"
            | "hi there"
            | "hello there"
            | "hey there"
            | "good morning"
            | "good afternoon"
            | "good evening"
            | "good day"
            | "how are you"
            | "how are you doing"
            | "how's it going"
            | "hows it going"
            | "what's up"
            | "whats up"
            | "thanks"
            | "thank you"
            | "bye"
            | "goodbye"
            | "see you"
    )
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Average relevance of the top 3 hits (or fewer), rounded to 2 decimals.
/// A heuristic proxy, not a calibrated probability.
fn confidence_from_hits(hits: &[SearchHit]) -> f32 {
    if hits.is_empty() {
        return 0.0;
    }
    let n = hits.len().min(3);
    let sum: f32 = hits[..n].iter().map(|h| h.relevance).sum();
    round2(sum / n as f32)
}

/// Deduplicate hits into a source list, keeping the first (highest-ranked)
/// occurrence of each document.
fn sources_from_hits(hits: &[SearchHit]) -> Vec<SourceDocument> {
    let mut sources: Vec<SourceDocument> = Vec::new();
    for hit in hits {
        if sources
            .iter()
            .any(|s| s.document_id == hit.metadata.document_id)
        {
            continue;
        }
        sources.push(SourceDocument {
            document_id: hit.metadata.document_id.clone(),
            title: hit.metadata.document_title.clone(),
            relevance: hit.relevance,
            chunk_index: Some(hit.metadata.chunk_index),
        });
    }
    sources
}

/// Truncate to at most `budget` bytes without splitting a UTF-8 character.
fn truncate_to_boundary(text: &str, budget: usize) -> &str {
    if text.len() <= budget {
        return text;
    }
    let mut end = budget;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

enum Retrieved {
    EmptyIndex,
    NoMatch,
    Hits {
        context: Vec<ContextChunk>,
        sources: Vec<SourceDocument>,
        confidence: f32,
    },
}

/// The query state machine: greeting short-circuit, cache lookup, embed,
/// search, relevance filter, generate, cache store. Linear with early exits;
/// any error maps straight to a terminal error response without retries.
pub struct QueryOrchestrator {
    settings: Settings,
    embedder: Arc<dyn Embedder>,
    index: Arc<RwLock<VectorIndex>>,
    generator: AnswerGenerator,
    cache: Arc<dyn CacheBackend>,
}

impl QueryOrchestrator {
    pub fn new(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        index: Arc<RwLock<VectorIndex>>,
        generation: Arc<dyn GenerationBackend>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        Self {
            settings,
            embedder,
            index,
            generator: AnswerGenerator::new(generation),
            cache,
        }
    }

    fn response(
        answer: impl Into<String>,
        sources: Vec<SourceDocument>,
        confidence: Option<f32>,
    ) -> QueryResponse {
        QueryResponse {
            answer: answer.into(),
            sources,
            confidence,
            timestamp: Utc::now(),
            error: None,
        }
    }

    fn error_response(err: &QueryError) -> QueryResponse {
        tracing::error!(code = err.code(), "Query failed: {err:#}");
        QueryResponse {
            answer: format!(
                "I'm sorry, I couldn't process your question right now. Please {}.",
                err.remediation()
            ),
            sources: Vec::new(),
            confidence: None,
            timestamp: Utc::now(),
            error: Some(err.code().to_string()),
        }
    }

    /// Embed the question, search the index, and apply relevance filtering
    /// and the context character budget. Shared by both response modes.
    async fn retrieve(&self, question: &str, top_k: usize) -> Result<Retrieved, QueryError> {
        let query_vector = tokio::time::timeout(
            self.settings.embed_timeout(),
            self.embedder.embed_query(question),
        )
        .await
        .map_err(|_| QueryError::Timeout {
            stage: TimeoutStage::Embedding,
            seconds: self.settings.embed_timeout_secs,
        })??;

        tracing::debug!(dim = query_vector.len(), "Question embedded");

        let (hits, index_len) = {
            let index = tokio::time::timeout(self.settings.search_timeout(), self.index.read())
                .await
                .map_err(|_| QueryError::Timeout {
                    stage: TimeoutStage::Search,
                    seconds: self.settings.search_timeout_secs,
                })?;
            (index.search(&query_vector, top_k, None)?, index.len())
        };

        if hits.is_empty() {
            return Ok(if index_len == 0 {
                Retrieved::EmptyIndex
            } else {
                Retrieved::NoMatch
            });
        }

        // Drop weak hits, but never starve the answer of context: an
        // over-strict threshold falls back to the unfiltered results.
        let filtered: Vec<SearchHit> = hits
            .iter()
            .filter(|h| h.relevance >= self.settings.min_relevance)
            .cloned()
            .collect();
        let hits = if filtered.is_empty() {
            tracing::debug!(
                threshold = self.settings.min_relevance,
                "Relevance filter emptied results, using unfiltered set"
            );
            hits
        } else {
            filtered
        };

        let sources = sources_from_hits(&hits);
        let confidence = confidence_from_hits(&hits);
        let context = self.assemble_context(&hits);

        Ok(Retrieved::Hits {
            context,
            sources,
            confidence,
        })
    }

    /// Build the generation context within the character budget, keeping
    /// hits in rank order and dropping the weakest that don't fit. A single
    /// oversized top hit is truncated rather than dropped.
    fn assemble_context(&self, hits: &[SearchHit]) -> Vec<ContextChunk> {
        let budget = self.settings.max_context_chars;
        let mut context = Vec::new();
        let mut used = 0usize;

        for hit in hits {
            if used + hit.text.len() <= budget {
                used += hit.text.len();
                context.push(ContextChunk {
                    text: hit.text.clone(),
                    document_id: hit.metadata.document_id.clone(),
                    document_title: hit.metadata.document_title.clone(),
                });
            } else if context.is_empty() {
                let truncated = truncate_to_boundary(&hit.text, budget);
                tracing::warn!(
                    original = hit.text.len(),
                    kept = truncated.len(),
                    "Top hit alone exceeds context budget, truncating"
                );
                context.push(ContextChunk {
                    text: truncated.to_string(),
                    document_id: hit.metadata.document_id.clone(),
                    document_title: hit.metadata.document_title.clone(),
                });
                break;
            } else {
                tracing::debug!(
                    dropped = hit.text.len(),
                    used,
                    budget,
                    "Context budget reached, dropping remaining hits"
                );
                break;
            }
        }

        context
    }

    async fn run_query(&self, request: &QueryRequest) -> Result<QueryResponse, QueryError> {
        let question = request.question.trim();
        if question.is_empty() {
            return Err(crate::error::LlmError::EmptyQuestion.into());
        }
        let top_k = request.effective_top_k(self.settings.top_k_default);

        let retrieved = self.retrieve(question, top_k).await?;
        let (context, sources, confidence) = match retrieved {
            Retrieved::EmptyIndex => {
                return Ok(Self::response(EMPTY_INDEX_ANSWER, Vec::new(), Some(0.0)));
            }
            Retrieved::NoMatch => {
                return Ok(Self::response(NO_MATCH_ANSWER, Vec::new(), Some(0.0)));
            }
            Retrieved::Hits {
                context,
                sources,
                confidence,
                ..
            } => (context, sources, confidence),
        };

        let answer = tokio::time::timeout(
            self.settings.generate_timeout(),
            self.generator.answer(
                question,
                &context,
                self.settings.temperature,
                self.settings.max_answer_tokens,
            ),
        )
        .await
        .map_err(|_| QueryError::Timeout {
            stage: TimeoutStage::Generation,
            seconds: self.settings.generate_timeout_secs,
        })??;

        self.cache
            .set(
                &cache_key(question),
                CachedAnswer {
                    answer: answer.clone(),
                    sources: sources.clone(),
                    confidence: Some(confidence),
                },
                self.settings.cache_ttl(),
            )
            .await;

        tracing::info!(
            sources = sources.len(),
            confidence,
            "Query answered"
        );
        Ok(Self::response(answer, sources, Some(confidence)))
    }

    /// Answer a question end to end. Always returns a well-formed response;
    /// pipeline failures become an apology plus a stable error code.
    pub async fn query(&self, request: QueryRequest) -> QueryResponse {
        let question = request.question.trim();

        if is_greeting(question) {
            tracing::debug!("Greeting short-circuit");
            return Self::response(GREETING_ANSWER, Vec::new(), Some(1.0));
        }

        if !question.is_empty() {
            if let Some(cached) = self.cache.get(&cache_key(question)).await {
                tracing::debug!("Cache hit");
                return Self::response(cached.answer, cached.sources, cached.confidence);
            }
        }

        match self.run_query(&request).await {
            Ok(response) => response,
            Err(err) => Self::error_response(&err),
        }
    }

    /// Answer a question as a stream of typed events: one `metadata`, then
    /// content `chunk`s, then `done`, or a single `error` event on failure.
    /// Dropping the returned stream cancels in-flight generation.
    pub async fn query_stream(self: Arc<Self>, request: QueryRequest) -> ReceiverStream<StreamEvent> {
        let (tx, rx) = mpsc::channel(32);
        let orchestrator = Arc::clone(&self);

        tokio::spawn(async move {
            orchestrator.stream_inner(request, tx).await;
        });

        ReceiverStream::new(rx)
    }

    async fn stream_inner(&self, request: QueryRequest, tx: mpsc::Sender<StreamEvent>) {
        let question = request.question.trim().to_string();

        if is_greeting(&question) {
            tracing::debug!("Greeting short-circuit (stream)");
            Self::emit_canned(&tx, GREETING_ANSWER, Vec::new(), 1.0, false).await;
            return;
        }

        if question.is_empty() {
            let err = QueryError::from(crate::error::LlmError::EmptyQuestion);
            let _ = tx
                .send(StreamEvent::Error {
                    error: err.code().to_string(),
                    message: err.to_string(),
                })
                .await;
            return;
        }

        if let Some(cached) = self.cache.get(&cache_key(&question)).await {
            tracing::debug!("Cache hit (stream replay)");
            if tx
                .send(StreamEvent::Metadata {
                    sources: cached.sources,
                    confidence: cached.confidence.unwrap_or(0.0),
                })
                .await
                .is_err()
            {
                return;
            }
            // Replay word by word with pacing for parity with live output.
            let words: Vec<&str> = cached.answer.split_inclusive(' ').collect();
            for word in words {
                if tx
                    .send(StreamEvent::Chunk {
                        content: word.to_string(),
                    })
                    .await
                    .is_err()
                {
                    return;
                }
                tokio::time::sleep(CACHE_REPLAY_DELAY).await;
            }
            let _ = tx.send(StreamEvent::Done).await;
            return;
        }

        let top_k = request.effective_top_k(self.settings.top_k_default);
        let retrieved = match self.retrieve(&question, top_k).await {
            Ok(r) => r,
            Err(err) => {
                tracing::error!(code = err.code(), "Streaming query failed: {err:#}");
                let _ = tx
                    .send(StreamEvent::Error {
                        error: err.code().to_string(),
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        };

        let (context, sources, confidence) = match retrieved {
            Retrieved::EmptyIndex => {
                Self::emit_canned(&tx, EMPTY_INDEX_ANSWER, Vec::new(), 0.0, true).await;
                return;
            }
            Retrieved::NoMatch => {
                Self::emit_canned(&tx, NO_MATCH_ANSWER, Vec::new(), 0.0, true).await;
                return;
            }
            Retrieved::Hits {
                context,
                sources,
                confidence,
                ..
            } => (context, sources, confidence),
        };

        if tx
            .send(StreamEvent::Metadata {
                sources: sources.clone(),
                confidence,
            })
            .await
            .is_err()
        {
            return;
        }

        let mut fragments = match self
            .generator
            .answer_stream(&question, &context, self.settings.temperature)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                let err = QueryError::from(e);
                let _ = tx
                    .send(StreamEvent::Error {
                        error: err.code().to_string(),
                        message: err.to_string(),
                    })
                    .await;
                return;
            }
        };

        // One deadline for the whole generation, not per fragment.
        let deadline = tokio::time::Instant::now() + self.settings.generate_timeout();
        let mut full_answer = String::new();

        loop {
            let fragment = match tokio::time::timeout_at(deadline, fragments.recv()).await {
                Ok(f) => f,
                Err(_) => {
                    let err = QueryError::Timeout {
                        stage: TimeoutStage::Generation,
                        seconds: self.settings.generate_timeout_secs,
                    };
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: err.code().to_string(),
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
            };

            match fragment {
                Some(Ok(content)) => {
                    full_answer.push_str(&content);
                    if tx.send(StreamEvent::Chunk { content }).await.is_err() {
                        // Caller disconnected: dropping `fragments` cancels
                        // the upstream generation.
                        return;
                    }
                }
                Some(Err(e)) => {
                    let err = QueryError::from(e);
                    tracing::error!(code = err.code(), "Generation stream failed: {err:#}");
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: err.code().to_string(),
                            message: err.to_string(),
                        })
                        .await;
                    return;
                }
                None => break,
            }
        }

        if !full_answer.trim().is_empty() {
            // Cache the same shape the non-streaming path returns, so a
            // later cache hit in either mode reads identically.
            self.cache
                .set(
                    &cache_key(&question),
                    CachedAnswer {
                        answer: postprocess_answer(&full_answer),
                        sources,
                        confidence: Some(confidence),
                    },
                    self.settings.cache_ttl(),
                )
                .await;
        }

        let _ = tx.send(StreamEvent::Done).await;
    }

    /// Emit a fixed answer over the streaming protocol: metadata, one chunk,
    /// done.
    async fn emit_canned(
        tx: &mpsc::Sender<StreamEvent>,
        answer: &str,
        sources: Vec<SourceDocument>,
        confidence: f32,
        log_no_results: bool,
    ) {
        if log_no_results {
            tracing::warn!("No relevant documents found for query");
        }
        if tx
            .send(StreamEvent::Metadata {
                sources,
                confidence,
            })
            .await
            .is_err()
        {
            return;
        }
        if tx
            .send(StreamEvent::Chunk {
                content: answer.to_string(),
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = tx.send(StreamEvent::Done).await;
    }
}
