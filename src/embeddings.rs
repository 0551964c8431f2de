use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tokio::sync::RwLock;

use crate::chunker::Chunk;
use crate::config::Settings;
use crate::error::EmbeddingError;

/// A chunk paired with its embedding vector, ready for the index.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Callback invoked as batch embedding advances: `(done, total)` chunks.
pub type EmbedProgress<'a> = &'a (dyn Fn(usize, usize) + Send + Sync);

/// Seam between the pipeline and the embedding backend. Production uses
/// [`OllamaEmbedder`]; tests substitute deterministic vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. Empty input is an error, not a zero vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Embed a query, with caching where the implementation supports it.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed(text).await
    }

    /// Embed a batch of chunks, tolerating individual failures.
    ///
    /// Chunks that fail to embed are dropped with a warning; the call only
    /// errors when every chunk fails. Relative order of surviving chunks is
    /// preserved.
    async fn embed_batch(
        &self,
        chunks: Vec<Chunk>,
        progress: Option<EmbedProgress<'_>>,
    ) -> Result<Vec<EmbeddedChunk>, EmbeddingError>;

    fn model_name(&self) -> &str;
}

#[derive(Serialize)]
#[serde(untagged)]
enum OllamaEmbeddingRequest<'a> {
    Single { model: &'a str, input: &'a str },
    Batch { model: &'a str, input: &'a [String] },
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

/// Embedding client against the Ollama API, with an LRU cache for query
/// embeddings. Batch requests go through `/api/embed`; models without batch
/// support fall back to sequential requests.
pub struct OllamaEmbedder {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl OllamaEmbedder {
    pub fn new(settings: &Settings) -> Result<Self, EmbeddingError> {
        let cache_size = NonZeroUsize::new(settings.embedding_cache_size)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(settings.embed_timeout())
                .build()
                .map_err(|e| EmbeddingError::Backend(e.to_string()))?,
            ollama_url: settings.ollama_url.clone(),
            model: settings.embedding_model.clone(),
            query_cache: RwLock::new(LruCache::new(cache_size)),
        })
    }

    /// Verify the backend is reachable and the configured model is pulled.
    /// Run once at startup so failures surface immediately, not on the first
    /// query.
    pub async fn preflight(&self) -> Result<(), EmbeddingError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.ollama_url))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Unreachable {
                url: self.ollama_url.clone(),
            });
        }

        let tags: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;

        let models = tags["models"]
            .as_array()
            .ok_or_else(|| EmbeddingError::Backend("cannot list models".to_string()))?;

        let exists = models
            .iter()
            .any(|m| m["name"].as_str().unwrap_or("").starts_with(&self.model));

        if !exists {
            let available = models
                .iter()
                .filter_map(|m| m["name"].as_str().map(String::from))
                .collect();
            return Err(EmbeddingError::ModelMissing {
                model: self.model.clone(),
                available,
            });
        }

        tracing::info!("Embedding model '{}' verified", self.model);
        Ok(())
    }

    fn classify(&self, e: reqwest::Error) -> EmbeddingError {
        if e.is_connect() || e.is_timeout() {
            EmbeddingError::Unreachable {
                url: self.ollama_url.clone(),
            }
        } else {
            EmbeddingError::Backend(e.to_string())
        }
    }

    async fn request_single(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let request = OllamaEmbeddingRequest::Single {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Backend(format!("{status} - {body}")));
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;

        if let Some(embedding) = parsed.embedding {
            Ok(embedding)
        } else if let Some(embeddings) = parsed.embeddings {
            embeddings
                .into_iter()
                .next()
                .ok_or(EmbeddingError::MissingVector)
        } else {
            Err(EmbeddingError::MissingVector)
        }
    }

    /// One batch call to `/api/embed`. Returns `None` when the model or
    /// server did not honor the batch shape, so the caller can fall back to
    /// sequential requests.
    async fn request_batch(
        &self,
        texts: &[String],
    ) -> Result<Option<Vec<Vec<f32>>>, EmbeddingError> {
        let request = OllamaEmbeddingRequest::Batch {
            model: &self.model,
            input: texts,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Backend(format!("{status} - {body}")));
        }

        let parsed: OllamaEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::Backend(e.to_string()))?;

        match parsed.embeddings {
            Some(embeddings) if embeddings.len() == texts.len() => Ok(Some(embeddings)),
            Some(embeddings) => {
                tracing::warn!(
                    "Batch embedding returned {} vectors for {} texts, falling back to sequential",
                    embeddings.len(),
                    texts.len()
                );
                Ok(None)
            }
            None => {
                tracing::warn!(
                    "Model '{}' doesn't support batch embeddings, falling back to sequential",
                    self.model
                );
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        self.request_single(text).await
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::EmptyInput);
        }
        if let Some(cached) = self.query_cache.write().await.get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.request_single(text).await?;
        self.query_cache
            .write()
            .await
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    async fn embed_batch(
        &self,
        chunks: Vec<Chunk>,
        progress: Option<EmbedProgress<'_>>,
    ) -> Result<Vec<EmbeddedChunk>, EmbeddingError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }
        let total = chunks.len();

        // Fail fast before any batch work: an unreachable backend or a
        // missing model should surface as one descriptive error, not as a
        // chunk-by-chunk failure cascade.
        self.preflight().await?;

        // Fast path: one batch request covering every chunk.
        if total > 1 {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            if let Some(vectors) = self.request_batch(&texts).await? {
                if let Some(report) = progress {
                    report(total, total);
                }
                return Ok(chunks
                    .into_iter()
                    .zip(vectors)
                    .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
                    .collect());
            }
        }

        // Sequential path, tolerating individual failures.
        let mut embedded = Vec::with_capacity(total);
        let mut failures: Vec<String> = Vec::new();

        for (i, chunk) in chunks.into_iter().enumerate() {
            match self.request_single(&chunk.text).await {
                Ok(vector) => embedded.push(EmbeddedChunk { chunk, vector }),
                Err(e) => {
                    tracing::warn!(
                        chunk_index = chunk.chunk_index,
                        document_id = %chunk.document_id,
                        "Failed to embed chunk: {e}"
                    );
                    if failures.len() < 3 {
                        failures.push(e.to_string());
                    }
                }
            }
            if let Some(report) = progress {
                report(i + 1, total);
            }
        }

        if embedded.is_empty() {
            return Err(EmbeddingError::AllChunksFailed {
                total,
                summary: failures.join("; "),
            });
        }

        if embedded.len() < total {
            tracing::warn!(
                "Embedded {} of {} chunks; {} failed and were skipped",
                embedded.len(),
                total,
                total - embedded.len()
            );
        }

        Ok(embedded)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
