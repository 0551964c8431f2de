use thiserror::Error;

/// Errors raised while turning text into embedding vectors.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("cannot generate embedding for empty text")]
    EmptyInput,

    #[error("cannot connect to embedding backend at {url}. Make sure Ollama is running.")]
    Unreachable { url: String },

    #[error(
        "embedding model '{model}' not found. Available: {available:?}. Run: ollama pull {model}"
    )]
    ModelMissing {
        model: String,
        available: Vec<String>,
    },

    #[error("embedding backend error: {0}")]
    Backend(String),

    #[error("no embedding returned from backend")]
    MissingVector,

    #[error("all {total} chunks failed to embed. First errors: {summary}")]
    AllChunksFailed { total: usize, summary: String },
}

/// Errors raised by the vector index.
#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("vector index is not available")]
    Unavailable,

    #[error("query embedding cannot be empty")]
    EmptyQueryVector,

    #[error("no valid embeddings found in chunks")]
    NoEmbeddings,

    #[error("index file was built for model '{found}', expected '{expected}'")]
    ModelMismatch { expected: String, found: String },

    #[error("index I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("index serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised during answer generation.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("question cannot be empty")]
    EmptyQuestion,

    #[error("cannot connect to generation backend at {url}. Make sure Ollama is running.")]
    Unreachable { url: String },

    #[error("generation model '{model}' not found. Run: ollama pull {model}")]
    ModelMissing { model: String },

    #[error("generation backend error: {0}")]
    Backend(String),

    #[error("no answer generated")]
    EmptyAnswer,

    #[error("generation stream failed: {0}")]
    Stream(String),
}

/// Pipeline stage used to label timeout errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    Embedding,
    Search,
    Generation,
}

impl std::fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutStage::Embedding => write!(f, "embedding"),
            TimeoutStage::Search => write!(f, "search"),
            TimeoutStage::Generation => write!(f, "generation"),
        }
    }
}

/// Top-level error type for a query passing through the orchestrator.
///
/// Every variant maps to a stable machine-readable code plus a remediation
/// hint; raw backend detail stays in the error chain and the server-side log,
/// never in the user-facing message.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    VectorStore(#[from] VectorStoreError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("{stage} timed out after {seconds}s")]
    Timeout { stage: TimeoutStage, seconds: u64 },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl QueryError {
    /// Stable machine-readable error code for the response envelope.
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::Embedding(_) => "EMBEDDING_ERROR",
            QueryError::VectorStore(_) => "VECTOR_STORE_ERROR",
            QueryError::Llm(_) => "LLM_ERROR",
            QueryError::Timeout { .. } => "TIMEOUT_ERROR",
            QueryError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Concrete next step for the operator, depending on what actually failed.
    pub fn remediation(&self) -> &'static str {
        match self {
            QueryError::Embedding(EmbeddingError::ModelMissing { .. })
            | QueryError::Llm(LlmError::ModelMissing { .. }) => {
                "pull the configured model (ollama pull <model>)"
            }
            QueryError::Embedding(EmbeddingError::Unreachable { .. })
            | QueryError::Llm(LlmError::Unreachable { .. }) => {
                "check that the Ollama backend is running and reachable"
            }
            QueryError::Timeout { .. } => "retry; if it persists, the backend may be overloaded",
            _ => "retry the request; check service logs if the problem persists",
        }
    }
}
