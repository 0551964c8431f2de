use std::time::Duration;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse a fractional value from the environment, rejecting non-finite or
/// out-of-range values instead of letting them poison scoring downstream.
fn env_fraction(name: &str, default: f32) -> f32 {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse::<f32>().ok())
        .filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
        .unwrap_or(default)
}

/// Runtime configuration, collected once from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub ollama_url: String,
    pub embedding_model: String,
    pub llm_model: String,
    pub data_dir: String,

    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub top_k_default: usize,
    pub min_relevance: f32,
    pub max_context_chars: usize,

    pub temperature: f32,
    pub max_answer_tokens: u32,

    pub embed_timeout_secs: u64,
    pub search_timeout_secs: u64,
    pub generate_timeout_secs: u64,

    pub cache_ttl_secs: u64,
    pub embedding_cache_size: usize,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            ollama_url: env_string("OLLAMA_URL", "http://localhost:11434"),
            embedding_model: env_string("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            llm_model: env_string("OLLAMA_LLM_MODEL", "llama3.2"),
            data_dir: env_string("DATA_DIR", "./data"),
            chunk_size: env_parse("CHUNK_SIZE", 500),
            chunk_overlap: env_parse("CHUNK_OVERLAP", 50),
            top_k_default: env_parse("TOP_K_RESULTS", 5),
            min_relevance: env_fraction("MIN_RELEVANCE", 0.3),
            max_context_chars: env_parse("MAX_CONTEXT_CHARS", 8000),
            temperature: env_fraction("LLM_TEMPERATURE", 0.7),
            max_answer_tokens: env_parse("LLM_MAX_TOKENS", 500),
            embed_timeout_secs: env_parse("EMBED_TIMEOUT_SECS", 30),
            search_timeout_secs: env_parse("SEARCH_TIMEOUT_SECS", 10),
            generate_timeout_secs: env_parse("GENERATE_TIMEOUT_SECS", 120),
            cache_ttl_secs: env_parse("CACHE_TTL_SECS", 3600),
            embedding_cache_size: env_parse("EMBEDDING_CACHE_SIZE", 1000),
        }
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_secs(self.embed_timeout_secs)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env()
    }
}
