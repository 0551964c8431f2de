use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::orchestrator::SourceDocument;

/// A previously computed answer, replayable without touching the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<SourceDocument>,
    pub confidence: Option<f32>,
}

/// Derive the cache key for a question: normalize (trim + lowercase), hash,
/// keep the first 16 hex chars under a namespacing prefix.
pub fn cache_key(question: &str) -> String {
    let normalized = question.trim().to_lowercase();
    let digest = Sha256::digest(normalized.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("rag:query:{}", &hex[..16])
}

/// Result cache seam. The cache is an optimization, never a dependency:
/// implementations must swallow their own failures and present them as a
/// miss, so a broken cache degrades to slower answers, not errors.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedAnswer>;
    async fn set(&self, key: &str, value: CachedAnswer, ttl: Duration);
}

/// In-process TTL cache. Eviction is time-based only; expired entries are
/// dropped lazily on access and swept when the map grows past a threshold.
///
/// Entries are process-local: with multiple worker processes each keeps its
/// own cache, which loses hit rate but not correctness.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (CachedAnswer, Instant)>>,
}

const SWEEP_THRESHOLD: usize = 1024;

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Option<CachedAnswer> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, expires)) if *expires > now => return Some(value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Entry exists but expired: drop it.
        self.entries.write().await.remove(key);
        None
    }

    async fn set(&self, key: &str, value: CachedAnswer, ttl: Duration) {
        let mut entries = self.entries.write().await;
        if entries.len() >= SWEEP_THRESHOLD {
            let now = Instant::now();
            entries.retain(|_, (_, expires)| *expires > now);
        }
        entries.insert(key.to_string(), (value, Instant::now() + ttl));
    }
}

/// Cache that stores nothing. Used when caching is disabled.
pub struct NoopCache;

#[async_trait]
impl CacheBackend for NoopCache {
    async fn get(&self, _key: &str) -> Option<CachedAnswer> {
        None
    }

    async fn set(&self, _key: &str, _value: CachedAnswer, _ttl: Duration) {}
}
