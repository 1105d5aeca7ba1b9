//! Vector Embeddings for Semantic Recall
//!
//! The archival store only needs `embed(text) -> Vec<f32>` of a fixed
//! dimension. Two providers ship with the crate:
//! - [`OllamaEmbedder`]: local embeddings via Ollama, memoized with moka
//! - [`HashEmbedder`]: offline feature-hashing bag of words

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};

/// Embedding provider collaborator
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Output dimension, when known ahead of the first call
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Ollama embedder configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    /// Expected vector length; responses of any other length are rejected
    pub dimension: usize,
    pub timeout: Duration,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
}

const KNOWN_MODELS: &[(&str, usize)] = &[
    ("all-minilm", 384),
    ("all-minilm-l6-v2", 384),
    ("nomic-embed-text", 768),
    ("snowflake-arctic-embed-m", 768),
    ("bge-base-en", 768),
    ("mxbai-embed-large", 1024),
    ("bge-large-en", 1024),
];

/// Vector length produced by a known model, 768 otherwise
pub fn model_dimension(model: &str) -> usize {
    let name = model.split(':').next().unwrap_or(model);
    KNOWN_MODELS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, dim)| *dim)
        .unwrap_or(768)
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
            timeout: Duration::from_secs(30),
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embeddings from a local Ollama server, memoized per trimmed text
pub struct OllamaEmbedder {
    config: EmbeddingConfig,
    http: reqwest::Client,
    memo: Cache<String, Vec<f32>>,
    hits: AtomicU64,
    requests: AtomicU64,
}

impl OllamaEmbedder {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Embedding(format!("http client: {}", e)))?;
        let memo = Cache::builder()
            .max_capacity(config.cache_capacity)
            .time_to_live(config.cache_ttl)
            .build();

        Ok(Self {
            config,
            http,
            memo,
            hits: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        })
    }

    /// Memo hits and upstream requests so far
    pub fn cache_stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.requests.load(Ordering::Relaxed))
    }

    async fn request(&self, text: &str) -> Result<Vec<f32>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({ "model": self.config.model, "input": text });
        let response = self
            .http
            .post(format!("{}/api/embed", self.config.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("ollama unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Embedding(format!("ollama returned {}", status)));
        }

        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("unreadable embed response: {}", e)))?;
        parsed
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::Embedding("empty embed response".into()))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = text.trim().to_string();
        if let Some(vector) = self.memo.get(&key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(vector);
        }

        let vector = self.request(&key).await?;
        if vector.len() != self.config.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.config.dimension,
                actual: vector.len(),
            });
        }
        debug!("{} embedded {} chars", self.config.model, key.len());
        self.memo.insert(key, vector.clone()).await;
        Ok(vector)
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.config.dimension)
    }
}

/// Feature-hashing bag-of-words embedder
///
/// Lowercased alphanumeric tokens are hashed into `dimension` buckets and
/// the vector is L2-normalized. Texts sharing words score high cosine
/// similarity. No network access.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let idx = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            vector[idx] += 1.0;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in vector.iter_mut() {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> Option<usize> {
        Some(self.dimension)
    }
}

/// Cosine similarity, 0.0 on length mismatch or a zero vector
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (dot, aa, bb) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, aa, bb), (x, y)| (dot + x * y, aa + x * x, bb + y * y));
    if aa == 0.0 || bb == 0.0 {
        return 0.0;
    }
    dot / (aa.sqrt() * bb.sqrt())
}

/// Little-endian f32 packing for the archival BLOB column
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for x in vector {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

/// Inverse of [`embedding_to_bytes`]; a trailing partial value is ignored
pub fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
