//! Text Embeddings
//!
//! OpenAI embeddings client used for storing and querying semantic memory.
//! Query embeddings are cached (LRU, 1 hour TTL) since retrieval tends to
//! repeat the same phrasings.

use anyhow::{Context, Result};
use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Embedding client configuration
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Embedding model name
    pub model: String,
    /// Output dimensionality (fixed per model)
    pub dimension: usize,
    /// Request timeout
    pub timeout: Duration,
}

/// Get embedding dimension for known models
fn model_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-small" => 1536,
        "text-embedding-3-large" => 3072,
        "text-embedding-ada-002" => 1536,
        _ => 1536,
    }
}

impl EmbeddingConfig {
    pub fn for_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
            dimension: model_dimension(model),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Seam between services and the embedding backend
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// OpenAI embeddings client with query caching
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: reqwest::Client,
    api_key: String,
    /// LRU cache for embeddings (max 1000 entries, 1 hour TTL)
    cache: Cache<String, Vec<f32>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(api_key: &str, model: &str) -> Self {
        let config = EmbeddingConfig::for_model(model);

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to create HTTP client");

        let cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(Duration::from_secs(3600))
            .build();

        Self {
            config,
            client,
            api_key: api_key.to_string(),
            cache,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        }
    }

    /// Get cache statistics (hits, misses)
    pub fn cache_stats(&self) -> (u64, u64) {
        (
            self.cache_hits.load(Ordering::Relaxed),
            self.cache_misses.load(Ordering::Relaxed),
        )
    }

    /// Generate embedding without touching the cache
    pub async fn embed_uncached(&self, text: &str) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(OPENAI_EMBEDDINGS_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.config.model,
                "input": text,
                "encoding_format": "float"
            }))
            .send()
            .await
            .context("Failed to send embedding request")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await?;
            anyhow::bail!("Embedding request failed {}: {}", status, text);
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| anyhow::anyhow!("Embedding response contained no data"))
    }

    /// Calculate cosine similarity between two vectors
    pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }

        let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }

        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let cache_key = text.trim().to_string();

        if let Some(cached) = self.cache.get(&cache_key).await {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("Embedding cache hit");
            return Ok(cached);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let embedding = self.embed_uncached(text).await?;
        self.cache.insert(cache_key, embedding.clone()).await;

        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}
