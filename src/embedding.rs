//! Embedding provider abstraction and the HTTP implementation.
//!
//! Defines the [`Embedder`] trait and [`HttpEmbedder`], which calls an
//! OpenAI-compatible embeddings endpoint with retry and backoff.
//!
//! Also provides the vector utilities used by the store:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes for BLOB storage
//! - [`blob_to_vec`] — decode a BLOB back into a `Vec<f32>`
//!
//! # Retry strategy
//!
//! Rate-limit responses (HTTP 429) are retried with exponential backoff:
//! 2 s, 4 s, 8 s, at most 3 retries. Any other failure propagates
//! immediately. Batch embedding runs items sequentially with a small
//! inter-call delay to respect external quotas and aborts on the first
//! non-rate-limit failure.
//!
//! Token counts are estimates (1 token ≈ 4 characters) used only for cost
//! accounting, never for correctness.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use crate::config::EmbeddingConfig;
use crate::error::{RecallError, Result};

/// Conservative character budget applied before calling the model.
pub const MAX_EMBED_CHARS: usize = 8_000;

/// Delay between sequential items in a batch.
const BATCH_ITEM_DELAY: Duration = Duration::from_millis(200);

/// Maximum rate-limit retries per request.
const MAX_RETRIES: u32 = 3;

/// A single text embedded, with its estimated token count.
#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub vector: Vec<f32>,
    pub tokens: i64,
}

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text. Rejects empty input.
    async fn embed(&self, text: &str) -> Result<EmbeddingOutput>;

    /// Embed a batch sequentially, pacing between calls. Aborts on the
    /// first failure that is not a transient rate limit.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingOutput>> {
        let mut outputs = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(BATCH_ITEM_DELAY).await;
            }
            outputs.push(self.embed(text).await?);
        }
        Ok(outputs)
    }

    /// True when the provider answers a trivial request.
    async fn health_check(&self) -> bool;

    /// Model identifier recorded as embedding provenance.
    fn model_name(&self) -> &str;

    /// Vector dimensionality the provider is configured for.
    fn dims(&self) -> usize;

    /// Estimated cost of a token count, in the configured currency.
    fn estimate_cost(&self, tokens: i64) -> f64;
}

/// Embedding provider backed by an OpenAI-compatible HTTP endpoint.
pub struct HttpEmbedder {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    dims: usize,
    cost_per_million: f64,
}

impl HttpEmbedder {
    /// Create a provider from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Config`] when the API key variable named by
    /// the config is not set.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_var).map_err(|_| {
            RecallError::Config(format!(
                "{} environment variable not set",
                config.api_key_var
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dims: config.dimensions,
            cost_per_million: config.cost_per_million_tokens,
        })
    }

    async fn request_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.model,
            "input": text,
            "dimensions": self.dims,
        });

        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                // Backoff: 2s, 4s, 8s.
                let delay = Duration::from_secs(1 << attempt);
                warn!(attempt, "embedding rate limited, backing off");
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(format!("{}/embeddings", self.api_url))
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await?;

            let status = response.status();
            if status.is_success() {
                let payload: serde_json::Value = response.json().await?;
                return parse_embedding_response(&payload);
            }

            let detail = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 {
                attempt += 1;
                if attempt > MAX_RETRIES {
                    return Err(RecallError::rate_limited("embeddings", detail));
                }
                continue;
            }

            return Err(RecallError::external(
                "embeddings",
                format!("{status}: {detail}"),
            ));
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<EmbeddingOutput> {
        let prepared = prepare_text(text)?;
        let vector = self.request_embedding(&prepared).await?;

        if vector.len() != self.dims {
            return Err(RecallError::external(
                "embeddings",
                format!(
                    "model returned {} dimensions, expected {}",
                    vector.len(),
                    self.dims
                ),
            ));
        }

        Ok(EmbeddingOutput {
            tokens: estimate_tokens(&prepared),
            vector,
        })
    }

    async fn health_check(&self) -> bool {
        self.embed("ping").await.is_ok()
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn estimate_cost(&self, tokens: i64) -> f64 {
        tokens as f64 / 1_000_000.0 * self.cost_per_million
    }
}

fn parse_embedding_response(payload: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = payload
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| RecallError::external("embeddings", "response missing embedding array"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Normalize whitespace and truncate to the character budget. Empty input
/// (after trimming) is a validation error.
pub fn prepare_text(text: &str) -> Result<String> {
    let normalized: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(RecallError::validation("cannot embed empty text"));
    }
    if normalized.chars().count() > MAX_EMBED_CHARS {
        return Ok(normalized.chars().take(MAX_EMBED_CHARS).collect());
    }
    Ok(normalized)
}

/// Rough token estimate: 1 token ≈ 4 characters.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.chars().count() as i64 + 3) / 4
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or
/// vectors of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn prepare_rejects_empty() {
        assert!(prepare_text("").is_err());
        assert!(prepare_text("   \n\t ").is_err());
    }

    #[test]
    fn prepare_collapses_whitespace() {
        assert_eq!(prepare_text("a  b\n\nc\t d").unwrap(), "a b c d");
    }

    #[test]
    fn prepare_truncates_to_budget() {
        let long = "word ".repeat(4_000);
        let prepared = prepare_text(&long).unwrap();
        assert_eq!(prepared.chars().count(), MAX_EMBED_CHARS);
    }

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn parse_response_extracts_vector() {
        let payload = serde_json::json!({
            "data": [{"embedding": [0.1, 0.2, 0.3]}]
        });
        let vec = parse_embedding_response(&payload).unwrap();
        assert_eq!(vec.len(), 3);
        assert!((vec[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn parse_response_rejects_malformed() {
        let payload = serde_json::json!({"data": []});
        assert!(parse_embedding_response(&payload).is_err());
    }
}
