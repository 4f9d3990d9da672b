//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and the [`embed_texts`]
//! dispatch (kept as a free function due to async trait limitations).
//! Backends:
//! - `"disabled"` — always errors; for stores that never embed.
//! - `"openai"` — OpenAI embeddings API with batching, retry, backoff.
//! - `"ollama"` — local Ollama server, same retry policy.
//! - `"local"` — in-process fastembed model (feature `local-embeddings`).
//! - `"hash"` — deterministic pseudo-embedding; no network, stable
//!   across runs, used by tests and offline setups.
//!
//! Also provides the vector utilities shared with the index:
//! [`vec_to_blob`] / [`blob_to_vec`] for little-endian f32 BLOB storage
//! and [`cosine_similarity`] for scoring.
//!
//! # Retry strategy
//!
//! Remote providers retry transient failures with exponential backoff
//! (1s, 2s, 4s, capped): HTTP 429 and 5xx retry, other 4xx fail
//! immediately, network errors retry. Retries are bounded by
//! `embedding.max_retries`.
//!
//! # Truncation
//!
//! Inputs over the token budget are truncated deterministically before
//! the request, using a 4-chars-per-token estimate, so retries and
//! re-indexing always embed identical text.

use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};

/// Trait for embedding providers. Carries model metadata; the actual
/// computation goes through [`embed_texts`].
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Embedding vector dimensionality.
    fn dims(&self) -> usize;
}

/// Embed a batch of texts using the configured provider.
///
/// Returns one vector per input text, in input order, each of the
/// provider's declared dimension. An empty batch or a batch containing
/// an empty text is a caller error and is never sent upstream.
pub async fn embed_texts(
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    texts: &[String],
) -> Result<Vec<Vec<f32>>> {
    if texts.is_empty() {
        return Err(Error::Validation("empty embedding batch".to_string()));
    }
    if texts.iter().any(|t| t.trim().is_empty()) {
        return Err(Error::Validation(
            "cannot embed empty text".to_string(),
        ));
    }

    let texts = truncate_batch(texts, config.max_tokens);

    match config.provider.as_str() {
        "openai" => embed_openai(config, &texts).await,
        "ollama" => embed_ollama(config, &texts).await,
        #[cfg(feature = "local-embeddings")]
        "local" => embed_local(provider, &texts),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(Error::Embedding(
            "local provider requires the 'local-embeddings' feature".to_string(),
        )),
        "hash" => Ok(texts
            .iter()
            .map(|t| hash_embedding(t, provider.dims()))
            .collect()),
        "disabled" => Err(Error::Embedding(
            "embedding provider is disabled".to_string(),
        )),
        other => Err(Error::Embedding(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

/// Embed a single query text. Convenience wrapper for search paths.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    text: &str,
) -> Result<Vec<f32>> {
    let results = embed_texts(provider, config, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| Error::Embedding("empty embedding response".to_string()))
}

/// Truncate each text to the token budget, estimated at 4 chars per
/// token. Cuts on a char boundary so the result is always valid UTF-8.
pub fn truncate_batch(texts: &[String], max_tokens: usize) -> Vec<String> {
    let max_chars = max_tokens.saturating_mul(4);
    texts
        .iter()
        .map(|t| {
            if t.chars().count() <= max_chars {
                t.clone()
            } else {
                t.chars().take(max_chars).collect()
            }
        })
        .collect()
}

// ============ Disabled Provider ============

/// A no-op provider; any embed attempt fails with a descriptive error.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ OpenAI Provider ============

/// Provider backed by the OpenAI `POST /v1/embeddings` endpoint.
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            Error::Validation("embedding.model required for OpenAI provider".to_string())
        })?;
        let dims = config.dims.ok_or_else(|| {
            Error::Validation("embedding.dims required for OpenAI provider".to_string())
        })?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(Error::Embedding(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| Error::Embedding("OPENAI_API_KEY not set".to_string()))?;

    let model = config
        .model
        .as_ref()
        .ok_or_else(|| Error::Validation("embedding.model required".to_string()))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| Error::Embedding(format!("http client: {e}")))?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {api_key}"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| Error::Embedding(format!("decode response: {e}")))?;
                    return parse_openai_response(&json);
                }

                // Rate limited or server error — retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(Error::Embedding(format!(
                        "OpenAI API error {status}: {body_text}"
                    )));
                    continue;
                }

                // Client error (not 429) — don't retry
                let body_text = response.text().await.unwrap_or_default();
                return Err(Error::Embedding(format!(
                    "OpenAI API error {status}: {body_text}"
                )));
            }
            Err(e) => {
                last_err = Some(Error::Embedding(format!("request failed: {e}")));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| Error::Embedding("embedding failed after retries".to_string())))
}

fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::Embedding("invalid response: missing data array".to_string()))?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Embedding("invalid response: missing embedding".to_string()))?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Ollama Provider ============

/// Provider backed by a local Ollama server's `POST /api/embed`.
pub struct OllamaProvider {
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            Error::Validation("embedding.model required for Ollama provider".to_string())
        })?;
        let dims = config.dims.ok_or_else(|| {
            Error::Validation("embedding.dims required for Ollama provider".to_string())
        })?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let base = config
        .url
        .clone()
        .unwrap_or_else(|| "http://localhost:11434".to_string());
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| Error::Validation("embedding.model required".to_string()))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| Error::Embedding(format!("http client: {e}")))?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/api/embed", base.trim_end_matches('/')))
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| Error::Embedding(format!("decode response: {e}")))?;
                    let embeddings = json
                        .get("embeddings")
                        .and_then(|e| e.as_array())
                        .ok_or_else(|| {
                            Error::Embedding("invalid response: missing embeddings".to_string())
                        })?;
                    return embeddings
                        .iter()
                        .map(|row| {
                            row.as_array()
                                .map(|vals| {
                                    vals.iter()
                                        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                                        .collect()
                                })
                                .ok_or_else(|| {
                                    Error::Embedding(
                                        "invalid response: embedding not an array".to_string(),
                                    )
                                })
                        })
                        .collect();
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(Error::Embedding(format!(
                        "Ollama error {status}: {body_text}"
                    )));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                return Err(Error::Embedding(format!(
                    "Ollama error {status}: {body_text}"
                )));
            }
            Err(e) => {
                last_err = Some(Error::Embedding(format!("request failed: {e}")));
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| Error::Embedding("embedding failed after retries".to_string())))
}

// ============ Local Provider (fastembed) ============

/// In-process provider backed by fastembed. Only built with the
/// `local-embeddings` feature.
#[cfg(feature = "local-embeddings")]
pub struct LocalProvider {
    model: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| "BAAI/bge-small-en-v1.5".to_string());
        let dims = config.dims.unwrap_or(384);
        Ok(Self { model, dims })
    }
}

#[cfg(feature = "local-embeddings")]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

#[cfg(feature = "local-embeddings")]
fn embed_local(provider: &dyn EmbeddingProvider, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    use fastembed::{InitOptions, TextEmbedding};

    let _ = provider;
    let model = TextEmbedding::try_new(InitOptions::default())
        .map_err(|e| Error::Embedding(format!("fastembed init: {e}")))?;
    model
        .embed(texts.to_vec(), None)
        .map_err(|e| Error::Embedding(format!("fastembed: {e}")))
}

// ============ Hash Provider ============

/// Deterministic pseudo-embedding provider.
///
/// Expands a SHA-256 digest of the input into `dims` floats and
/// L2-normalizes the result. Identical text always produces identical
/// vectors, which is what the tests and offline ingestion need; it has
/// no semantic meaning beyond exact-duplicate detection.
pub struct HashProvider {
    dims: usize,
}

impl HashProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let dims = config.dims.ok_or_else(|| {
            Error::Validation("embedding.dims required for hash provider".to_string())
        })?;
        Ok(Self { dims })
    }
}

impl EmbeddingProvider for HashProvider {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

/// Expand SHA-256(text || counter) into a unit-length vector.
pub fn hash_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut values = Vec::with_capacity(dims);
    let mut counter: u32 = 0;

    while values.len() < dims {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        let digest = hasher.finalize();

        for word in digest.chunks_exact(4) {
            if values.len() == dims {
                break;
            }
            let raw = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            // Map to [-1, 1)
            values.push((raw as f32 / u32::MAX as f32) * 2.0 - 1.0);
        }
        counter += 1;
    }

    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut values {
            *v /= norm;
        }
    }
    values
}

/// Create the provider named by the configuration.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Box::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => Err(Error::Embedding(
            "local provider requires the 'local-embeddings' feature".to_string(),
        )),
        "hash" => Ok(Box::new(HashProvider::new(config)?)),
        other => Err(Error::Embedding(format!(
            "unknown embedding provider: {other}"
        ))),
    }
}

// ============ Vector utilities ============

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

/// Cosine similarity in `[-1.0, 1.0]`. Returns `0.0` for empty vectors
/// or vectors of different lengths.
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
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        let blob = vec_to_blob(&vec);
        assert_eq!(blob.len(), 20);
        assert_eq!(blob_to_vec(&blob), vec);
    }

    #[test]
    fn test_cosine_identical_and_orthogonal() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);

        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_hash_embedding_deterministic_and_normalized() {
        let a = hash_embedding("vector databases", 384);
        let b = hash_embedding("vector databases", 384);
        let c = hash_embedding("prompt caching", 384);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 384);

        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_truncation_is_deterministic() {
        let long = "x".repeat(100_000);
        let texts = vec![long.clone(), "short".to_string()];
        let out = truncate_batch(&texts, 8192);
        assert_eq!(out[0].chars().count(), 8192 * 4);
        assert_eq!(out[1], "short");
        assert_eq!(out, truncate_batch(&texts, 8192));
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_input() {
        let config = EmbeddingConfig::default();
        let provider = create_provider(&config).unwrap();

        let err = embed_texts(provider.as_ref(), &config, &[]).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = embed_texts(provider.as_ref(), &config, &["  ".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_hash_provider_embeds_batch() {
        let config = EmbeddingConfig::default();
        let provider = create_provider(&config).unwrap();

        let out = embed_texts(
            provider.as_ref(),
            &config,
            &["a".to_string(), "b".to_string()],
        )
        .await
        .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), provider.dims());
        assert_ne!(out[0], out[1]);
    }

    #[tokio::test]
    async fn test_disabled_provider_errors() {
        let config = EmbeddingConfig {
            provider: "disabled".to_string(),
            ..EmbeddingConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        let err = embed_texts(provider.as_ref(), &config, &["x".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UPSTREAM_ERROR");
    }
}
