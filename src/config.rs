use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub document_store: DocumentStoreConfig,
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default = "default_project")]
    pub default_project: String,
    #[serde(default)]
    pub query: QueryConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

fn default_project() -> String {
    "default".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct DocumentStoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

fn default_collection() -> String {
    "knowledge_vectors".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Inputs over this token budget are truncated deterministically.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hash".to_string(),
            model: None,
            dims: Some(384),
            url: None,
            batch_size: 64,
            max_retries: 3,
            timeout_secs: 30,
            max_tokens: 8192,
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_tokens() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default = "default_max_limit")]
    pub max_limit: i64,
    /// Keep only the best-scoring hit per source when true.
    #[serde(default)]
    pub diversify: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            diversify: false,
        }
    }
}

fn default_limit() -> i64 {
    10
}
fn default_max_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub key: String,
    /// One of `registered`, `premium`.
    pub tier: String,
    #[serde(default)]
    pub disabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_public_per_window")]
    pub public_per_window: u64,
    #[serde(default = "default_registered_per_window")]
    pub registered_per_window: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            public_per_window: default_public_per_window(),
            registered_per_window: default_registered_per_window(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_public_per_window() -> u64 {
    100
}
fn default_registered_per_window() -> u64 {
    1000
}
fn default_window_secs() -> u64 {
    3600
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate query limits
    if config.query.default_limit < 1 {
        anyhow::bail!("query.default_limit must be >= 1");
    }
    if config.query.max_limit < config.query.default_limit {
        anyhow::bail!("query.max_limit must be >= query.default_limit");
    }

    // Validate rate limits
    if config.rate_limit.window_secs == 0 {
        anyhow::bail!("rate_limit.window_secs must be > 0");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.max_tokens == 0 {
            anyhow::bail!("embedding.max_tokens must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" | "hash" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, local, or hash.",
            other
        ),
    }

    // Validate auth tiers
    for entry in &config.auth.keys {
        match entry.tier.as_str() {
            "registered" | "premium" => {}
            other => anyhow::bail!(
                "Unknown tier '{}' for API key. Must be registered or premium.",
                other
            ),
        }
    }

    Ok(config)
}

impl Config {
    /// Minimal in-memory config for tests and scaffolding.
    pub fn minimal(dir: &Path) -> Self {
        Self {
            document_store: DocumentStoreConfig {
                path: dir.join("documents.sqlite"),
            },
            vector_index: VectorIndexConfig {
                path: dir.join("vectors.sqlite"),
                collection: default_collection(),
            },
            embedding: EmbeddingConfig::default(),
            default_project: default_project(),
            query: QueryConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7431".to_string(),
            },
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_src = r#"
default_project = "ai_eng"

[document_store]
path = "/tmp/lorekit/documents.sqlite"

[vector_index]
path = "/tmp/lorekit/vectors.sqlite"
collection = "knowledge_vectors"

[embedding]
provider = "hash"
dims = 384
max_tokens = 8192

[query]
default_limit = 10
max_limit = 50
diversify = true

[server]
bind = "127.0.0.1:7431"

[[auth.keys]]
key = "reg-key-1"
tier = "registered"

[[auth.keys]]
key = "prem-key-1"
tier = "premium"

[rate_limit]
public_per_window = 100
registered_per_window = 1000
window_secs = 3600
"#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.default_project, "ai_eng");
        assert_eq!(config.query.max_limit, 50);
        assert_eq!(config.auth.keys.len(), 2);
        assert_eq!(config.auth.keys[1].tier, "premium");
        assert!(config.query.diversify);
    }

    #[test]
    fn test_defaults() {
        let toml_src = r#"
[document_store]
path = "docs.sqlite"

[vector_index]
path = "vecs.sqlite"

[server]
bind = "127.0.0.1:7431"
"#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.vector_index.collection, "knowledge_vectors");
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.embedding.max_tokens, 8192);
        assert_eq!(config.rate_limit.public_per_window, 100);
        assert_eq!(config.query.max_limit, 50);
    }
}
