use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of fragments returned per query.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Over-fetch multiplier applied before deduplication.
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// Maximum fragments kept per document after deduplication.
    #[serde(default = "default_per_doc_cap")]
    pub per_doc_cap: usize,
    /// Maximum related entities surfaced per response.
    #[serde(default = "default_related_entity_cap")]
    pub related_entity_cap: usize,
    /// Cited fragment text is truncated to this many characters.
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            overfetch_factor: default_overfetch_factor(),
            per_doc_cap: default_per_doc_cap(),
            related_entity_cap: default_related_entity_cap(),
            snippet_chars: default_snippet_chars(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_overfetch_factor() -> usize {
    3
}
fn default_per_doc_cap() -> usize {
    1
}
fn default_related_entity_cap() -> usize {
    10
}
fn default_snippet_chars() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Turns kept per session; oldest evicted first.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// Idle seconds after which a session expires.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_cap: default_history_cap(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_history_cap() -> usize {
    20
}
fn default_ttl_secs() -> i64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// One of `hash`, `openai`, `ollama`.
    #[serde(default = "default_embedding_provider")]
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
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SynthesisConfig {
    /// One of `disabled`, `anthropic`, `openai`. Absence of an LLM is a
    /// valid configuration, not an error.
    #[serde(default = "default_synthesis_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_synthesis_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesis_provider(),
            model: None,
            max_tokens: default_synthesis_max_tokens(),
            timeout_secs: default_synthesis_timeout_secs(),
        }
    }
}

fn default_synthesis_provider() -> String {
    "disabled".to_string()
}
fn default_synthesis_max_tokens() -> u32 {
    1024
}
fn default_synthesis_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    /// End-to-end deadline for a query or navigate call. Synthesis is the
    /// first stage dropped when the deadline runs short.
    #[serde(default = "default_query_timeout_secs")]
    pub timeout_secs: u64,
    /// Questions longer than this are rejected before retrieval.
    #[serde(default = "default_max_question_chars")]
    pub max_question_chars: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_query_timeout_secs(),
            max_question_chars: default_max_question_chars(),
        }
    }
}

fn default_query_timeout_secs() -> u64 {
    30
}
fn default_max_question_chars() -> usize {
    8192
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

impl SynthesisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }

    if config.retrieval.k == 0 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if config.retrieval.overfetch_factor == 0 {
        anyhow::bail!("retrieval.overfetch_factor must be >= 1");
    }
    if config.retrieval.per_doc_cap == 0 {
        anyhow::bail!("retrieval.per_doc_cap must be >= 1");
    }

    if config.session.history_cap == 0 {
        anyhow::bail!("session.history_cap must be >= 1");
    }
    if config.session.ttl_secs <= 0 {
        anyhow::bail!("session.ttl_secs must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hash, openai, or ollama.",
            other
        ),
    }

    if config.embedding.provider != "hash" {
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.synthesis.provider.as_str() {
        "disabled" | "anthropic" | "openai" => {}
        other => anyhow::bail!(
            "Unknown synthesis provider: '{}'. Must be disabled, anthropic, or openai.",
            other
        ),
    }

    if config.query.max_question_chars == 0 {
        anyhow::bail!("query.max_question_chars must be > 0");
    }

    Ok(())
}
