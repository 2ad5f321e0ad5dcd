//! Runtime configuration: TOML file with per-field defaults, then environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RagError, RagResult};
use crate::rag::ChunkStrategy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RagConfig {
    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file yields the built-in defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> RagResult<Self> {
        let mut config = match path {
            Some(p) => Self::load_from(p)?,
            None => {
                let default = Self::default_path();
                if default.exists() {
                    Self::load_from(&default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> RagResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RagError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> RagResult<Self> {
        toml::from_str(content).map_err(|e| RagError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("clause-rag")
            .join("config.toml")
    }

    fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = non_empty("RAY_OPENAI_API_KEY").or_else(|| non_empty("OPENAI_API_KEY")) {
            self.openai.api_key = key;
        }
        if let Some(dir) = non_empty("CLAUSE_RAG_INDEX_DIR") {
            self.index.root = PathBuf::from(dir);
        }
        if let Some(token) = non_empty("CLAUSE_RAG_AUTH_TOKEN") {
            self.server.auth_token = Some(token);
        }
    }

    pub fn validate(&self) -> RagResult<()> {
        let c = &self.chunking;
        if c.max_tokens == 0 {
            return Err(RagError::Config("chunking.max_tokens must be positive".into()));
        }
        if c.overlap_tokens >= c.max_tokens {
            return Err(RagError::Config(format!(
                "chunking.overlap_tokens ({}) must be smaller than max_tokens ({})",
                c.overlap_tokens, c.max_tokens
            )));
        }
        let r = &self.retrieval;
        if r.top_k == 0 || r.rerank_k == 0 {
            return Err(RagError::Config("retrieval.top_k and retrieval.rerank_k must be positive".into()));
        }
        if self.index.m == 0 || self.index.ef_construction == 0 || self.index.ef_search == 0 {
            return Err(RagError::Config("index graph parameters must be positive".into()));
        }
        if self.index.memory_cache_entries == 0 {
            return Err(RagError::Config("index.memory_cache_entries must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
    /// `tokenizer.json` to count tokens with instead of the built-in GPT-2 BPE.
    #[serde(default)]
    pub tokenizer_path: Option<PathBuf>,
}

fn default_max_tokens() -> usize {
    500
}

fn default_overlap_tokens() -> usize {
    100
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
            tokenizer_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_root")]
    pub root: PathBuf,
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// Hard input ceiling of the embedding service.
    #[serde(default = "default_max_embedding_tokens")]
    pub max_embedding_tokens: usize,
    /// Prepared indexes kept in memory; older ones are reloaded from disk on demand.
    #[serde(default = "default_memory_cache_entries")]
    pub memory_cache_entries: usize,
}

fn default_index_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("clause-rag")
        .join("indexes")
}

fn default_m() -> usize {
    32
}

fn default_ef_construction() -> usize {
    200
}

fn default_ef_search() -> usize {
    128
}

fn default_max_embedding_tokens() -> usize {
    8192
}

fn default_memory_cache_entries() -> usize {
    4
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: default_index_root(),
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            max_embedding_tokens: default_max_embedding_tokens(),
            memory_cache_entries: default_memory_cache_entries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_rerank_k")]
    pub rerank_k: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
}

fn default_top_k() -> usize {
    15
}

fn default_rerank_k() -> usize {
    5
}

fn default_max_context_tokens() -> usize {
    6000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            rerank_k: default_rerank_k(),
            max_context_tokens: default_max_context_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_batch_size() -> usize {
    64
}

fn default_chat_model() -> String {
    "gpt-4o".into()
}

fn default_temperature() -> f32 {
    0.3
}

fn default_completion_tokens() -> usize {
    512
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            embedding_model: default_embedding_model(),
            embedding_batch_size: default_embedding_batch_size(),
            chat_model: default_chat_model(),
            temperature: default_temperature(),
            max_tokens: default_completion_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Text-extraction service for PDF bodies (`POST {extractor_url}` with the raw bytes).
    #[serde(default)]
    pub extractor_url: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            extractor_url: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
