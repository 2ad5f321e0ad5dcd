use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("Source fetch error: {0}")]
    SourceFetch(String),
    #[error("Unsupported document locator: {0}")]
    InvalidLocator(String),
    #[error("Index missing at {path}: {reason}")]
    MissingIndex { path: PathBuf, reason: String },
    #[error("Index corrupt at {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },
    #[error("Embedding service error: {0}")]
    EmbeddingService(String),
    #[error("Synthesis error: {0}")]
    Synthesis(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("{0}")]
    Internal(String),
}

impl RagError {
    pub fn missing_index(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RagError::MissingIndex { path: path.into(), reason: reason.into() }
    }

    pub fn corrupt_index(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        RagError::CorruptIndex { path: path.into(), reason: reason.into() }
    }

    /// Load failures that are repaired by rebuilding the index from the source document.
    pub fn needs_rebuild(&self) -> bool {
        matches!(self, RagError::MissingIndex { .. } | RagError::CorruptIndex { .. })
    }

    /// Failures caused by the document's origin rather than this service.
    pub fn is_upstream(&self) -> bool {
        matches!(self, RagError::SourceFetch(_))
    }
}

impl From<std::io::Error> for RagError {
    fn from(e: std::io::Error) -> Self {
        RagError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Internal(e.to_string())
    }
}

pub type RagResult<T> = Result<T, RagError>;
