//! Token counting for chunk budgets and context truncation.
//!
//! The default is GPT-2's byte-level BPE (`r50k_base`), built once per process and shared.
//! A Hugging Face `tokenizer.json` can be used instead when the embedding model counts differently.

use std::path::Path;
use std::sync::{Arc, LazyLock};

use crate::error::{RagError, RagResult};

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> RagResult<Vec<u32>>;

    fn decode(&self, ids: &[u32]) -> RagResult<String>;

    fn count(&self, text: &str) -> RagResult<usize> {
        Ok(self.encode(text)?.len())
    }
}

pub struct Gpt2Tokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl Tokenizer for Gpt2Tokenizer {
    fn encode(&self, text: &str) -> RagResult<Vec<u32>> {
        Ok(self.bpe.encode_ordinary(text).into_iter().map(|t| t as u32).collect())
    }

    fn decode(&self, ids: &[u32]) -> RagResult<String> {
        self.bpe
            .decode(ids.iter().map(|&t| t as _).collect())
            .map_err(|e| RagError::Tokenizer(format!("GPT-2 decode failed: {e}")))
    }
}

static GPT2: LazyLock<Result<Arc<Gpt2Tokenizer>, String>> = LazyLock::new(|| {
    tiktoken_rs::r50k_base()
        .map(|bpe| Arc::new(Gpt2Tokenizer { bpe }))
        .map_err(|e| e.to_string())
});

/// Process-wide GPT-2 tokenizer handle.
pub fn gpt2() -> RagResult<Arc<dyn Tokenizer>> {
    match &*GPT2 {
        Ok(t) => Ok(t.clone()),
        Err(e) => Err(RagError::Tokenizer(format!("Failed to load GPT-2 BPE: {e}"))),
    }
}

pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> RagResult<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| RagError::Tokenizer(format!("Failed to load {}: {e}", path.display())))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> RagResult<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| RagError::Tokenizer(format!("Encode failed: {e}")))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> RagResult<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| RagError::Tokenizer(format!("Decode failed: {e}")))
    }
}

/// Resolve the configured tokenizer: a `tokenizer.json` when given, else the shared GPT-2 BPE.
pub fn load(tokenizer_path: Option<&Path>) -> RagResult<Arc<dyn Tokenizer>> {
    match tokenizer_path {
        Some(path) => Ok(Arc::new(HfTokenizer::from_file(path)?)),
        None => gpt2(),
    }
}
