use std::sync::Arc;

use super::chunker::Chunk;
use super::index::EmbeddingIndex;
use super::search::{rerank, truncate_to_budget, Candidate};
use crate::config::RetrievalConfig;
use crate::embedding::Embedder;
use crate::error::RagResult;

/// Search, cosine rerank, then token-budget truncation.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    top_k: usize,
    rerank_k: usize,
    max_context_tokens: usize,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, config: &RetrievalConfig) -> Self {
        Self {
            embedder,
            top_k: config.top_k,
            rerank_k: config.rerank_k,
            max_context_tokens: config.max_context_tokens,
        }
    }

    pub fn with_limits(mut self, top_k: usize, rerank_k: usize, max_context_tokens: usize) -> Self {
        self.top_k = top_k;
        self.rerank_k = rerank_k;
        self.max_context_tokens = max_context_tokens;
        self
    }

    /// Context chunks for `question`, most relevant first.
    pub async fn retrieve(&self, question: &str, index: &EmbeddingIndex) -> RagResult<Vec<Chunk>> {
        let query = self.embedder.embed(question).await?;
        let hits = index.search(&query, self.top_k)?;

        let candidates: Vec<Candidate<'_>> = hits
            .iter()
            .map(|h| Candidate { chunk: h.chunk, vector: h.vector })
            .collect();
        let ranked = rerank(&candidates, &query, self.rerank_k);

        let context = truncate_to_budget(
            ranked.into_iter().map(|s| s.chunk).collect(),
            self.max_context_tokens,
        );
        tracing::debug!(
            candidates = hits.len(),
            kept = context.len(),
            tokens = context.iter().map(|c| c.token_count).sum::<usize>(),
            "Retrieved context"
        );
        Ok(context)
    }
}
