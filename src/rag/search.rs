use std::cmp::Ordering;

use super::chunker::Chunk;

const COSINE_EPSILON: f32 = 1e-8;

pub fn dot_similarity(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Exact cosine `dot(a, b) / (|a| * |b| + eps)`. Zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    dot_similarity(a, b) / (norm_a * norm_b + COSINE_EPSILON)
}

/// A chunk paired with the vector it was indexed under.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub chunk: &'a Chunk,
    pub vector: &'a [f32],
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Score candidates by exact cosine against `query` and keep the best `rerank_k`.
///
/// The sort is stable: equal scores keep candidate order. NaN scores rank last.
pub fn rerank(candidates: &[Candidate<'_>], query: &[f32], rerank_k: usize) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = candidates
        .iter()
        .map(|c| ScoredChunk {
            chunk: c.chunk.clone(),
            score: cosine_similarity(query, c.vector),
        })
        .collect();

    scored.sort_by(|a, b| descending(a.score, b.score));
    scored.truncate(rerank_k);
    scored
}

fn descending(a: f32, b: f32) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.partial_cmp(&a).unwrap_or(Ordering::Equal),
    }
}

/// Keep the longest rank-order prefix whose token counts sum to at most `max_context_tokens`.
/// Chunks after the first one that would overflow are never considered.
pub fn truncate_to_budget(ranked: Vec<Chunk>, max_context_tokens: usize) -> Vec<Chunk> {
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(ranked.len());
    for chunk in ranked {
        if used + chunk.token_count > max_context_tokens {
            break;
        }
        used += chunk.token_count;
        kept.push(chunk);
    }
    kept
}
