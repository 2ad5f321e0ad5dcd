use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use super::boundary::{split_segments, BoundaryDetector, ClauseLabelBoundaries};
use crate::error::{RagError, RagResult};
use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    Clause,
    Token,
    /// Paragraphs, then lines, then sentences, then words, merged back up to the budget.
    Recursive,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clause => "clause",
            Self::Token => "token",
            Self::Recursive => "recursive",
        }
    }
}

impl FromStr for ChunkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "clause" => Ok(Self::Clause),
            "token" => Ok(Self::Token),
            "recursive" => Ok(Self::Recursive),
            other => Err(format!("unknown chunk strategy '{other}' (expected clause, token or recursive)")),
        }
    }
}

/// Atomic retrievable unit. `id` is assigned once, in segmentation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    #[serde(rename = "tokenCount")]
    pub token_count: usize,
}

/// Clause-aware splitter with token budgeting.
pub struct ClauseChunker {
    tokenizer: Arc<dyn Tokenizer>,
    detector: Box<dyn BoundaryDetector>,
    strategy: ChunkStrategy,
    max_tokens: usize,
    overlap_tokens: usize,
}

impl ClauseChunker {
    pub fn new(
        tokenizer: Arc<dyn Tokenizer>,
        strategy: ChunkStrategy,
        max_tokens: usize,
        overlap_tokens: usize,
    ) -> RagResult<Self> {
        check_budget(max_tokens, overlap_tokens)?;
        Ok(Self {
            tokenizer,
            detector: Box::new(ClauseLabelBoundaries),
            strategy,
            max_tokens,
            overlap_tokens,
        })
    }

    pub fn with_detector(mut self, detector: Box<dyn BoundaryDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Ordered chunk contents for `text`.
    pub fn chunk(&self, text: &str) -> RagResult<Vec<String>> {
        match self.strategy {
            ChunkStrategy::Clause => pack_clauses(
                text,
                self.detector.as_ref(),
                self.tokenizer.as_ref(),
                self.max_tokens,
                self.overlap_tokens,
            ),
            ChunkStrategy::Token => {
                split_token_windows(text, self.tokenizer.as_ref(), self.max_tokens, self.overlap_tokens)
            }
            ChunkStrategy::Recursive => {
                split_recursive(text, self.tokenizer.as_ref(), self.max_tokens, self.overlap_tokens)
            }
        }
    }

    /// Chunk `text` and assign ids `chunk_1..` with token counts.
    pub fn chunk_collection(&self, text: &str) -> RagResult<Vec<Chunk>> {
        let contents = self.chunk(text)?;
        build_chunks(contents, self.tokenizer.as_ref())
    }
}

fn check_budget(max_tokens: usize, overlap_tokens: usize) -> RagResult<()> {
    if max_tokens == 0 || overlap_tokens >= max_tokens {
        return Err(RagError::Config(format!(
            "chunk budget requires 0 <= overlap < max (got overlap={overlap_tokens}, max={max_tokens})"
        )));
    }
    Ok(())
}

pub fn build_chunks(contents: Vec<String>, tokenizer: &dyn Tokenizer) -> RagResult<Vec<Chunk>> {
    contents
        .into_iter()
        .enumerate()
        .map(|(i, content)| {
            let token_count = tokenizer.count(&content)?;
            Ok(Chunk { id: format!("chunk_{}", i + 1), content, token_count })
        })
        .collect()
}

/// Greedy clause packing.
///
/// Segments are appended while the joined chunk stays within `max_tokens`. When one does not fit,
/// the chunk is emitted and the next one is seeded with whole trailing segments totalling at most
/// `overlap_tokens`. Segments larger than `max_tokens` flush the pending chunk and are hard-split
/// without overlap on either side.
pub fn pack_clauses(
    text: &str,
    detector: &dyn BoundaryDetector,
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
) -> RagResult<Vec<String>> {
    check_budget(max_tokens, overlap_tokens)?;

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for segment in split_segments(text, detector) {
        let segment_tokens = tokenizer.encode(segment)?;

        if segment_tokens.len() > max_tokens {
            if !current.is_empty() {
                chunks.push(current.join("\n"));
                current.clear();
            }
            chunks.extend(hard_split(&segment_tokens, tokenizer, max_tokens)?);
            continue;
        }

        if current.is_empty() {
            current.push(segment);
            continue;
        }

        if joined_count(tokenizer, &current, Some(segment))? <= max_tokens {
            current.push(segment);
            continue;
        }

        chunks.push(current.join("\n"));

        let mut seed = overlap_tail(&current, tokenizer, overlap_tokens)?;
        // carried clauses give way until the overflowing segment fits
        while !seed.is_empty() && joined_count(tokenizer, &seed, Some(segment))? > max_tokens {
            seed.remove(0);
        }
        seed.push(segment);
        current = seed;
    }

    if !current.is_empty() {
        chunks.push(current.join("\n"));
    }

    Ok(chunks)
}

/// Whole trailing segments of `finished` whose joined size stays within `overlap_tokens`.
fn overlap_tail<'a>(
    finished: &[&'a str],
    tokenizer: &dyn Tokenizer,
    overlap_tokens: usize,
) -> RagResult<Vec<&'a str>> {
    let mut carried: Vec<&'a str> = Vec::new();
    for &segment in finished.iter().rev() {
        let mut candidate = Vec::with_capacity(carried.len() + 1);
        candidate.push(segment);
        candidate.extend_from_slice(&carried);
        if joined_count(tokenizer, &candidate, None)? > overlap_tokens {
            break;
        }
        carried = candidate;
    }
    Ok(carried)
}

fn joined_count(tokenizer: &dyn Tokenizer, segments: &[&str], extra: Option<&str>) -> RagResult<usize> {
    let mut joined = segments.join("\n");
    if let Some(extra) = extra {
        joined.push('\n');
        joined.push_str(extra);
    }
    tokenizer.count(&joined)
}

/// Consecutive `max_tokens` windows of an oversize segment.
fn hard_split(tokens: &[u32], tokenizer: &dyn Tokenizer, max_tokens: usize) -> RagResult<Vec<String>> {
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + max_tokens).min(tokens.len());
        let (text, end) = decode_within(tokenizer, tokens, start, end, max_tokens)?;
        if !text.is_empty() {
            pieces.push(text);
        }
        start = end;
    }
    Ok(pieces)
}

/// Decode the longest prefix of `tokens[start..end]` whose trimmed text re-encodes within `max_tokens`.
///
/// Byte-level BPE can re-merge differently at a cut, and a cut can land inside a multi-byte
/// character. Either way `end` moves back. A leading token that never decodes on its own is a
/// character fragment left by the previous window and is skipped.
fn decode_within(
    tokenizer: &dyn Tokenizer,
    tokens: &[u32],
    mut start: usize,
    mut end: usize,
    max_tokens: usize,
) -> RagResult<(String, usize)> {
    let limit = end;
    loop {
        match tokenizer.decode(&tokens[start..end]) {
            Ok(text) => {
                let text = text.trim().to_string();
                if end - start <= 1 || tokenizer.count(&text)? <= max_tokens {
                    return Ok((text, end));
                }
            }
            Err(e) if end - start <= 1 => {
                tracing::debug!(start, error = %e, "Skipping undecodable token");
                if start + 1 >= limit {
                    return Ok((String::new(), limit));
                }
                start += 1;
                end = limit;
                continue;
            }
            Err(_) => {}
        }
        end -= 1;
    }
}

/// Fixed token windows advancing by `max_tokens - overlap_tokens`.
pub fn split_token_windows(
    text: &str,
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
) -> RagResult<Vec<String>> {
    check_budget(max_tokens, overlap_tokens)?;

    let tokens = tokenizer.encode(text)?;
    let step = max_tokens - overlap_tokens;
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < tokens.len() {
        let end = (start + max_tokens).min(tokens.len());
        let (chunk, _) = decode_within(tokenizer, &tokens, start, end, max_tokens)?;
        if !chunk.is_empty() {
            chunks.push(chunk);
        }
        if end == tokens.len() {
            break;
        }
        start += step;
    }
    Ok(chunks)
}

/// Separators tried in order, with the joiner used when merging pieces split on them.
const RECURSIVE_SEPARATORS: &[(&str, &str)] = &[("\n\n", "\n\n"), ("\n", "\n"), (". ", " "), (" ", " ")];

/// Recursive splitting on paragraph, line, sentence and word separators.
///
/// Text over `max_tokens` is split on the first separator it contains. Pieces that fit are merged
/// greedily up to `max_tokens`, each new chunk starting with trailing pieces of the previous one
/// worth at most `overlap_tokens`. Pieces that still do not fit recurse on the next separator, and
/// text with no separator left is hard-split by tokens.
pub fn split_recursive(
    text: &str,
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
) -> RagResult<Vec<String>> {
    check_budget(max_tokens, overlap_tokens)?;
    let mut chunks = Vec::new();
    split_with(text, RECURSIVE_SEPARATORS, tokenizer, max_tokens, overlap_tokens, &mut chunks)?;
    Ok(chunks)
}

fn split_with(
    text: &str,
    separators: &[(&str, &str)],
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
    chunks: &mut Vec<String>,
) -> RagResult<()> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(());
    }
    if tokenizer.count(text)? <= max_tokens {
        chunks.push(text.to_string());
        return Ok(());
    }

    let Some(at) = separators.iter().position(|(sep, _)| text.contains(sep)) else {
        let tokens = tokenizer.encode(text)?;
        chunks.extend(hard_split(&tokens, tokenizer, max_tokens)?);
        return Ok(());
    };
    let (separator, joiner) = separators[at];
    let finer = &separators[at + 1..];

    let mut fitting: Vec<&str> = Vec::new();
    for piece in text.split_inclusive(separator).map(str::trim).filter(|p| !p.is_empty()) {
        if tokenizer.count(piece)? <= max_tokens {
            fitting.push(piece);
            continue;
        }
        merge_pieces(&fitting, joiner, tokenizer, max_tokens, overlap_tokens, chunks)?;
        fitting.clear();
        split_with(piece, finer, tokenizer, max_tokens, overlap_tokens, chunks)?;
    }
    merge_pieces(&fitting, joiner, tokenizer, max_tokens, overlap_tokens, chunks)
}

/// Greedy merge of pieces that each fit the budget.
fn merge_pieces(
    pieces: &[&str],
    joiner: &str,
    tokenizer: &dyn Tokenizer,
    max_tokens: usize,
    overlap_tokens: usize,
    chunks: &mut Vec<String>,
) -> RagResult<()> {
    let count_with = |window: &[&str], next: &str| -> RagResult<usize> {
        let mut joined = window.join(joiner);
        joined.push_str(joiner);
        joined.push_str(next);
        tokenizer.count(&joined)
    };

    let mut window: Vec<&str> = Vec::new();
    for &piece in pieces {
        if !window.is_empty() && count_with(&window, piece)? > max_tokens {
            chunks.push(window.join(joiner));
            while !window.is_empty()
                && (tokenizer.count(&window.join(joiner))? > overlap_tokens
                    || count_with(&window, piece)? > max_tokens)
            {
                window.remove(0);
            }
        }
        window.push(piece);
    }
    if !window.is_empty() {
        chunks.push(window.join(joiner));
    }
    Ok(())
}
