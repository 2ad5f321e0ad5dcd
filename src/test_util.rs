//! Deterministic in-process collaborators for tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::RagConfig;
use crate::embedding::Embedder;
use crate::pipeline::Pipeline;
use crate::error::{RagError, RagResult};
use crate::rag::Chunk;
use crate::source::DocumentSource;
use crate::synthesis::{Answer, Synthesizer};
use crate::tokenizer::Tokenizer;

/// One token per whitespace-separated word, so token arithmetic in tests is exact.
#[derive(Default)]
pub struct WordTokenizer {
    vocab: Mutex<(HashMap<String, u32>, Vec<String>)>,
}

impl Tokenizer for WordTokenizer {
    fn encode(&self, text: &str) -> RagResult<Vec<u32>> {
        let mut vocab = self.vocab.lock().unwrap();
        let (ids, words) = &mut *vocab;
        Ok(text
            .split_whitespace()
            .map(|w| {
                *ids.entry(w.to_string()).or_insert_with(|| {
                    words.push(w.to_string());
                    (words.len() - 1) as u32
                })
            })
            .collect())
    }

    fn decode(&self, ids: &[u32]) -> RagResult<String> {
        let vocab = self.vocab.lock().unwrap();
        let words: Vec<&str> = ids
            .iter()
            .map(|&id| vocab.1.get(id as usize).map(String::as_str).unwrap_or("<unk>"))
            .collect();
        Ok(words.join(" "))
    }
}

/// Bag-of-words vectors over a fixed vocabulary: component `i` counts occurrences of `vocabulary[i]`.
pub struct KeywordEmbedder {
    vocabulary: Vec<String>,
    fail_on: Option<String>,
    pub calls: AtomicUsize,
}

impl KeywordEmbedder {
    pub fn new(vocabulary: &[&str]) -> Self {
        Self {
            vocabulary: vocabulary.iter().map(|w| w.to_lowercase()).collect(),
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail any request whose text contains `marker`.
    pub fn failing_on(mut self, marker: &str) -> Self {
        self.fail_on = Some(marker.to_string());
        self
    }

    pub fn vectorize(&self, text: &str) -> Vec<f32> {
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();
        self.vocabulary
            .iter()
            .map(|v| words.iter().filter(|w| *w == v).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn model(&self) -> &str {
        "keyword-test"
    }

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(marker) = &self.fail_on {
            if text.contains(marker.as_str()) {
                return Err(RagError::EmbeddingService(format!("refused text containing {marker}")));
            }
        }
        Ok(self.vectorize(text))
    }
}

/// Fixed vectors per exact text; unknown text is an error.
pub struct TableEmbedder {
    table: HashMap<String, Vec<f32>>,
}

impl TableEmbedder {
    pub fn new(entries: &[(&str, Vec<f32>)]) -> Self {
        Self {
            table: entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        }
    }
}

#[async_trait]
impl Embedder for TableEmbedder {
    fn model(&self) -> &str {
        "table-test"
    }

    async fn embed(&self, text: &str) -> RagResult<Vec<f32>> {
        self.table
            .get(text)
            .cloned()
            .ok_or_else(|| RagError::EmbeddingService(format!("no vector for {text:?}")))
    }
}

/// Answers with the first context chunk and cites every chunk it was given.
#[derive(Default)]
pub struct EchoSynthesizer {
    pub seen: Mutex<Vec<(String, Vec<String>)>>,
}

#[async_trait]
impl Synthesizer for EchoSynthesizer {
    async fn synthesize(&self, question: &str, chunks: &[Chunk]) -> RagResult<Answer> {
        self.seen.lock().unwrap().push((
            question.to_string(),
            chunks.iter().map(|c| c.id.clone()).collect(),
        ));
        Ok(Answer::Grounded {
            answer: chunks
                .first()
                .map(|c| c.content.clone())
                .unwrap_or_else(|| "Not found in provided clauses.".to_string()),
            reasoning: format!("{} clauses supplied", chunks.len()),
            clause_ids: chunks.iter().map(|c| c.id.clone()).collect(),
        })
    }
}

/// Serves fixed text per locator and counts fetches.
#[derive(Default)]
pub struct StaticSource {
    documents: HashMap<String, String>,
    pub fetches: AtomicUsize,
}

impl StaticSource {
    pub fn with(mut self, locator: &str, text: &str) -> Self {
        self.documents.insert(locator.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl DocumentSource for StaticSource {
    async fn fetch(&self, locator: &str) -> RagResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.documents
            .get(locator)
            .cloned()
            .ok_or_else(|| RagError::SourceFetch(format!("{locator} unreachable")))
    }
}

pub fn chunk(id: &str, content: &str, token_count: usize) -> Chunk {
    Chunk { id: id.to_string(), content: content.to_string(), token_count }
}

/// Three short clauses; with a 10-word budget each lands in its own chunk.
pub const POLICY: &str = "1. Entry age is 3 months to 90 years.\n\
                          2. Family means spouse and children.\n\
                          3. Grace period is thirty days.";

pub const POLICY_VOCABULARY: &[&str] = &["entry", "age", "family", "spouse", "grace", "period"];

pub fn test_config(index_root: &Path) -> RagConfig {
    let mut config = RagConfig::default();
    config.index.root = index_root.to_path_buf();
    config.chunking.max_tokens = 10;
    config.chunking.overlap_tokens = 3;
    config
}

/// Pipeline over word tokens and keyword vectors for [`POLICY_VOCABULARY`].
pub fn fake_pipeline(index_root: &Path, source: Arc<StaticSource>, synthesizer: Arc<EchoSynthesizer>) -> Pipeline {
    Pipeline::new(
        &test_config(index_root),
        Arc::new(WordTokenizer::default()),
        source,
        Arc::new(KeywordEmbedder::new(POLICY_VOCABULARY)),
        synthesizer,
    )
}

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve_mock(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}
