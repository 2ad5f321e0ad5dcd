//! Document preparation (fetch, normalize, chunk, embed, persist) and per-question answering.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{ChunkingConfig, IndexConfig, RagConfig};
use crate::embedding::{Embedder, OpenAiEmbedder};
use crate::error::RagResult;
use crate::rag::{
    cache_key, check_status, normalize, Chunk, ChunkParams, ClauseChunker, EmbeddingIndex, IndexMeta,
    IndexParams, IndexStatus, Retriever,
};
use crate::source::{DocumentSource, HttpDocumentSource};
use crate::synthesis::{Answer, OpenAiSynthesizer, QuestionAnswer, Synthesizer};
use crate::tokenizer::{self, Tokenizer};

pub struct Pipeline {
    chunking: ChunkingConfig,
    index: IndexConfig,
    tokenizer: Arc<dyn Tokenizer>,
    source: Arc<dyn DocumentSource>,
    embedder: Arc<dyn Embedder>,
    synthesizer: Arc<dyn Synthesizer>,
    retriever: Retriever,
    /// Recently prepared indexes by cache key. Held across builds so only one build runs at a time.
    prepared: Mutex<LruCache<String, Arc<EmbeddingIndex>>>,
}

impl Pipeline {
    pub fn new(
        config: &RagConfig,
        tokenizer: Arc<dyn Tokenizer>,
        source: Arc<dyn DocumentSource>,
        embedder: Arc<dyn Embedder>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.index.memory_cache_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            chunking: config.chunking.clone(),
            index: config.index.clone(),
            tokenizer,
            source,
            retriever: Retriever::new(embedder.clone(), &config.retrieval),
            embedder,
            synthesizer,
            prepared: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Pipeline wired to the HTTP document source and OpenAI-compatible services.
    pub fn from_config(config: &RagConfig) -> RagResult<Self> {
        Self::with_source(config, Arc::new(HttpDocumentSource::new(&config.source)?))
    }

    /// Like [`Pipeline::from_config`] with a caller-chosen document source.
    pub fn with_source(config: &RagConfig, source: Arc<dyn DocumentSource>) -> RagResult<Self> {
        let tokenizer = tokenizer::load(config.chunking.tokenizer_path.as_deref())?;
        Ok(Self::new(
            config,
            tokenizer,
            source,
            Arc::new(OpenAiEmbedder::new(&config.openai)?),
            Arc::new(OpenAiSynthesizer::new(&config.openai)?),
        ))
    }

    pub fn cache_key(&self, locator: &str) -> String {
        cache_key(
            locator,
            self.chunking.strategy,
            self.chunking.max_tokens,
            self.chunking.overlap_tokens,
            self.embedder.model(),
        )
    }

    pub fn index_dir(&self, locator: &str) -> PathBuf {
        self.index.root.join(self.cache_key(locator))
    }

    /// Normalize and chunk raw document text with the configured tokenizer and budget.
    pub fn chunk_document(&self, raw_text: &str) -> RagResult<Vec<Chunk>> {
        let cleaned = normalize(raw_text);
        ClauseChunker::new(
            self.tokenizer.clone(),
            self.chunking.strategy,
            self.chunking.max_tokens,
            self.chunking.overlap_tokens,
        )?
        .chunk_collection(&cleaned)
    }

    /// Index for `locator`, built at most once per cache key unless `force` is set.
    pub async fn prepare(&self, locator: &str, force: bool) -> RagResult<Arc<EmbeddingIndex>> {
        let key = self.cache_key(locator);
        let mut prepared = self.prepared.lock().await;

        if !force {
            if let Some(index) = prepared.get(&key) {
                return Ok(index.clone());
            }
        }

        let dir = self.index.root.join(&key);
        if !force && check_status(&dir, &key) == IndexStatus::Fresh {
            match EmbeddingIndex::load(&dir, self.index.ef_search) {
                Ok(index) => {
                    tracing::info!(locator, key = %key, chunks = index.len(), "Reusing persisted index");
                    let index = Arc::new(index);
                    prepared.put(key, index.clone());
                    return Ok(index);
                }
                Err(e) if e.needs_rebuild() => {
                    tracing::warn!(locator, error = %e, "Persisted index unusable, rebuilding");
                }
                Err(e) => return Err(e),
            }
        }

        let index = Arc::new(self.build(locator, &key).await?);
        if let Some((evicted, _)) = prepared.push(key.clone(), index.clone()).filter(|(k, _)| *k != key) {
            tracing::debug!(key = %evicted, "Evicted prepared index from memory");
        }
        Ok(index)
    }

    async fn build(&self, locator: &str, key: &str) -> RagResult<EmbeddingIndex> {
        tracing::info!(locator, key, "Building index");
        let raw = self.source.fetch(locator).await?;
        let chunks = self.chunk_document(&raw)?;
        let total = chunks.len();

        let index = EmbeddingIndex::build(
            chunks,
            self.embedder.as_ref(),
            self.index.max_embedding_tokens,
            IndexParams::from(&self.index),
        )
        .await?;

        let chunking = ChunkParams {
            strategy: self.chunking.strategy,
            max_tokens: self.chunking.max_tokens,
            overlap_tokens: self.chunking.overlap_tokens,
        };
        let meta = IndexMeta::complete(key, locator, self.embedder.model(), chunking, &index, total - index.len());
        index.persist(&self.index.root.join(key), &meta)?;
        Ok(index)
    }

    /// Answer one question against a prepared index. Failures become [`Answer::NotAnswerable`].
    pub async fn answer(&self, question: &str, index: &EmbeddingIndex) -> Answer {
        let context = match self.retriever.retrieve(question, index).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!(question, error = %e, "Retrieval failed");
                return Answer::NotAnswerable { reason: e.to_string() };
            }
        };
        match self.synthesizer.synthesize(question, &context).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(question, error = %e, "Synthesis failed");
                Answer::NotAnswerable { reason: e.to_string() }
            }
        }
    }

    /// Prepare the document, then answer each question in order.
    pub async fn run(&self, locator: &str, questions: &[String]) -> RagResult<Vec<QuestionAnswer>> {
        let index = self.prepare(locator, false).await?;
        let mut answers = Vec::with_capacity(questions.len());
        for question in questions {
            answers.push(QuestionAnswer {
                question: question.clone(),
                answer: self.answer(question, &index).await,
            });
        }
        Ok(answers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RagError;
    use crate::rag::index::VECTORS_FILE;
    use crate::test_util::{fake_pipeline, EchoSynthesizer, KeywordEmbedder, StaticSource, POLICY};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn questions(qs: &[&str]) -> Vec<String> {
        qs.iter().map(|q| q.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_answers_in_order() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticSource::default().with("policy.txt", POLICY));
        let synth = Arc::new(EchoSynthesizer::default());
        let pipeline = fake_pipeline(dir.path(), source.clone(), synth.clone());

        let answers = pipeline
            .run("policy.txt", &questions(&["What is the grace period?", "Who is family?"]))
            .await
            .unwrap();
        assert_eq!(answers.len(), 2);
        assert_eq!(answers[0].question, "What is the grace period?");
        assert!(matches!(&answers[0].answer, Answer::Grounded { answer, .. } if answer.starts_with("3. Grace")));
        assert!(matches!(&answers[1].answer, Answer::Grounded { answer, .. } if answer.starts_with("2. Family")));

        let seen = synth.seen.lock().unwrap();
        assert_eq!(seen[0].1[0], "chunk_3");
    }

    #[tokio::test]
    async fn test_second_run_skips_rebuild() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticSource::default().with("policy.txt", POLICY));
        let pipeline = fake_pipeline(dir.path(), source.clone(), Arc::new(EchoSynthesizer::default()));
        pipeline.run("policy.txt", &questions(&["Who is family?"])).await.unwrap();
        pipeline.run("policy.txt", &questions(&["Who is family?"])).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        // a fresh process reuses the persisted artifacts
        let source2 = Arc::new(StaticSource::default().with("policy.txt", POLICY));
        let pipeline2 = fake_pipeline(dir.path(), source2.clone(), Arc::new(EchoSynthesizer::default()));
        let index = pipeline2.prepare("policy.txt", false).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(source2.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_rebuilds() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticSource::default().with("policy.txt", POLICY));
        let pipeline = fake_pipeline(dir.path(), source.clone(), Arc::new(EchoSynthesizer::default()));
        pipeline.prepare("policy.txt", false).await.unwrap();
        pipeline.prepare("policy.txt", true).await.unwrap();
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_corrupt_index_triggers_rebuild() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticSource::default().with("policy.txt", POLICY));
        let pipeline = fake_pipeline(dir.path(), source.clone(), Arc::new(EchoSynthesizer::default()));
        pipeline.prepare("policy.txt", false).await.unwrap();

        let vectors = pipeline.index_dir("policy.txt").join(VECTORS_FILE);
        std::fs::write(&vectors, b"garbage").unwrap();

        let source2 = Arc::new(StaticSource::default().with("policy.txt", POLICY));
        let pipeline2 = fake_pipeline(dir.path(), source2.clone(), Arc::new(EchoSynthesizer::default()));
        let index = pipeline2.prepare("policy.txt", false).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(source2.fetches.load(Ordering::SeqCst), 1);
        assert!(EmbeddingIndex::load(&pipeline2.index_dir("policy.txt"), 128).is_ok());
    }

    #[tokio::test]
    async fn test_source_failure_is_fatal_before_questions() {
        let dir = TempDir::new().unwrap();
        let synth = Arc::new(EchoSynthesizer::default());
        let pipeline = fake_pipeline(dir.path(), Arc::new(StaticSource::default()), synth.clone());
        let err = pipeline.run("missing.pdf", &questions(&["Q?"])).await.unwrap_err();
        assert!(matches!(err, RagError::SourceFetch(_)));
        assert!(err.is_upstream());
        assert!(synth.seen.lock().unwrap().is_empty());
        assert!(!pipeline.index_dir("missing.pdf").exists());
    }

    #[tokio::test]
    async fn test_failed_question_is_not_answerable() {
        let dir = TempDir::new().unwrap();
        let mut config = crate::test_util::test_config(dir.path());
        config.retrieval.rerank_k = 2;
        let embedder = Arc::new(
            KeywordEmbedder::new(&["entry", "age", "family", "spouse", "grace", "period"]).failing_on("BROKEN"),
        );
        let pipeline = Pipeline::new(
            &config,
            Arc::new(crate::test_util::WordTokenizer::default()),
            Arc::new(StaticSource::default().with("policy.txt", POLICY)),
            embedder,
            Arc::new(EchoSynthesizer::default()),
        );
        let answers = pipeline
            .run("policy.txt", &questions(&["BROKEN question", "What is the entry age?"]))
            .await
            .unwrap();
        assert!(matches!(&answers[0].answer, Answer::NotAnswerable { reason } if reason.contains("BROKEN")));
        assert!(matches!(&answers[1].answer, Answer::Grounded { clause_ids, .. } if clause_ids[0] == "chunk_1"));
    }

    #[tokio::test]
    async fn test_empty_document_builds_empty_index() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StaticSource::default().with("blank.txt", "Page 1 of 1\n\n"));
        let synth = Arc::new(EchoSynthesizer::default());
        let pipeline = fake_pipeline(dir.path(), source, synth.clone());
        let answers = pipeline.run("blank.txt", &questions(&["Who is family?"])).await.unwrap();
        assert!(matches!(&answers[0].answer, Answer::Grounded { clause_ids, .. } if clause_ids.is_empty()));
        assert!(synth.seen.lock().unwrap()[0].1.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_params_change_cache_key() {
        let dir = TempDir::new().unwrap();
        let source: Arc<StaticSource> = Arc::new(StaticSource::default());
        let a = fake_pipeline(dir.path(), source.clone(), Arc::new(EchoSynthesizer::default()));
        let mut config = crate::test_util::test_config(dir.path());
        config.chunking.max_tokens = 20;
        let b = Pipeline::new(
            &config,
            Arc::new(crate::test_util::WordTokenizer::default()),
            source,
            Arc::new(KeywordEmbedder::new(&["x"])),
            Arc::new(EchoSynthesizer::default()),
        );
        assert_ne!(a.cache_key("doc"), b.cache_key("doc"));
    }

    #[tokio::test]
    async fn test_memory_cache_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut config = crate::test_util::test_config(dir.path());
        config.index.memory_cache_entries = 2;
        let source = Arc::new(
            StaticSource::default()
                .with("a.txt", POLICY)
                .with("b.txt", POLICY)
                .with("c.txt", POLICY),
        );
        let pipeline = Pipeline::new(
            &config,
            Arc::new(crate::test_util::WordTokenizer::default()),
            source.clone(),
            Arc::new(KeywordEmbedder::new(crate::test_util::POLICY_VOCABULARY)),
            Arc::new(EchoSynthesizer::default()),
        );
        for locator in ["a.txt", "b.txt", "c.txt"] {
            pipeline.prepare(locator, false).await.unwrap();
        }
        assert_eq!(pipeline.prepared.lock().await.len(), 2);
        assert!(!pipeline.prepared.lock().await.contains(&pipeline.cache_key("a.txt")));

        // the evicted document comes back from disk, not from the source
        let index = pipeline.prepare("a.txt", false).await.unwrap();
        assert_eq!(index.len(), 3);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.prepared.lock().await.len(), 2);
    }

    #[test]
    fn test_chunk_document_normalizes_first() {
        let dir = TempDir::new().unwrap();
        let pipeline = fake_pipeline(
            dir.path(),
            Arc::new(StaticSource::default()),
            Arc::new(EchoSynthesizer::default()),
        );
        let chunks = pipeline.chunk_document("ACME INSURANCE LTD\nTel: 123\n1. Entry age is 3 months.").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "1. Entry age is 3 months.");
        assert_eq!(chunks[0].id, "chunk_1");
    }
}
