//! Grounded answer synthesis over retrieved clauses.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::config::OpenAiConfig;
use crate::embedding::build_client;
use crate::error::{RagError, RagResult};
use crate::rag::{format_context, Chunk};

/// Outcome for one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Answer {
    Grounded {
        answer: String,
        reasoning: String,
        clause_ids: Vec<String>,
    },
    /// The model replied, but not in the requested JSON shape.
    Degraded { raw_text: String },
    NotAnswerable { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionAnswer {
    pub question: String,
    #[serde(flatten)]
    pub answer: Answer,
}

#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, question: &str, chunks: &[Chunk]) -> RagResult<Answer>;
}

static JSON_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("static regex"));

#[derive(Deserialize)]
struct ModelAnswer {
    answer: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    clauses: Vec<String>,
}

/// Parse the model's reply; anything without a usable JSON object becomes [`Answer::Degraded`].
pub fn parse_answer(text: &str) -> Answer {
    let parsed = JSON_BLOCK
        .find(text)
        .and_then(|m| serde_json::from_str::<ModelAnswer>(m.as_str()).ok());

    match parsed {
        Some(reply) => {
            let mut clause_ids: Vec<String> = Vec::with_capacity(reply.clauses.len());
            for id in reply.clauses {
                if !clause_ids.contains(&id) {
                    clause_ids.push(id);
                }
            }
            Answer::Grounded { answer: reply.answer, reasoning: reply.reasoning, clause_ids }
        }
        None => Answer::Degraded { raw_text: text.trim().to_string() },
    }
}

pub fn build_prompt(question: &str, chunks: &[Chunk]) -> String {
    format!(
        "You analyse legal, insurance and compliance policy documents.\n\
         Answer the question using only the clauses below. Do not use outside knowledge.\n\
         \n\
         ---\n\
         Question:\n{question}\n\
         \n\
         Relevant clauses:\n{context}\n\
         ---\n\
         \n\
         Rules:\n\
         - Quote or closely summarise the clause text the answer comes from.\n\
         - Keep numbers, conditions and waiting periods exactly as written.\n\
         - List the ids of the clauses you relied on, e.g. [\"chunk_1\"].\n\
         - If the clauses do not contain the answer, answer \"Not found in provided clauses.\"\n\
         \n\
         Reply with a single JSON object:\n\
         {{\"answer\": \"...\", \"reasoning\": \"...\", \"clauses\": [\"chunk_3\", \"chunk_6\"]}}\n",
        context = format_context(chunks),
    )
}

/// Chat-completions client for `POST {base_url}/chat/completions`.
pub struct OpenAiSynthesizer {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl OpenAiSynthesizer {
    pub fn new(config: &OpenAiConfig) -> RagResult<Self> {
        Ok(Self {
            client: build_client(&config.api_key, config.timeout_secs)?,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.chat_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, question: &str, chunks: &[Chunk]) -> RagResult<Answer> {
        let prompt = build_prompt(question, chunks);
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            messages: vec![ChatMessage { role: "user", content: &prompt }],
        };

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::Synthesis(format!("Request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(RagError::Synthesis(format!("{status}: {text}")));
        }

        let parsed: ChatResponse = resp
            .json()
            .await
            .map_err(|e| RagError::Synthesis(format!("Failed to parse response: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        let answer = parse_answer(&text);
        if matches!(answer, Answer::Degraded { .. }) {
            tracing::warn!(question, "Model reply was not valid JSON, returning raw text");
        }
        Ok(answer)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
