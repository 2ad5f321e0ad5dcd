// ============================================
// CLAUSE RAG
// Clause-aware chunking, retrieval and grounded answering
// ============================================

pub mod config;
pub mod embedding;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod rag;
pub mod server;
pub mod source;
pub mod synthesis;
pub mod tokenizer;

#[cfg(test)]
mod test_util;

pub use config::RagConfig;
pub use error::{RagError, RagResult};
pub use pipeline::Pipeline;
pub use synthesis::{Answer, QuestionAnswer};
