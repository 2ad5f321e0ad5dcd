pub mod boundary;
pub mod chunker;
pub mod format;
pub mod index;
pub mod normalizer;
pub mod retriever;
pub mod search;

pub use boundary::{BoundaryDetector, ClauseLabelBoundaries};
pub use chunker::{
    build_chunks, pack_clauses, split_recursive, split_token_windows, Chunk, ChunkStrategy, ClauseChunker,
};
pub use format::format_context;
pub use index::{cache_key, check_status, ChunkParams, EmbeddingIndex, IndexMeta, IndexParams, IndexStatus};
pub use normalizer::normalize;
pub use retriever::Retriever;
pub use search::{cosine_similarity, rerank, truncate_to_budget};
