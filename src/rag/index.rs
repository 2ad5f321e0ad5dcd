use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use super::chunker::{Chunk, ChunkStrategy};
use crate::config::IndexConfig;
use crate::embedding::Embedder;
use crate::error::{RagError, RagResult};

const VECTORS_MAGIC: u32 = 0x52414756; // "RAGV"
const VECTORS_VERSION: u32 = 2;
const HEADER_LEN: usize = 24;
const MANIFEST_VERSION: u32 = 1;
const MAX_LAYER: usize = 16;

pub const VECTORS_FILE: &str = "vectors.bin";
pub const CHUNKS_FILE: &str = "chunks.jsonl";
pub const META_FILE: &str = "meta.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexParams {
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self { m: 32, ef_construction: 200, ef_search: 128 }
    }
}

impl From<&IndexConfig> for IndexParams {
    fn from(config: &IndexConfig) -> Self {
        Self { m: config.m, ef_construction: config.ef_construction, ef_search: config.ef_search }
    }
}

/// Manifests are only written once all artifacts are in place, so any other value is unreadable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Complete,
}

/// Build manifest written next to the two index artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexMeta {
    pub version: u32,
    pub cache_key: String,
    pub locator: String,
    pub embedding_model: String,
    pub dimensions: u32,
    pub chunk_strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub chunk_count: usize,
    pub skipped_count: usize,
    pub m: usize,
    pub ef_construction: usize,
    pub last_indexed: String,
    pub status: BuildStatus,
}

/// Chunking parameters a build was produced with.
#[derive(Debug, Clone, Copy)]
pub struct ChunkParams {
    pub strategy: ChunkStrategy,
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl IndexMeta {
    /// Manifest for a finished build of `index`. `skipped_count` is the number of oversize chunks.
    pub fn complete(
        cache_key: &str,
        locator: &str,
        embedding_model: &str,
        chunking: ChunkParams,
        index: &EmbeddingIndex,
        skipped_count: usize,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            cache_key: cache_key.to_string(),
            locator: locator.to_string(),
            embedding_model: embedding_model.to_string(),
            dimensions: index.dimensions() as u32,
            chunk_strategy: chunking.strategy,
            chunk_size: chunking.max_tokens,
            chunk_overlap: chunking.overlap_tokens,
            chunk_count: index.len(),
            skipped_count,
            m: index.params().m,
            ef_construction: index.params().ef_construction,
            last_indexed: chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
            status: BuildStatus::Complete,
        }
    }
}

#[derive(Debug, PartialEq)]
pub enum IndexStatus {
    Fresh,
    Stale,
    Missing,
}

/// Content address of one document's retrievable state.
pub fn cache_key(
    locator: &str,
    strategy: ChunkStrategy,
    max_tokens: usize,
    overlap_tokens: usize,
    embedding_model: &str,
) -> String {
    let max_tokens = max_tokens.to_string();
    let overlap_tokens = overlap_tokens.to_string();
    let mut hasher = Sha256::new();
    for part in [locator, strategy.as_str(), &max_tokens, &overlap_tokens, embedding_model] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// Whether `index_dir` holds a complete build for `key`.
pub fn check_status(index_dir: &Path, key: &str) -> IndexStatus {
    if !index_dir.join(META_FILE).exists() || !index_dir.join(VECTORS_FILE).exists() {
        return IndexStatus::Missing;
    }
    if !index_dir.join(CHUNKS_FILE).exists() {
        return IndexStatus::Missing;
    }
    match read_meta(index_dir) {
        Ok(meta) if meta.cache_key == key && meta.status == BuildStatus::Complete => IndexStatus::Fresh,
        _ => IndexStatus::Stale,
    }
}

pub fn read_meta(index_dir: &Path) -> RagResult<IndexMeta> {
    let path = index_dir.join(META_FILE);
    let content = std::fs::read_to_string(&path)
        .map_err(|e| RagError::missing_index(&path, format!("Failed to read manifest: {e}")))?;
    serde_json::from_str(&content)
        .map_err(|e| RagError::corrupt_index(&path, format!("Failed to parse manifest: {e}")))
}

/// One approximate neighbor returned by [`EmbeddingIndex::search`].
#[derive(Debug, Clone)]
pub struct SearchHit<'a> {
    pub position: usize,
    pub chunk: &'a Chunk,
    pub vector: &'a [f32],
    pub distance: f32,
}

/// HNSW graph over the embeddings of one chunk collection.
///
/// `chunks[i]` and `vectors[i]` describe the same graph node (data id `i`). The graph uses cosine
/// distance and is never mutated after construction.
pub struct EmbeddingIndex {
    chunks: Vec<Chunk>,
    vectors: Vec<Vec<f32>>,
    dims: usize,
    params: IndexParams,
    graph: Hnsw<'static, f32, DistCosine>,
}

impl std::fmt::Debug for EmbeddingIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingIndex")
            .field("chunks", &self.chunks.len())
            .field("dims", &self.dims)
            .field("params", &self.params)
            .finish()
    }
}

impl EmbeddingIndex {
    /// Embed `chunks` and index them. Chunks whose token count exceeds `max_embedding_tokens`
    /// are skipped with a warning and dropped from the collection.
    pub async fn build(
        chunks: Vec<Chunk>,
        embedder: &dyn Embedder,
        max_embedding_tokens: usize,
        params: IndexParams,
    ) -> RagResult<Self> {
        let mut kept = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.token_count > max_embedding_tokens {
                tracing::warn!(
                    chunk_id = %chunk.id,
                    tokens = chunk.token_count,
                    limit = max_embedding_tokens,
                    "Oversize chunk skipped"
                );
                continue;
            }
            kept.push(chunk);
        }

        let texts: Vec<&str> = kept.iter().map(|c| c.content.as_str()).collect();
        let vectors = embedder.embed_batch(&texts).await?;
        if vectors.len() != kept.len() {
            return Err(RagError::EmbeddingService(format!(
                "Expected {} embeddings, got {}",
                kept.len(),
                vectors.len()
            )));
        }

        let dims = vectors.first().map(Vec::len).unwrap_or(0);
        if let Some((i, v)) = vectors.iter().enumerate().find(|(_, v)| v.len() != dims) {
            return Err(RagError::EmbeddingService(format!(
                "Embedding dimension mismatch at {}: got {}, expected {dims}",
                kept[i].id,
                v.len()
            )));
        }

        tracing::info!(chunks = kept.len(), dims, m = params.m, "Building HNSW index");
        Ok(Self::assemble(kept, vectors, dims, params))
    }

    fn assemble(chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>, dims: usize, params: IndexParams) -> Self {
        let graph = Hnsw::<f32, DistCosine>::new(
            params.m,
            vectors.len().max(1),
            MAX_LAYER,
            params.ef_construction,
            DistCosine {},
        );
        // serial insertion in chunk order
        for (id, vector) in vectors.iter().enumerate() {
            graph.insert_slice((vector.as_slice(), id));
        }
        Self { chunks, vectors, dims, params, graph }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        self.vectors.get(position).map(Vec::as_slice)
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    pub fn params(&self) -> IndexParams {
        self.params
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Up to `k` approximate nearest neighbors of `query`, closest first.
    pub fn search(&self, query: &[f32], k: usize) -> RagResult<Vec<SearchHit<'_>>> {
        if k == 0 || self.chunks.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dims {
            return Err(RagError::EmbeddingService(format!(
                "Query dimension {} does not match index dimension {}",
                query.len(),
                self.dims
            )));
        }

        let ef_search = self.params.ef_search.max(k);
        let hits = self
            .graph
            .search(query, k, ef_search)
            .into_iter()
            .filter_map(|n| {
                let chunk = self.chunks.get(n.d_id)?;
                Some(SearchHit {
                    position: n.d_id,
                    chunk,
                    vector: &self.vectors[n.d_id],
                    distance: n.distance,
                })
            })
            .collect();
        Ok(hits)
    }

    /// Write the index atomically into `index_dir`.
    ///
    /// Artifacts are staged in a sibling temp directory and swapped in with directory renames while
    /// holding an exclusive lock on the parent's `.lock`.
    pub fn persist(&self, index_dir: &Path, meta: &IndexMeta) -> RagResult<()> {
        write_index(index_dir, &self.chunks, &self.vectors, meta, self.params)
    }

    /// Load both artifacts from `index_dir` and rebuild the graph.
    pub fn load(index_dir: &Path, ef_search: usize) -> RagResult<Self> {
        let root = index_root(index_dir)?;
        let _lock = acquire_shared_lock(&root)?;

        let vectors_path = index_dir.join(VECTORS_FILE);
        let chunks_path = index_dir.join(CHUNKS_FILE);
        for path in [&vectors_path, &chunks_path] {
            if !path.exists() {
                return Err(RagError::missing_index(path, "artifact not found"));
            }
        }

        let (header, vectors) = read_vectors(&vectors_path)?;
        let chunks = read_chunks(&chunks_path)?;

        if chunks.len() != vectors.len() {
            return Err(RagError::corrupt_index(
                index_dir,
                format!("{} vectors but {} chunks", vectors.len(), chunks.len()),
            ));
        }

        let params = IndexParams { m: header.m, ef_construction: header.ef_construction, ef_search };
        tracing::debug!(dir = %index_dir.display(), chunks = chunks.len(), "Loaded index artifacts");
        Ok(Self::assemble(chunks, vectors, header.dims, params))
    }
}

fn index_root(index_dir: &Path) -> RagResult<PathBuf> {
    index_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| RagError::Internal(format!("Index dir has no parent: {}", index_dir.display())))
}

fn acquire_exclusive_lock(root: &Path) -> RagResult<File> {
    use fs2::FileExt;
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(root.join(".lock"))
        .map_err(|e| RagError::Io(format!("Failed to create lock file: {e}")))?;
    lock_file
        .lock_exclusive()
        .map_err(|e| RagError::Io(format!("Failed to acquire lock: {e}")))?;
    Ok(lock_file)
}

/// Shared lock for reading. Returns `None` when nothing was ever written under `root`.
fn acquire_shared_lock(root: &Path) -> RagResult<Option<File>> {
    use fs2::FileExt;
    let lock_path = root.join(".lock");
    if !lock_path.exists() {
        return Ok(None);
    }
    let lock_file =
        File::open(&lock_path).map_err(|e| RagError::Io(format!("Failed to open lock file: {e}")))?;
    lock_file
        .lock_shared()
        .map_err(|e| RagError::Io(format!("Failed to acquire shared lock: {e}")))?;
    Ok(Some(lock_file))
}

fn write_index(
    index_dir: &Path,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    meta: &IndexMeta,
    params: IndexParams,
) -> RagResult<()> {
    use fs2::FileExt;

    let root = index_root(index_dir)?;
    std::fs::create_dir_all(&root)?;
    let lock_file = acquire_exclusive_lock(&root)?;

    let temp_dir = root.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&temp_dir)?;

    if let Err(e) = stage_artifacts(&temp_dir, chunks, vectors, meta, params) {
        let _ = std::fs::remove_dir_all(&temp_dir);
        return Err(e);
    }

    // Swap the whole directory so both artifacts change together
    let old_backup = root.join(format!(".old-{}", uuid::Uuid::new_v4()));
    let has_existing = index_dir.exists();
    if has_existing {
        std::fs::rename(index_dir, &old_backup)
            .map_err(|e| RagError::Io(format!("Failed to move previous index aside: {e}")))?;
    }
    if let Err(e) = std::fs::rename(&temp_dir, index_dir) {
        if has_existing {
            let _ = std::fs::rename(&old_backup, index_dir);
        }
        let _ = std::fs::remove_dir_all(&temp_dir);
        return Err(RagError::Io(format!("Failed to move index into place: {e}")));
    }
    if has_existing {
        let _ = std::fs::remove_dir_all(&old_backup);
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(index_dir, std::fs::Permissions::from_mode(0o700));
    }

    let _ = lock_file.unlock();
    tracing::info!(dir = %index_dir.display(), chunks = chunks.len(), "Index persisted");
    Ok(())
}

fn stage_artifacts(
    dir: &Path,
    chunks: &[Chunk],
    vectors: &[Vec<f32>],
    meta: &IndexMeta,
    params: IndexParams,
) -> RagResult<()> {
    // 1. chunks.jsonl
    let mut chunks_file = BufWriter::new(File::create(dir.join(CHUNKS_FILE))?);
    for chunk in chunks {
        serde_json::to_writer(&mut chunks_file, chunk)?;
        chunks_file.write_all(b"\n")?;
    }
    chunks_file.flush()?;

    // 2. vectors.bin: magic, version, dims, count, m, ef_construction (u32 LE) + f32[]
    let dims = vectors.first().map(Vec::len).unwrap_or(0);
    let mut vectors_file = BufWriter::new(File::create(dir.join(VECTORS_FILE))?);
    for field in [
        VECTORS_MAGIC,
        VECTORS_VERSION,
        dims as u32,
        vectors.len() as u32,
        params.m as u32,
        params.ef_construction as u32,
    ] {
        vectors_file.write_all(&field.to_le_bytes())?;
    }
    for vec in vectors {
        for &val in vec {
            vectors_file.write_all(&val.to_le_bytes())?;
        }
    }
    vectors_file.flush()?;

    // 3. meta.json last, so a complete manifest implies complete artifacts
    let meta_json = serde_json::to_string_pretty(meta)?;
    std::fs::write(dir.join(META_FILE), meta_json)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        for file_name in [META_FILE, CHUNKS_FILE, VECTORS_FILE] {
            let _ = std::fs::set_permissions(dir.join(file_name), std::fs::Permissions::from_mode(0o600));
        }
    }
    Ok(())
}

struct VectorsHeader {
    dims: usize,
    m: usize,
    ef_construction: usize,
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(word)
}

fn read_vectors(path: &Path) -> RagResult<(VectorsHeader, Vec<Vec<f32>>)> {
    let file = File::open(path).map_err(|e| RagError::missing_index(path, e.to_string()))?;
    let file_len = file.metadata()?.len() as usize;
    if file_len < HEADER_LEN {
        return Err(RagError::corrupt_index(path, "vectors.bin too small (no header)"));
    }

    // Memory-map the file
    let mmap = unsafe {
        memmap2::MmapOptions::new()
            .map(&file)
            .map_err(|e| RagError::Io(format!("Failed to mmap vectors.bin: {e}")))?
    };

    let magic = read_u32(&mmap, 0);
    let version = read_u32(&mmap, 4);
    let dims = read_u32(&mmap, 8) as usize;
    let count = read_u32(&mmap, 12) as usize;
    let m = read_u32(&mmap, 16) as usize;
    let ef_construction = read_u32(&mmap, 20) as usize;

    if magic != VECTORS_MAGIC {
        return Err(RagError::corrupt_index(
            path,
            format!("Invalid magic: {magic:#X} (expected {VECTORS_MAGIC:#X})"),
        ));
    }
    if version != VECTORS_VERSION {
        return Err(RagError::corrupt_index(path, format!("Unsupported version: {version}")));
    }
    let expected_len = dims
        .checked_mul(count)
        .and_then(|n| n.checked_mul(4))
        .and_then(|n| n.checked_add(HEADER_LEN))
        .ok_or_else(|| {
            RagError::corrupt_index(path, format!("header size overflows (dims={dims}, count={count})"))
        })?;
    if file_len != expected_len {
        return Err(RagError::corrupt_index(
            path,
            format!("size mismatch: got {file_len}, expected {expected_len} (dims={dims}, count={count})"),
        ));
    }
    if count > 0 && (dims == 0 || m == 0) {
        return Err(RagError::corrupt_index(path, "zero dimension or fan-out with non-empty data"));
    }

    let body = &mmap[HEADER_LEN..];
    let vectors = (0..count)
        .map(|i| {
            body[i * dims * 4..(i + 1) * dims * 4]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect()
        })
        .collect();

    Ok((VectorsHeader { dims, m: m.max(1), ef_construction }, vectors))
}

fn read_chunks(path: &Path) -> RagResult<Vec<Chunk>> {
    let file = File::open(path).map_err(|e| RagError::missing_index(path, e.to_string()))?;
    let mut chunks = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let chunk: Chunk = serde_json::from_str(&line)
            .map_err(|e| RagError::corrupt_index(path, format!("line {}: {e}", n + 1)))?;
        chunks.push(chunk);
    }
    Ok(chunks)
}
