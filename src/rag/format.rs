use super::chunker::Chunk;

pub const NO_CONTEXT_NOTICE: &str = "No relevant clauses found in the document.";

/// Render ranked chunks as `[id]` headed blocks separated by `---`, the layout the answer
/// prompt cites clause ids from.
pub fn format_context(chunks: &[Chunk]) -> String {
    if chunks.is_empty() {
        return NO_CONTEXT_NOTICE.to_string();
    }

    chunks
        .iter()
        .map(|c| format!("[{}]\n{}", c.id, c.content))
        .collect::<Vec<_>>()
        .join("\n---\n")
}
