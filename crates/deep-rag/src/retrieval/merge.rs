//! Merging of two-stage retrieval results.

use std::collections::HashSet;

use crate::types::RetrievedChunk;

/// Ranking key for merged candidates: the cross-encoder score when the
/// reranker produced one, else the vector score.
fn ranking_key(chunk: &RetrievedChunk) -> f32 {
    if chunk.ce != 0.0 {
        chunk.ce
    } else {
        chunk.vec
    }
}

/// Merge primary (in-scope) and secondary (cross-document) chunks,
/// deduplicated by chunk id. Primary chunks get a +0.1 boost on the
/// ranking key so scope results stay ahead of equally scored strangers.
/// Returns the top `k`.
pub fn merge_and_deduplicate(
    primary: Vec<RetrievedChunk>,
    secondary: Vec<RetrievedChunk>,
    k: usize,
) -> Vec<RetrievedChunk> {
    let mut seen: HashSet<uuid::Uuid> = HashSet::new();
    let mut merged: Vec<(f32, RetrievedChunk)> = Vec::new();

    for chunk in primary {
        if seen.insert(chunk.chunk_id) {
            let key = ranking_key(&chunk) + 0.1;
            merged.push((key, chunk));
        }
    }
    for chunk in secondary {
        if seen.insert(chunk.chunk_id) {
            let key = ranking_key(&chunk);
            merged.push((key, chunk));
        }
    }

    merged.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(k);
    merged.into_iter().map(|(_, c)| c).collect()
}
