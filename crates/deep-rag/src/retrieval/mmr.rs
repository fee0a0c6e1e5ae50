//! Maximal Marginal Relevance selection over dense vectors.

use crate::types::RetrievedChunk;

/// Dot product; equals cosine similarity when both vectors are unit-length.
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Greedy MMR selection of `k` chunks from `candidates`.
///
/// Maximizes `lambda * cos(q, c) - (1 - lambda) * max_{s in selected} cos(c, s)`.
/// Candidates without an embedding never score above ones that carry one and
/// contribute zero similarity. Output preserves selection order.
pub fn mmr(
    candidates: &[RetrievedChunk],
    query_emb: &[f32],
    lambda: f32,
    k: usize,
) -> Vec<RetrievedChunk> {
    let mut remaining: Vec<&RetrievedChunk> = candidates.iter().collect();
    let mut selected: Vec<RetrievedChunk> = Vec::with_capacity(k.min(remaining.len()));

    while selected.len() < k && !remaining.is_empty() {
        let mut best_idx = 0usize;
        let mut best_score = f32::NEG_INFINITY;

        for (i, cand) in remaining.iter().enumerate() {
            let Some(emb) = cand.embedding.as_deref() else {
                continue;
            };
            let sim_q = dot(emb, query_emb);
            let sim_d = selected
                .iter()
                .filter_map(|s| s.embedding.as_deref())
                .map(|s| dot(emb, s))
                .fold(0.0f32, f32::max);
            let score = lambda * sim_q - (1.0 - lambda) * sim_d;
            if score > best_score {
                best_score = score;
                best_idx = i;
            }
        }

        if best_score == f32::NEG_INFINITY {
            // Nothing left with an embedding.
            break;
        }
        selected.push(remaining.remove(best_idx).clone());
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;
    use uuid::Uuid;

    fn chunk(emb: Vec<f32>) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            doc_id: Some(Uuid::new_v4()),
            text: "t".to_string(),
            page_start: Some(1),
            page_end: Some(1),
            content_type: ContentType::Text,
            image_path: None,
            lex: 0.0,
            vec: 0.0,
            ce: 0.0,
            embedding: Some(emb),
        }
    }

    #[test]
    fn test_mmr_picks_most_relevant_first() {
        let query = vec![1.0, 0.0];
        let near = chunk(vec![0.99, 0.14]);
        let far = chunk(vec![0.0, 1.0]);
        let picked = mmr(&[far.clone(), near.clone()], &query, 0.5, 1);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].chunk_id, near.chunk_id);
    }

    #[test]
    fn test_mmr_prefers_diversity_over_duplicates() {
        let query = vec![1.0, 0.0];
        let a = chunk(vec![0.95, 0.312]);
        let a_dup = chunk(vec![0.95, 0.312]);
        let b = chunk(vec![0.95, -0.312]);
        let picked = mmr(&[a.clone(), a_dup.clone(), b.clone()], &query, 0.5, 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].chunk_id, a.chunk_id);
        // The duplicate of `a` is fully redundant; the diverse chunk wins slot 2.
        assert_eq!(picked[1].chunk_id, b.chunk_id);
    }

    #[test]
    fn test_mmr_bounded_by_candidates() {
        let query = vec![1.0, 0.0];
        let a = chunk(vec![1.0, 0.0]);
        let picked = mmr(&[a], &query, 0.5, 8);
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_mmr_skips_candidates_without_embeddings() {
        let query = vec![1.0, 0.0];
        let mut no_emb = chunk(vec![]);
        no_emb.embedding = None;
        let good = chunk(vec![1.0, 0.0]);
        let picked = mmr(&[no_emb, good.clone()], &query, 0.5, 2);
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].chunk_id, good.chunk_id);
    }
}
