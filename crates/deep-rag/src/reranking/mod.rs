pub mod cross_encoder;

pub use cross_encoder::CrossEncoderReranker;

use crate::error::Result;

/// Pairwise (query, chunk text) reranker. Optional at retrieval time:
/// when absent or failing, candidates keep `ce = 0` and ranking falls back
/// to the vector channel.
pub trait Reranker: Send + Sync {
    /// Score one pair. Higher is more relevant; scores may be negative.
    fn score(&self, query: &str, text: &str) -> Result<f32>;

    /// Score every candidate against the query. Default implementation
    /// scores pairs one by one.
    fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        texts.iter().map(|t| self.score(query, t)).collect()
    }
}
