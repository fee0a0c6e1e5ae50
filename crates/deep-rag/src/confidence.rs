//! Confidence scoring over ranked evidence.
//!
//! Ten features derived from the ranked chunks plus the query terms feed a
//! logistic model; the resulting probability drives the abstain / clarify /
//! answer decision. Display confidence is the probability as a percentage.
//! This is distinct from the critic's 0-1 strong-chunk heuristic.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::config::ConfidenceConfig;
use crate::types::{RagAction, RetrievedChunk};

/// Cosine floor for the coverage feature (f5).
const COS_FLOOR: f32 = 0.22;

/// Vector floor for the meta-query rescue trigger.
const RESCUE_VEC_FLOOR: f32 = 0.4;

/// Stop words excluded from term coverage (f7). Frequent in meta-queries
/// ("can you find me documents which...") but absent from content.
const STOP_WORDS: &[&str] = &[
    "can", "you", "find", "me", "which", "documents", "have", "in", "them", "the", "a", "an",
    "is", "are", "was", "were", "do", "does", "did",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceReport {
    /// Display confidence, percentage in [0, 100].
    pub confidence: f32,
    /// Raw probability in [0, 1].
    pub probability: f32,
    pub action: RagAction,
    /// Features f1..f10.
    pub features: [f32; 10],
}

fn safe_div(a: f32, b: f32) -> f32 {
    if b != 0.0 {
        a / b
    } else {
        0.0
    }
}

/// Numerically stable sigmoid.
fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase().split_whitespace().map(str::to_string).collect()
}

/// Build features f1..f10 from ranked evidence.
///
/// `query_terms` feeds term coverage (f7); `answer_text` feeds the optional
/// answer-overlap feature (f10), 0 when absent.
pub fn build_features(
    ranked: &[RetrievedChunk],
    query_terms: Option<&HashSet<String>>,
    answer_text: Option<&str>,
) -> [f32; 10] {
    let k = ranked.len();
    if k == 0 {
        return [0.0; 10];
    }
    let kf = k as f32;

    let cosines: Vec<f32> = ranked.iter().map(|c| c.vec).collect();
    let lex_scores: Vec<f32> = ranked.iter().map(|c| c.lex).collect();
    let ce_scores: Vec<f32> = ranked.iter().map(|c| c.ce).collect();

    // Rerank channel: ce when present, else vec.
    let mut reranks: Vec<f32> = ranked
        .iter()
        .map(|c| if c.ce != 0.0 { c.ce } else { c.vec })
        .collect();

    // Meta-query rescue: lexical search produced nothing, vector search found
    // relevant chunks, and every cross-encoder score is negative. Bag-of-words
    // tokenization fails on queries like "find documents containing X" even
    // when semantic matching succeeds; rerank on the vector channel instead.
    let has_lexical_matches = lex_scores.iter().any(|&l| l > 0.0);
    let has_good_vector_matches = cosines.iter().any(|&v| v > RESCUE_VEC_FLOOR);
    let all_ce_negative = !ce_scores.is_empty() && ce_scores.iter().all(|&c| c < 0.0);
    if !has_lexical_matches && has_good_vector_matches && all_ce_negative {
        tracing::info!(
            max_vec = cosines.iter().cloned().fold(0.0f32, f32::max),
            "lexical search empty but vector matches present with all-negative ce; \
             using vector scores as rerank channel"
        );
        reranks = cosines.clone();
    }

    // f1: max rerank score.
    let max_r = reranks.iter().cloned().fold(f32::MIN, f32::max);

    // f2: top1 - top2 margin, 0 for a single chunk.
    let margin = if k > 1 {
        let mut sorted = reranks.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        sorted[0] - sorted[1]
    } else {
        0.0
    };

    // f3 / f4: mean and stddev of cosine.
    let mean_cos = cosines.iter().sum::<f32>() / kf;
    let std_cos = if k > 1 {
        let var = cosines.iter().map(|x| (x - mean_cos).powi(2)).sum::<f32>() / kf;
        var.sqrt()
    } else {
        0.0
    };

    // f5: fraction of chunks at or above the cosine floor.
    let cos_cov = cosines.iter().filter(|&&x| x >= COS_FLOOR).count() as f32 / kf;

    // f6: normalized lexical mass.
    let max_lex = lex_scores.iter().cloned().fold(0.0f32, f32::max);
    let bm25_norm = if max_lex > 0.0 {
        lex_scores.iter().sum::<f32>() / (max_lex * kf)
    } else {
        0.0
    };

    // f7: query term coverage, stop-word filtered.
    let term_cov = if let Some(terms) = query_terms {
        let mut meaningful: HashSet<String> = terms
            .iter()
            .map(|t| t.to_lowercase())
            .filter(|t| !STOP_WORDS.contains(&t.as_str()))
            .collect();
        if meaningful.is_empty() {
            meaningful = terms.iter().map(|t| t.to_lowercase()).collect();
        }
        let mut seen: HashSet<String> = HashSet::new();
        for chunk in ranked {
            let tokens = tokenize(&chunk.text);
            seen.extend(tokens.intersection(&meaningful).cloned());
        }
        safe_div(seen.len() as f32, meaningful.len() as f32)
    } else {
        0.0
    };

    // f8: unique page-start count over k.
    let unique_pages: HashSet<i32> = ranked.iter().filter_map(|c| c.page_start).collect();
    let page_frac = safe_div(unique_pages.len() as f32, kf);

    // f9: unique document count over k.
    let unique_docs: HashSet<uuid::Uuid> = ranked.iter().filter_map(|c| c.doc_id).collect();
    let doc_div = safe_div(unique_docs.len() as f32, kf);

    // f10: Jaccard overlap between answer tokens and context tokens.
    let overlap = if let Some(answer) = answer_text {
        let ans_tokens = tokenize(answer);
        let mut ctx_tokens: HashSet<String> = HashSet::new();
        for chunk in ranked {
            ctx_tokens.extend(tokenize(&chunk.text));
        }
        let inter = ans_tokens.intersection(&ctx_tokens).count() as f32;
        let union = ans_tokens.union(&ctx_tokens).count().max(1) as f32;
        inter / union
    } else {
        0.0
    };

    [
        max_r, margin, mean_cos, std_cos, cos_cov, bm25_norm, term_cov, page_frac, doc_div,
        overlap,
    ]
}

/// Weighted sum through the sigmoid.
pub fn probability(features: &[f32; 10], config: &ConfidenceConfig) -> f32 {
    let mut s = config.weights[0];
    for (i, f) in features.iter().enumerate() {
        s += config.weights[i + 1] * f;
    }
    sigmoid(s)
}

/// Map a probability to the three-way action.
pub fn decide_action(p: f32, config: &ConfidenceConfig) -> RagAction {
    if p < config.abstain_threshold {
        RagAction::Abstain
    } else if p < config.clarify_threshold {
        RagAction::Clarify
    } else {
        RagAction::Answer
    }
}

/// Score ranked evidence end-to-end: features, probability, action.
pub fn score_chunks(
    ranked: &[RetrievedChunk],
    query: Option<&str>,
    answer_text: Option<&str>,
    config: &ConfidenceConfig,
) -> ConfidenceReport {
    let query_terms = query.map(|q| tokenize(q));
    let features = build_features(ranked, query_terms.as_ref(), answer_text);
    let p = probability(&features, config);
    let action = decide_action(p, config);
    let confidence = p * 100.0;

    tracing::debug!(
        chunks = ranked.len(),
        confidence = format!("{:.1}", confidence),
        probability = format!("{:.3}", p),
        action = ?action,
        "confidence computed"
    );

    ConfidenceReport {
        confidence,
        probability: p,
        action,
        features,
    }
}
