//! Critic node: evaluates evidence strength and proposes refinements.
//!
//! The heuristic confidence here is a 0-1 scale distinct from the final
//! user-facing percentage the synthesizer computes later.

use serde_json::json;

use crate::error::Result;
use crate::graph::prompts;
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::{PipelineCtx, CRITIC_CONFIDENCE_TARGET};
use crate::llm::call_llm;
use crate::search::sanitize_refinement;
use crate::types::RetrievedChunk;

/// Maximum refinement sub-queries per round.
const MAX_REFINEMENTS: usize = 2;

/// Strong chunks: positive cross-encoder score above the threshold, or a
/// chunk both pools agreed on.
pub(crate) fn strong_chunk_count(evidence: &[RetrievedChunk], threshold: f32) -> usize {
    evidence
        .iter()
        .filter(|h| h.ce > threshold || (h.lex > 0.0 && h.vec > 0.0))
        .count()
}

/// Heuristic confidence on a 0-1 scale, saturating at 0.9.
pub(crate) fn heuristic_confidence(strong: usize) -> f32 {
    (0.4 + 0.1 * strong as f32).min(0.9)
}

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    let threshold = ctx.config.agent.strong_chunk_threshold;
    let max_iters = ctx.config.agent.max_iters;

    let strong = strong_chunk_count(&state.evidence, threshold);
    let confidence = heuristic_confidence(strong);

    tracing::info!(
        strong,
        total = state.evidence.len(),
        confidence = format!("{:.2}", confidence),
        iterations = format!("{}/{}", state.iterations, max_iters),
        "critic evaluation"
    );
    ctx.audit.log_step(
        thread_id,
        "critic",
        "evaluate",
        Some(confidence),
        Some(state.iterations),
        Some(json!({
            "strong_chunks": strong,
            "total_chunks": state.evidence.len(),
            "threshold": threshold,
        })),
    );

    let mut patch = StatePatch {
        confidence: Some(confidence),
        iterations: Some(state.iterations),
        refinements: Some(Vec::new()),
        ..StatePatch::default()
    };

    if confidence >= CRITIC_CONFIDENCE_TARGET || state.iterations >= max_iters {
        if confidence < CRITIC_CONFIDENCE_TARGET {
            tracing::warn!(
                max_iters,
                confidence = format!("{:.2}", confidence),
                "loop bound reached with weak heuristic; synthesizer decides next"
            );
        }
        return Ok(patch);
    }

    // Weak evidence and budget remaining: ask for refined sub-queries.
    let multi_doc = prompts::is_multi_doc_question(&state.question);
    let prompt = prompts::refinement_prompt(&state.plan, &state.notes, multi_doc);
    let raw = call_llm(
        ctx.llm.as_ref(),
        &ctx.config.llm,
        prompts::CRITIC_SYSTEM,
        &prompt,
        120,
        Some(0.0),
    )
    .await?;

    let refinements: Vec<String> = raw
        .lines()
        .map(sanitize_refinement)
        .filter(|line| !line.is_empty())
        .take(MAX_REFINEMENTS)
        .collect();

    tracing::info!(count = refinements.len(), ?refinements, "refinements proposed");
    ctx.audit.log_step(
        thread_id,
        "critic",
        "request_refinement",
        Some(confidence),
        Some(state.iterations + 1),
        Some(json!({"refinements": refinements})),
    );

    patch.refinements = Some(refinements);
    patch.iterations = Some(state.iterations + 1);
    Ok(patch)
}
