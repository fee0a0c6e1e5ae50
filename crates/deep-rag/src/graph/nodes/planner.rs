//! Planner node: decomposes the question into 1-3 concrete sub-goals.

use serde_json::json;

use crate::error::Result;
use crate::graph::prompts;
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::PipelineCtx;
use crate::llm::call_llm;

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    tracing::info!(question = %state.question, doc_id = ?state.doc_id, "planning");

    let doc_hint = state.doc_id.map(|d| d.to_string()[..8].to_string());
    let prompt = prompts::planner_prompt(&state.question, doc_hint.as_deref());

    let plan = call_llm(
        ctx.llm.as_ref(),
        &ctx.config.llm,
        prompts::PLANNER_SYSTEM,
        &prompt,
        200,
        Some(0.2),
    )
    .await?;
    let plan = plan.trim().to_string();

    tracing::info!(plan = %plan, "plan generated");
    ctx.audit.log_step(
        thread_id,
        "planner",
        "plan_generation",
        None,
        Some(state.iterations),
        Some(json!({"plan_length": plan.len()})),
    );

    Ok(StatePatch {
        plan: Some(plan),
        iterations: Some(state.iterations),
        ..StatePatch::default()
    })
}
