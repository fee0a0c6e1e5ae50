//! Compressor node: summarizes the evidence into concise notes.

use serde_json::json;

use crate::error::Result;
use crate::graph::prompts;
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::PipelineCtx;
use crate::llm::call_llm;

/// Per-chunk character budget feeding the summary prompt.
const SNIPPET_CHARS: usize = 1200;

fn page_label(start: Option<i32>, end: Option<i32>) -> String {
    match (start, end) {
        (Some(s), Some(e)) => format!("p{}–{}", s, e),
        (Some(s), None) => format!("p{}", s),
        _ => "p?".to_string(),
    }
}

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    let evidence = &state.evidence;
    if evidence.is_empty() {
        tracing::info!("no evidence to compress");
        return Ok(StatePatch {
            notes: Some(String::new()),
            ..StatePatch::default()
        });
    }

    tracing::info!(chunks = evidence.len(), "compressing evidence into notes");

    let snippets: Vec<String> = evidence
        .iter()
        .map(|h| {
            let text: String = h.text.chars().take(SNIPPET_CHARS).collect();
            format!("[{}] {}", page_label(h.page_start, h.page_end), text)
        })
        .collect();
    let prompt = prompts::compressor_prompt(&snippets.join("\n\n"));

    let notes = call_llm(
        ctx.llm.as_ref(),
        &ctx.config.llm,
        prompts::COMPRESSOR_SYSTEM,
        &prompt,
        400,
        Some(0.1),
    )
    .await?;
    let notes = notes.trim().to_string();

    ctx.audit.log_step(
        thread_id,
        "compressor",
        "compress",
        None,
        Some(state.iterations),
        Some(json!({
            "num_chunks": evidence.len(),
            "notes_length": notes.len(),
        })),
    );

    Ok(StatePatch {
        notes: Some(notes),
        ..StatePatch::default()
    })
}
