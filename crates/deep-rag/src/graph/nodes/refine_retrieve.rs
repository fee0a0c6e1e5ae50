//! Refine-retrieve node: runs the critic's refined sub-queries with wider
//! pools and merges the hits into evidence.

use std::collections::HashSet;

use serde_json::json;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::PipelineCtx;
use crate::retrieval::RetrieveRequest;
use crate::types::RetrievedChunk;

/// Coverage below which the hybrid path supplements with cross-document
/// retrieval.
const HYBRID_COVERAGE_TARGET: usize = 12;

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    if state.refinements.is_empty() {
        tracing::info!("no refinements pending; skipping");
        return Ok(StatePatch::default());
    }

    let agent_cfg = &ctx.config.agent;
    let rcfg = &ctx.config.retrieval;
    let scope = state.scope_docs();
    let cross_doc = state.cross_doc;
    let scope_set: HashSet<Uuid> = scope.iter().copied().collect();

    tracing::info!(
        refinements = state.refinements.len(),
        scope = scope.len(),
        cross_doc,
        "refinement retrieval"
    );

    let mut hits_all: Vec<RetrievedChunk> = Vec::new();
    let mut doc_ids_found: HashSet<Uuid> = state.doc_ids.iter().copied().collect();

    for refinement in &state.refinements {
        let mut hits: Vec<RetrievedChunk> = Vec::new();

        if !scope.is_empty() {
            for doc in &scope {
                let mut req = RetrieveRequest::new(refinement.clone(), rcfg);
                req.k = agent_cfg.refine_k;
                req.k_lex = agent_cfg.refine_k_lex;
                req.k_vec = agent_cfg.refine_k_vec;
                req.doc_id = Some(*doc);
                req.cross_doc = false;
                hits.extend(ctx.retriever.retrieve(&req).await?);
            }

            if cross_doc && hits.len() < HYBRID_COVERAGE_TARGET {
                // Thin scope coverage: widen to the complement of scope.
                let mut req = RetrieveRequest::new(refinement.clone(), rcfg);
                req.k = agent_cfg.refine_k;
                req.k_lex = agent_cfg.refine_k_lex;
                req.k_vec = agent_cfg.refine_k_vec;
                req.cross_doc = true;
                let cross_hits = ctx.retriever.retrieve(&req).await?;
                let before = hits.len();
                hits.extend(
                    cross_hits
                        .into_iter()
                        .filter(|h| h.doc_id.map_or(true, |d| !scope_set.contains(&d))),
                );
                tracing::info!(
                    added = hits.len() - before,
                    "supplemented refinement with cross-document hits"
                );
            } else if !cross_doc {
                hits.retain(|h| h.doc_id.map_or(false, |d| scope_set.contains(&d)));
            }
        } else {
            let mut req = RetrieveRequest::new(refinement.clone(), rcfg);
            req.k = agent_cfg.refine_k;
            req.k_lex = agent_cfg.refine_k_lex;
            req.k_vec = agent_cfg.refine_k_vec;
            req.cross_doc = cross_doc;
            hits = ctx.retriever.retrieve(&req).await?;
        }

        tracing::info!(refinement = %refinement, found = hits.len(), "refinement query done");
        ctx.audit.log_step(
            thread_id,
            "refine_retrieve",
            "refine_query",
            None,
            Some(state.iterations),
            Some(json!({"query": refinement, "num_chunks": hits.len()})),
        );

        for hit in &hits {
            if let Some(doc) = hit.doc_id {
                doc_ids_found.insert(doc);
            }
        }
        hits_all.extend(hits);
    }

    // Merge into existing evidence, dedup by chunk id; evidence never
    // shrinks across refinement rounds.
    let mut seen: HashSet<Uuid> = HashSet::new();
    let merged: Vec<RetrievedChunk> = state
        .evidence
        .iter()
        .cloned()
        .chain(hits_all.into_iter())
        .filter(|c| seen.insert(c.chunk_id))
        .collect();

    tracing::info!(total = merged.len(), "evidence after refinement merge");
    ctx.audit.log_step(
        thread_id,
        "refine_retrieve",
        "merge_results",
        None,
        Some(state.iterations),
        Some(json!({"total_after_merge": merged.len()})),
    );

    Ok(StatePatch {
        evidence: Some(merged),
        doc_ids: Some(doc_ids_found.into_iter().collect()),
        ..StatePatch::default()
    })
}
