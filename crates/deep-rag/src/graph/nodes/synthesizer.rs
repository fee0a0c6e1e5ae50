//! Synthesizer node: pre-LLM confidence gating, context selection, prompt
//! construction, alphabetic citation assignment, and answer assembly.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::json;
use uuid::Uuid;

use crate::confidence::score_chunks;
use crate::error::Result;
use crate::graph::prompts::{self, SynthesizerPromptParts};
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::{abstain_patch, PipelineCtx};
use crate::llm::call_llm;
use crate::types::{RagAction, RetrievedChunk};

const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Per-chunk character budget inside the prompt.
const CONTEXT_SNIPPET_CHARS: usize = 1200;

/// Preview characters in the available-chunks table.
const PREVIEW_CHARS: usize = 100;

/// Cap on documents surfaced to the prompt.
const MAX_PROMPT_DOCS: usize = 10;

/// Select context chunks while preserving retrieval order, applying the
/// per-document cap. A second pass fills remaining slots without
/// violating the cap; a final pass appends chunks without a document id.
pub(crate) fn select_context_chunks(
    evidence: &[RetrievedChunk],
    max_chunks: usize,
    per_doc: usize,
) -> Vec<RetrievedChunk> {
    if evidence.is_empty() {
        return Vec::new();
    }

    let mut context: Vec<RetrievedChunk> = Vec::new();
    let mut included: HashSet<Uuid> = HashSet::new();
    let mut per_doc_counts: HashMap<Uuid, usize> = HashMap::new();
    let mut without_doc: Vec<&RetrievedChunk> = Vec::new();

    for ev in evidence {
        if context.len() >= max_chunks {
            break;
        }
        let Some(doc_id) = ev.doc_id else {
            without_doc.push(ev);
            continue;
        };
        let count = per_doc_counts.entry(doc_id).or_insert(0);
        if *count >= per_doc {
            continue;
        }
        *count += 1;
        included.insert(ev.chunk_id);
        context.push(ev.clone());
    }

    if context.len() < max_chunks {
        for ev in evidence {
            if context.len() >= max_chunks {
                break;
            }
            if included.contains(&ev.chunk_id) {
                continue;
            }
            let Some(doc_id) = ev.doc_id else {
                included.insert(ev.chunk_id);
                context.push(ev.clone());
                continue;
            };
            let count = per_doc_counts.entry(doc_id).or_insert(0);
            if *count >= per_doc {
                continue;
            }
            *count += 1;
            included.insert(ev.chunk_id);
            context.push(ev.clone());
        }
    }

    if context.len() < max_chunks {
        for ev in without_doc {
            if context.len() >= max_chunks {
                break;
            }
            if included.insert(ev.chunk_id) {
                context.push(ev.clone());
            }
        }
    }

    context
}

/// Per-chunk contribution score as a percentage. The cross-encoder
/// dominates when it produced a positive score; otherwise the vector and
/// lexical channels blend.
pub(crate) fn chunk_confidence(chunk: &RetrievedChunk) -> f32 {
    if chunk.ce > 0.0 {
        (0.2 * chunk.lex + 0.3 * chunk.vec + 0.5 * chunk.ce) * 100.0
    } else {
        (0.4 * chunk.lex + 0.6 * chunk.vec) * 100.0
    }
}

fn format_page_range(start: Option<i32>, end: Option<i32>) -> String {
    match (start, end) {
        (Some(s), Some(e)) if e != s => format!("p{}-{}", s, e),
        (Some(s), _) => format!("p{}", s),
        (None, _) => "p?".to_string(),
    }
}

/// Build the "Documents used for analysis" lines: pages grouped by
/// (document, page), documents ranked by average contribution strength,
/// pages within a document ordered by contribution then page number.
pub(crate) fn contribution_block_lines(
    ctx_evs: &[RetrievedChunk],
    labels: &HashMap<Uuid, String>,
) -> Vec<String> {
    let mut page_confidences: HashMap<(Uuid, Option<i32>), Vec<f32>> = HashMap::new();
    for chunk in ctx_evs {
        let Some(doc_id) = chunk.doc_id else { continue };
        page_confidences
            .entry((doc_id, chunk.page_start))
            .or_default()
            .push(chunk_confidence(chunk));
    }

    let mut doc_confidences: HashMap<Uuid, Vec<f32>> = HashMap::new();
    for ((doc_id, _), confs) in &page_confidences {
        doc_confidences.entry(*doc_id).or_default().extend(confs.iter().copied());
    }

    let mut doc_avg: Vec<(Uuid, f32)> = doc_confidences
        .into_iter()
        .map(|(doc, confs)| {
            let avg = confs.iter().sum::<f32>() / confs.len().max(1) as f32;
            (doc, avg)
        })
        .collect();
    doc_avg.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let doc_rank: HashMap<Uuid, usize> = doc_avg
        .iter()
        .enumerate()
        .map(|(i, (doc, _))| (*doc, i + 1))
        .collect();

    let mut entries: Vec<(usize, f32, i32, String)> = Vec::new();
    for ((doc_id, page), confs) in &page_confidences {
        let Some(rank) = doc_rank.get(doc_id) else { continue };
        let avg = confs.iter().sum::<f32>() / confs.len().max(1) as f32;
        let label = labels
            .get(doc_id)
            .cloned()
            .unwrap_or_else(|| doc_id.to_string()[..8].to_string());
        let page_str = match page {
            Some(p) => format!("p{}", p),
            None => "p?".to_string(),
        };
        let page_sort = page.unwrap_or(999);
        entries.push((
            *rank,
            avg,
            page_sort,
            format!(
                "[{}] \"{}\" - Page: {} - (contribution strength: {:.1}%)",
                rank, label, page_str, avg
            ),
        ));
    }

    entries.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| a.2.cmp(&b.2))
    });
    entries.into_iter().map(|(_, _, _, line)| line).collect()
}

/// Assign letters A..Z to the context chunks in order.
pub(crate) fn assign_letters(
    ctx_evs: &[RetrievedChunk],
) -> (
    HashMap<String, String>,
    BTreeMap<String, String>,
    BTreeMap<String, String>,
) {
    let mut chunk_to_letter = HashMap::new();
    let mut letter_to_doc_prefix = BTreeMap::new();
    let mut letter_to_chunk = BTreeMap::new();

    for (idx, chunk) in ctx_evs.iter().take(LETTERS.len()).enumerate() {
        let letter = (LETTERS[idx] as char).to_string();
        chunk_to_letter.insert(chunk.chunk_id.to_string(), letter.clone());
        letter_to_chunk.insert(letter.clone(), chunk.chunk_id.to_string());
        if let Some(prefix) = chunk.doc_prefix() {
            letter_to_doc_prefix.insert(letter, prefix);
        }
    }

    (chunk_to_letter, letter_to_doc_prefix, letter_to_chunk)
}

fn snippet(text: &str, chars: usize) -> String {
    text.chars().take(chars).collect()
}

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    let evidence = &state.evidence;
    let rcfg = &ctx.config.retrieval;
    let ccfg = &ctx.config.confidence;

    let selected: Vec<Uuid> = state.selected_doc_ids.clone().unwrap_or_default();
    let uploaded: Vec<Uuid> = state.uploaded_doc_ids.clone().unwrap_or_default();
    let explicit_docs: HashSet<Uuid> = selected.iter().chain(uploaded.iter()).copied().collect();

    // Per-document stats over the full evidence set drive document order.
    struct DocStats {
        count: usize,
        score: f32,
        pages: Vec<(Option<i32>, Option<i32>)>,
        first_index: usize,
    }
    let mut doc_stats: HashMap<Uuid, DocStats> = HashMap::new();
    for (idx, chunk) in evidence.iter().enumerate() {
        let Some(doc_id) = chunk.doc_id else { continue };
        let stats = doc_stats.entry(doc_id).or_insert_with(|| DocStats {
            count: 0,
            score: 0.0,
            pages: Vec::new(),
            first_index: idx,
        });
        stats.count += 1;
        stats.score += 0.6 * chunk.lex + 0.4 * chunk.vec;
        if chunk.page_start.is_some() {
            let pair = (chunk.page_start, chunk.page_end);
            if !stats.pages.contains(&pair) {
                stats.pages.push(pair);
            }
        }
    }

    let ctx_evs = select_context_chunks(evidence, rcfg.max_context_chunks, rcfg.max_chunks_per_doc);
    if ctx_evs.is_empty() || doc_stats.is_empty() {
        tracing::warn!(
            evidence = evidence.len(),
            "no usable context; abstaining without an LLM call"
        );
        ctx.audit.log_step(
            thread_id,
            "synthesizer",
            "abstain_no_context",
            Some(0.0),
            Some(state.iterations),
            None,
        );
        return Ok(abstain_patch(0.0));
    }

    let mut score_order: Vec<Uuid> = doc_stats.keys().copied().collect();
    score_order.sort_by(|a, b| {
        let sa = &doc_stats[a];
        let sb = &doc_stats[b];
        sb.count
            .cmp(&sa.count)
            .then_with(|| sb.score.partial_cmp(&sa.score).unwrap_or(std::cmp::Ordering::Equal))
            .then_with(|| sa.first_index.cmp(&sb.first_index))
    });

    // Labels: document titles when the store knows them, id prefix
    // otherwise.
    let mut labels: HashMap<Uuid, String> = HashMap::new();
    for doc_id in &score_order {
        let title = ctx
            .store
            .get_document(*doc_id)
            .await?
            .map(|d| d.title)
            .filter(|t| !t.trim().is_empty());
        labels.insert(
            *doc_id,
            title.unwrap_or_else(|| doc_id.to_string()[..8].to_string()),
        );
    }

    // Explicitly selected documents lead, then score order, capped.
    let mut top_doc_ids: Vec<Uuid> = Vec::new();
    for doc in &score_order {
        if explicit_docs.contains(doc) {
            top_doc_ids.push(*doc);
        }
    }
    for doc in &score_order {
        if !top_doc_ids.contains(doc) {
            top_doc_ids.push(*doc);
            if top_doc_ids.len() >= MAX_PROMPT_DOCS {
                break;
            }
        }
    }

    // Regroup context chunks by document order for the prompt.
    let top_set: HashSet<Uuid> = top_doc_ids.iter().copied().collect();
    let mut ordered: Vec<RetrievedChunk> = Vec::new();
    for doc in &top_doc_ids {
        ordered.extend(ctx_evs.iter().filter(|c| c.doc_id == Some(*doc)).cloned());
    }
    ordered.extend(
        ctx_evs
            .iter()
            .filter(|c| c.doc_id.map_or(true, |d| !top_set.contains(&d)))
            .cloned(),
    );
    let ctx_evs = ordered;

    // Pre-LLM confidence gate. An explicit selection lowers the bar: the
    // user pointed at these documents, an ambiguous query should still
    // produce an analysis. Unscoped cross-doc search keeps the default.
    let is_explicit = !selected.is_empty() || !uploaded.is_empty() || state.doc_id.is_some();
    let threshold = if is_explicit {
        ccfg.synth_threshold_explicit
    } else {
        ccfg.synth_threshold_default
    };

    let report = score_chunks(&ctx_evs, Some(&state.question), None, ccfg);
    tracing::info!(
        confidence = format!("{:.1}", report.confidence),
        action = ?report.action,
        threshold = format!("{:.1}", threshold),
        explicit = is_explicit,
        "pre-LLM confidence gate"
    );

    if report.action == RagAction::Abstain || report.confidence < threshold {
        tracing::warn!(
            confidence = format!("{:.1}", report.confidence),
            threshold = format!("{:.1}", threshold),
            "confidence below gate; abstaining without an LLM call"
        );
        ctx.audit.log_step(
            thread_id,
            "synthesizer",
            "abstain_low_confidence",
            Some(report.confidence),
            Some(state.iterations),
            Some(json!({"threshold": threshold})),
        );
        return Ok(abstain_patch(report.confidence));
    }

    // Alphabetic citations over the context chunks.
    let (chunk_to_letter, letter_to_doc_prefix, letter_to_chunk) = assign_letters(&ctx_evs);

    let mut reference_list =
        String::from("\n\nAvailable Chunks (use alphabetic citations when referencing):\n");
    for (idx, chunk) in ctx_evs.iter().take(LETTERS.len()).enumerate() {
        let letter = LETTERS[idx] as char;
        let prefix = chunk.doc_prefix().unwrap_or_else(|| "unknown".to_string());
        let label = chunk
            .doc_id
            .and_then(|d| labels.get(&d).cloned())
            .unwrap_or_else(|| "Unknown".to_string());
        let preview = snippet(&chunk.text, PREVIEW_CHARS).replace('\n', " ");
        reference_list.push_str(&format!("[{}] {} ({}): {}...\n", letter, label, prefix, preview));
    }
    reference_list.push_str(
        "\nWhen you reference information from a chunk in your answer, use the alphabetic \
citation [A], [B], [C], etc. corresponding to the chunk letter above.\n\
Example: if discussing content from chunk [A], cite it as [A] at the end of the relevant \
sentence or paragraph.",
    );

    // Context sections, one per document cluster.
    let mut sections: Vec<String> = Vec::new();
    for doc in &top_doc_ids {
        let doc_chunks: Vec<&RetrievedChunk> =
            ctx_evs.iter().filter(|c| c.doc_id == Some(*doc)).collect();
        if doc_chunks.is_empty() {
            continue;
        }
        let label = labels.get(doc).cloned().unwrap_or_default();
        let prefix = doc.to_string()[..8].to_string();
        let body: Vec<String> = doc_chunks
            .iter()
            .map(|c| snippet(&c.text, CONTEXT_SNIPPET_CHARS))
            .collect();
        sections.push(format!("Document {} ({}):\n{}", prefix, label, body.join("\n\n")));
    }
    sections.extend(
        ctx_evs
            .iter()
            .filter(|c| c.doc_id.map_or(true, |d| !top_set.contains(&d)))
            .map(|c| snippet(&c.text, CONTEXT_SNIPPET_CHARS)),
    );
    let context = sections.join("\n\n---\n\n");

    let order_lines: Vec<String> = top_doc_ids
        .iter()
        .enumerate()
        .map(|(i, doc)| format!("{}. key terms: {}", i + 1, labels.get(doc).cloned().unwrap_or_default()))
        .collect();
    let order_block = if order_lines.is_empty() {
        String::new()
    } else {
        format!("Documents to use for your response:\n{}\n\n", order_lines.join("\n"))
    };

    // Sources format example from the first context chunks.
    let example_lines: Vec<String> = ctx_evs
        .iter()
        .take(5)
        .enumerate()
        .map(|(idx, chunk)| {
            let letter = LETTERS[idx] as char;
            let prefix = chunk.doc_prefix().unwrap_or_else(|| "unknown".to_string());
            format!("- [{}] [DOC: {}]", letter, prefix)
        })
        .collect();
    let sources_example = if example_lines.is_empty() {
        "- [A] [DOC: a1b2c3d4]".to_string()
    } else {
        example_lines.join("\n")
    };
    let citation_format = format!(
        "\n\nSources:\n{}\n\nList sources using alphabetic citations [A], [B], [C], etc. in the \
order you first mentioned them in your answer. Each letter corresponds to a chunk, followed by \
[DOC: prefix] where prefix is the 8-character document ID prefix.",
        sources_example
    );

    let parts = SynthesizerPromptParts {
        chunk_reference_list: &reference_list,
        question: &state.question,
        citation_format: &citation_format,
        order_block: &order_block,
        context: &context,
        num_documents: selected.len(),
    };
    let prompt = if prompts::is_content_request(&state.question) && selected.len() > 1 {
        prompts::synthesizer_content_multi_doc(&parts)
    } else {
        prompts::synthesizer_standard(&parts)
    };

    let ranked_lines = contribution_block_lines(&ctx_evs, &labels);

    tracing::info!(
        prompt_chars = prompt.len(),
        context_chunks = ctx_evs.len(),
        docs = top_doc_ids.len(),
        "invoking LLM for synthesis"
    );
    let llm_answer = call_llm(
        ctx.llm.as_ref(),
        &ctx.config.llm,
        prompts::SYNTHESIZER_SYSTEM,
        &prompt,
        1800,
        Some(ctx.config.llm.temperature),
    )
    .await?;

    let mut answer = llm_answer.trim().to_string();
    if !ranked_lines.is_empty() {
        answer.push_str("\n\nDocuments used for analysis (ranked by contribution strength):\n");
        answer.push_str(&ranked_lines.join("\n"));
    }

    // Citations for every candidate document; the pruner filters them to
    // the ones the answer actually referenced.
    let mut citations: Vec<String> = Vec::new();
    let mut page_numbers: Vec<i32> = Vec::new();
    for (idx, doc) in top_doc_ids.iter().enumerate() {
        let mut pages: Vec<(Option<i32>, Option<i32>)> = ctx_evs
            .iter()
            .filter(|c| c.doc_id == Some(*doc) && c.page_start.is_some())
            .map(|c| (c.page_start, c.page_end))
            .collect();
        if pages.is_empty() {
            pages = doc_stats.get(doc).map(|s| s.pages.clone()).unwrap_or_default();
        }
        pages.sort_by_key(|(s, e)| (s.unwrap_or(i32::MAX), e.unwrap_or(i32::MAX)));
        pages.dedup();

        let formatted: Vec<String> =
            pages.iter().map(|(s, e)| format_page_range(*s, *e)).collect();
        let page_str = if formatted.is_empty() {
            "p?".to_string()
        } else {
            formatted.join(", ")
        };
        citations.push(format!(
            "[{}] doc:{} {} (confidence: {:.1}%)",
            idx + 1,
            doc,
            page_str,
            report.confidence
        ));
        page_numbers.extend(pages.iter().filter_map(|(s, _)| *s));
    }
    page_numbers.sort_unstable();
    page_numbers.dedup();

    let primary_doc = state.doc_id.or_else(|| top_doc_ids.first().copied());

    ctx.audit.log_step(
        thread_id,
        "synthesizer",
        "synthesize",
        Some(report.confidence),
        Some(state.iterations),
        Some(json!({
            "doc_ids": top_doc_ids.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            "context_chunks": ctx_evs.len(),
        })),
    );

    Ok(StatePatch {
        answer: Some(answer),
        confidence: Some(report.confidence),
        action: Some(RagAction::Answer),
        doc_ids: Some(top_doc_ids),
        pages: Some(page_numbers),
        citations: Some(citations),
        chunk_to_letter: Some(chunk_to_letter),
        letter_to_doc_prefix: Some(letter_to_doc_prefix),
        letter_to_chunk: Some(letter_to_chunk),
        doc_id: Some(primary_doc),
        ..StatePatch::default()
    })
}
