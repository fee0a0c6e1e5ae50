//! Citation pruner node: post-synthesizer cleanup of the LLM answer.
//!
//! Detects refusals, extracts document references (bracketed DOC, bare
//! DOC, Document-word, doc-colon, alphabetic, and Sources-block forms),
//! drops documents the answer never cited, rewrites id prefixes to
//! titles, rebuilds the Sources section, and re-appends the contribution
//! block exactly as the synthesizer produced it.

use std::collections::{BTreeMap, HashMap, HashSet};

use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::{abstain_patch, PipelineCtx};
use crate::types::DocMapEntry;

static REFUSAL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^i\s+don'?t\s+know",
        r"^i\s+do\s+not\s+know",
        r"does\s+not\s+contain\s+the\s+answer",
        r"does\s+not\s+contain\s+the\s+information",
        r"does\s+not\s+provide\s+the\s+answer",
        r"no\s+answer\s+is\s+available",
        r"no\s+relevant\s+information",
        r"cannot\s+determine\s+from\s+the\s+document",
        r"cannot\s+find\s+this\s+information",
        r"not\s+provided\s+in\s+the\s+document",
        r"document\s+does\s+not\s+provide",
        r"document\s+does\s+not\s+mention",
        r"not\s+enough\s+information\s+in\s+the\s+document",
        r"context\s+does\s+not\s+contain",
        r"no\s+supportive\s+evidence\s+in\s+the\s+context",
    ]
    .iter()
    .map(|p| Regex::new(&format!("(?i){}", p)).expect("refusal pattern is valid"))
    .collect()
});

static DOC_BRACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[DOC\s+\{?([a-f0-9]{8})\}?\]").expect("bracket doc regex"));
static DOC_BARE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)DOC\s+\{?([a-f0-9]{8})\}?").expect("bare doc regex"));
static DOCUMENT_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bDocument\s+\{?([a-f0-9]{8})\}?").expect("document word regex")
});
static DOC_COLON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)doc:\s*\{?([a-f0-9]{8})\}?").expect("doc colon regex"));
static ALPHA_CITE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([A-Z])\]").expect("alpha cite regex"));
static SOURCES_DOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[DOC:\s*([a-f0-9]{8})\]").expect("sources doc regex"));
static SOURCES_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(-\s*\[([A-Z])\]\s*)\[DOC:\s*([a-f0-9]{8})\]\s*$").expect("sources line regex")
});
static CITATION_DOC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)doc:([a-f0-9-]+)").expect("citation doc regex"));

const SOURCES_MARKER: &str = "Sources:";
const ANALYSIS_MARKER: &str = "Documents used for analysis";

/// Refusal detection over the normalized answer.
pub(crate) fn is_refusal(answer: &str) -> bool {
    let normalized = answer.trim().to_lowercase();
    if normalized == "i don't know"
        || normalized == "i dont know"
        || normalized == "i do not know"
        || normalized == "i don't know."
    {
        return true;
    }
    REFUSAL_PATTERNS.iter().any(|re| re.is_match(&normalized))
}

/// Extract 8-char document prefixes from the answer body.
pub(crate) fn extract_doc_references(answer: &str) -> HashSet<String> {
    let mut refs = HashSet::new();
    for re in [&*DOC_BRACKET_RE, &*DOC_BARE_RE, &*DOCUMENT_WORD_RE, &*DOC_COLON_RE] {
        for cap in re.captures_iter(answer) {
            if let Some(m) = cap.get(1) {
                refs.insert(m.as_str().to_lowercase());
            }
        }
    }
    refs
}

/// Map 8-char prefixes back to full document ids.
pub(crate) fn match_doc_ids_by_prefix(
    refs: &HashSet<String>,
    available: &[Uuid],
) -> HashSet<Uuid> {
    available
        .iter()
        .filter(|doc| refs.contains(&doc.to_string()[..8].to_lowercase()))
        .copied()
        .collect()
}

fn replace_prefixes(
    re: &Regex,
    text: &str,
    prefix_to_title: &HashMap<String, String>,
    bracketed: bool,
) -> String {
    re.replace_all(text, |caps: &regex::Captures| {
        let prefix = caps[1].to_lowercase();
        match prefix_to_title.get(&prefix) {
            Some(title) if bracketed => format!("[{}]", title),
            Some(title) => title.clone(),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Replace document-id citations in the answer body with titles.
pub(crate) fn replace_doc_citations(
    answer: &str,
    prefix_to_title: &HashMap<String, String>,
) -> String {
    let result = replace_prefixes(&DOC_BRACKET_RE, answer, prefix_to_title, true);
    let result = replace_prefixes(&DOC_BARE_RE, &result, prefix_to_title, false);
    let result = replace_prefixes(&DOCUMENT_WORD_RE, &result, prefix_to_title, false);
    replace_prefixes(&DOC_COLON_RE, &result, prefix_to_title, false)
}

/// Keep only citations whose document was used, replacing `doc:{id}` with
/// the document title.
pub(crate) fn prune_citations(
    citations: &[String],
    used: &HashSet<Uuid>,
    titles: &HashMap<Uuid, String>,
) -> Vec<String> {
    let mut pruned = Vec::new();
    for citation in citations {
        let Some(cap) = CITATION_DOC_RE.captures(citation) else {
            continue;
        };
        let Ok(doc_id) = Uuid::parse_str(&cap[1]) else {
            continue;
        };
        if !used.contains(&doc_id) {
            continue;
        }
        match titles.get(&doc_id) {
            Some(title) => {
                pruned.push(CITATION_DOC_RE.replace(citation, title.as_str()).into_owned())
            }
            None => pruned.push(citation.clone()),
        }
    }
    pruned
}

/// Split the answer into body, Sources section, and contribution block.
/// The contribution block must survive byte-identical.
pub(crate) fn split_sections(answer: &str) -> (String, Option<String>, Option<String>) {
    let analysis_idx = answer.find(ANALYSIS_MARKER);
    let sources_idx = answer.find(SOURCES_MARKER).filter(|s| match analysis_idx {
        Some(a) => *s < a,
        None => true,
    });

    let body_end = sources_idx.or(analysis_idx).unwrap_or(answer.len());
    let body = answer[..body_end].trim_end().to_string();

    let sources = sources_idx.map(|s| {
        let end = analysis_idx.unwrap_or(answer.len());
        answer[s..end].trim_end().to_string()
    });
    let analysis = analysis_idx.map(|a| answer[a..].to_string());

    (body, sources, analysis)
}

/// Rebuild the Sources section from the LLM's alphabetic list, keeping
/// lines whose letter resolves to a used document and rewriting
/// `[DOC: prefix]` into the document title.
pub(crate) fn rebuild_sources(
    sources_text: &str,
    letter_to_doc_prefix: &BTreeMap<String, String>,
    used: &HashSet<Uuid>,
    available: &[Uuid],
    prefix_to_title: &HashMap<String, String>,
) -> Option<String> {
    let mut lines = vec![SOURCES_MARKER.to_string()];

    for raw_line in sources_text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line == SOURCES_MARKER {
            continue;
        }
        let Some(caps) = SOURCES_LINE_RE.captures(line) else {
            continue;
        };
        let letter_part = caps[1].to_string();
        let letter = caps[2].to_uppercase();
        let prefix = caps[3].to_lowercase();

        let matching_doc = available
            .iter()
            .find(|d| d.to_string()[..8].to_lowercase() == prefix)
            .copied();
        let Some(doc_id) = matching_doc else {
            continue;
        };

        let expected = letter_to_doc_prefix.get(&letter).map(|p| p.to_lowercase());
        let keep = match expected {
            // A valid letter mapping means this citation was offered to
            // the model for exactly this document.
            Some(expected_prefix) => expected_prefix == prefix,
            // No mapping: fall back to explicit body references.
            None => used.contains(&doc_id),
        };
        if !keep {
            continue;
        }

        match prefix_to_title.get(&prefix) {
            Some(title) => lines.push(format!("{}{}", letter_part, title)),
            None => lines.push(line.to_string()),
        }
    }

    if lines.len() > 1 {
        Some(lines.join("\n"))
    } else {
        None
    }
}

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    let answer = state.answer.clone();
    let confidence = state.confidence;

    // Post-LLM refusal gate: force abstain and scrub every source.
    if is_refusal(&answer) {
        tracing::warn!(
            confidence = format!("{:.1}", confidence),
            "refusal detected in answer; scrubbing sources"
        );
        ctx.audit.log_step(
            thread_id,
            "citation_pruner",
            "prune_abstain",
            Some(confidence.min(40.0)),
            Some(state.iterations),
            Some(json!({"original_doc_ids": state.doc_ids.len()})),
        );
        return Ok(abstain_patch(confidence.min(40.0)));
    }

    // Collect references: body patterns, alphabetic citations, and the
    // Sources block.
    let mut doc_refs = extract_doc_references(&answer);
    for cap in ALPHA_CITE_RE.captures_iter(&answer) {
        let letter = cap[1].to_string();
        if let Some(prefix) = state.letter_to_doc_prefix.get(&letter) {
            doc_refs.insert(prefix.to_lowercase());
        }
    }
    let (body, sources_text, analysis_text) = split_sections(&answer);
    if let Some(sources) = &sources_text {
        for cap in SOURCES_DOC_RE.captures_iter(sources) {
            doc_refs.insert(cap[1].to_lowercase());
        }
    }

    let used = match_doc_ids_by_prefix(&doc_refs, &state.doc_ids);
    if used.is_empty() {
        tracing::warn!("no document references found in answer; clearing all sources");
    }

    // Titles for every candidate document.
    let mut titles: HashMap<Uuid, String> = HashMap::new();
    let mut prefix_to_title: HashMap<String, String> = HashMap::new();
    for doc_id in &state.doc_ids {
        if let Some(doc) = ctx.store.get_document(*doc_id).await? {
            if !doc.title.trim().is_empty() {
                prefix_to_title
                    .insert(doc_id.to_string()[..8].to_lowercase(), doc.title.clone());
                titles.insert(*doc_id, doc.title);
            }
        }
    }

    // Rewrite the body, then re-attach the rebuilt Sources and the
    // preserved contribution block.
    let mut updated = replace_doc_citations(&body, &prefix_to_title);
    let pruned_citations = prune_citations(&state.citations, &used, &titles);

    let rebuilt_sources = sources_text.as_deref().and_then(|text| {
        rebuild_sources(
            text,
            &state.letter_to_doc_prefix,
            &used,
            &state.doc_ids,
            &prefix_to_title,
        )
    });

    match rebuilt_sources {
        Some(sources) => {
            updated = format!("{}\n\n{}", updated.trim_end(), sources);
        }
        None if !pruned_citations.is_empty() => {
            updated = format!(
                "{}\n\nSources: {}",
                updated.trim_end(),
                pruned_citations.join(", ")
            );
        }
        None => {}
    }

    if let Some(analysis) = analysis_text {
        updated = format!("{}\n\n{}", updated.trim_end(), analysis);
    }

    let doc_map: Vec<DocMapEntry> = state
        .doc_ids
        .iter()
        .map(|doc_id| DocMapEntry {
            doc_id: *doc_id,
            title: titles.get(doc_id).cloned(),
            used: used.contains(doc_id),
        })
        .collect();

    let primary = state.doc_id.filter(|d| used.contains(d));
    let used_vec: Vec<Uuid> = state
        .doc_ids
        .iter()
        .filter(|d| used.contains(d))
        .copied()
        .collect();

    tracing::info!(
        used = used_vec.len(),
        candidates = state.doc_ids.len(),
        citations = pruned_citations.len(),
        "citation pruning complete"
    );
    ctx.audit.log_step(
        thread_id,
        "citation_pruner",
        "prune_citations",
        Some(confidence),
        Some(state.iterations),
        Some(json!({
            "doc_refs_found": doc_refs.len(),
            "pruned_doc_ids": used_vec.len(),
        })),
    );

    Ok(StatePatch {
        answer: Some(updated),
        confidence: Some(confidence),
        action: Some(state.action),
        doc_id: Some(primary),
        doc_ids: Some(used_vec),
        pages: Some(state.pages.clone()),
        citations: Some(pruned_citations),
        doc_map: Some(doc_map),
        ..StatePatch::default()
    })
}

#[cfg(test)]
mod node_tests {
    use super::*;
    use crate::embeddings::{EmbeddingModel, ImageInput};
    use crate::graph::PipelineCtx;
    use crate::llm::LlmProvider;
    use crate::retrieval::HybridRetriever;
    use crate::search::TextSearch;
    use crate::storage::testing::MemoryStore;
    use crate::storage::ChunkStore;
    use crate::types::{DocumentRecord, RagAction};
    use async_trait::async_trait;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StubEmbedder;
    impl EmbeddingModel for StubEmbedder {
        fn embed_text(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Ok(vec![1.0])
        }
        fn embed_image(&self, _image: &ImageInput) -> crate::error::Result<Vec<f32>> {
            Ok(vec![1.0])
        }
        fn dimension(&self) -> usize {
            1
        }
    }

    struct NoopLlm;
    #[async_trait]
    impl LlmProvider for NoopLlm {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _max_tokens: usize,
            _temperature: f32,
        ) -> crate::error::Result<String> {
            Ok(String::new())
        }
    }

    async fn ctx_with_titles(titles: &[(Uuid, &str)]) -> (TempDir, Arc<PipelineCtx>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        for (doc_id, title) in titles {
            let doc = DocumentRecord {
                doc_id: *doc_id,
                title: title.to_string(),
                source_path: String::new(),
                created_at: 0,
                meta: Default::default(),
            };
            store.insert_document(&doc, &[]).await.unwrap();
        }
        let text_search = Arc::new(TextSearch::new(dir.path()).unwrap());
        let config = Arc::new(crate::config::RagConfig::default());
        let retriever = Arc::new(HybridRetriever::new(
            store.clone(),
            text_search,
            Arc::new(StubEmbedder),
            None,
            config.retrieval.clone(),
        ));
        let audit = Arc::new(crate::audit::AuditLog::new(dir.path().join("audit.jsonl")).unwrap());
        let ctx = Arc::new(PipelineCtx {
            store,
            retriever,
            llm: Arc::new(NoopLlm),
            audit,
            config,
        });
        (dir, ctx)
    }

    #[tokio::test]
    async fn test_full_prune_drops_uncited_doc_and_preserves_analysis() {
        let doc_a = Uuid::new_v4();
        let doc_b = Uuid::new_v4();
        let prefix_a = doc_a.to_string()[..8].to_string();
        let (_dir, ctx) = ctx_with_titles(&[(doc_a, "Alpha Report"), (doc_b, "Beta Notes")]).await;

        let analysis = "Documents used for analysis (ranked by contribution strength):\n\
[1] \"Alpha Report\" - Page: p2 - (contribution strength: 61.3%)";
        let mut state = PipelineState::default();
        state.question = "what did the report find?".to_string();
        state.answer = format!(
            "Finding one [A].\n\nSources:\n- [A] [DOC: {}]\n\n{}",
            prefix_a, analysis
        );
        state.confidence = 70.0;
        state.action = RagAction::Answer;
        state.doc_ids = vec![doc_a, doc_b];
        state.doc_id = Some(doc_a);
        state.pages = vec![2];
        state.citations = vec![
            format!("[1] doc:{} p2 (confidence: 70.0%)", doc_a),
            format!("[2] doc:{} p9 (confidence: 70.0%)", doc_b),
        ];
        state
            .letter_to_doc_prefix
            .insert("A".to_string(), prefix_a.clone());

        let patch = run(&ctx, &state, "t").await.unwrap();

        assert_eq!(patch.doc_ids.unwrap(), vec![doc_a]);
        assert_eq!(patch.doc_id, Some(Some(doc_a)));

        let citations = patch.citations.unwrap();
        assert_eq!(citations.len(), 1);
        assert!(citations[0].contains("Alpha Report"));

        let doc_map = patch.doc_map.unwrap();
        assert_eq!(doc_map.len(), 2);
        assert!(doc_map.iter().any(|d| d.doc_id == doc_a && d.used));
        assert!(doc_map.iter().any(|d| d.doc_id == doc_b && !d.used));

        let answer = patch.answer.unwrap();
        assert!(answer.contains("- [A] Alpha Report"));
        assert!(!answer.contains("Beta Notes"));
        // The contribution block survives byte-identical.
        assert!(answer.ends_with(analysis));
    }

    #[tokio::test]
    async fn test_full_prune_refusal_with_analysis_block_scrubs_everything() {
        let doc_a = Uuid::new_v4();
        let (_dir, ctx) = ctx_with_titles(&[(doc_a, "Alpha Report")]).await;

        let mut state = PipelineState::default();
        state.answer = "The context does not contain the requested figure.\n\n\
Documents used for analysis (ranked by contribution strength):\n\
[1] \"Alpha Report\" - Page: p1 - (contribution strength: 55.0%)"
            .to_string();
        state.confidence = 62.0;
        state.action = RagAction::Answer;
        state.doc_ids = vec![doc_a];

        let patch = run(&ctx, &state, "t").await.unwrap();
        assert_eq!(patch.answer.unwrap(), crate::types::ABSTAIN_ANSWER);
        assert_eq!(patch.action, Some(RagAction::Abstain));
        assert!(patch.doc_ids.unwrap().is_empty());
        assert!(patch.citations.unwrap().is_empty());
        assert!(patch.confidence.unwrap() <= 40.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc_with_prefix() -> (Uuid, String) {
        let id = Uuid::new_v4();
        (id, id.to_string()[..8].to_lowercase())
    }

    #[test]
    fn test_refusal_detection_exact_and_patterns() {
        assert!(is_refusal("I don't know."));
        assert!(is_refusal("I dont know"));
        assert!(is_refusal("i do not know"));
        assert!(is_refusal("The document does not contain the answer."));
        assert!(is_refusal("There is no relevant information available."));
        assert!(is_refusal("I cannot find this information anywhere."));
        assert!(!is_refusal("The revenue was 4.2 million [A]."));
    }

    #[test]
    fn test_extract_bracketed_and_bare_doc() {
        let refs = extract_doc_references("See [DOC 12ab34cd] and DOC 56ef78ab for details");
        assert!(refs.contains("12ab34cd"));
        assert!(refs.contains("56ef78ab"));
    }

    #[test]
    fn test_extract_document_word_and_colon() {
        let refs = extract_doc_references("Document 12ab34cd says X; see doc:56ef78ab too");
        assert!(refs.contains("12ab34cd"));
        assert!(refs.contains("56ef78ab"));
    }

    #[test]
    fn test_extract_is_case_insensitive() {
        let refs = extract_doc_references("see [doc 12AB34CD]");
        assert!(refs.contains("12ab34cd"));
    }

    #[test]
    fn test_documentation_word_not_matched() {
        let refs = extract_doc_references("The documentation 12ab34cd covers this");
        // "documentation" must not trigger the Document-word pattern, and
        // no other keyword applies.
        assert!(refs.is_empty());
    }

    #[test]
    fn test_match_doc_ids_by_prefix() {
        let (id_a, prefix_a) = doc_with_prefix();
        let (id_b, _) = doc_with_prefix();
        let refs: HashSet<String> = [prefix_a].into_iter().collect();
        let matched = match_doc_ids_by_prefix(&refs, &[id_a, id_b]);
        assert_eq!(matched.len(), 1);
        assert!(matched.contains(&id_a));
    }

    #[test]
    fn test_replace_doc_citations_with_titles() {
        let (_, prefix) = doc_with_prefix();
        let mut titles = HashMap::new();
        titles.insert(prefix.clone(), "Annual Report".to_string());

        let answer = format!("As stated in [DOC {}], revenue grew.", prefix);
        let replaced = replace_doc_citations(&answer, &titles);
        assert_eq!(replaced, "As stated in [Annual Report], revenue grew.");

        let answer = format!("Document {} covers this; see doc:{}.", prefix, prefix);
        let replaced = replace_doc_citations(&answer, &titles);
        assert_eq!(replaced, "Annual Report covers this; see Annual Report.");
    }

    #[test]
    fn test_replace_keeps_unknown_prefixes() {
        let titles = HashMap::new();
        let answer = "See [DOC 12ab34cd] for details.";
        assert_eq!(replace_doc_citations(answer, &titles), answer);
    }

    #[test]
    fn test_prune_citations_filters_and_retitles() {
        let (id_a, _) = doc_with_prefix();
        let (id_b, _) = doc_with_prefix();
        let citations = vec![
            format!("[1] doc:{} p4 (confidence: 72.0%)", id_a),
            format!("[2] doc:{} p1 (confidence: 72.0%)", id_b),
        ];
        let used: HashSet<Uuid> = [id_a].into_iter().collect();
        let mut titles = HashMap::new();
        titles.insert(id_a, "Kept Doc".to_string());

        let pruned = prune_citations(&citations, &used, &titles);
        assert_eq!(pruned.len(), 1);
        assert!(pruned[0].contains("Kept Doc"));
        assert!(!pruned[0].contains(&id_a.to_string()));
    }

    #[test]
    fn test_split_sections_three_parts() {
        let answer = "Body text [A].\n\nSources:\n- [A] [DOC: 12ab34cd]\n\nDocuments used for analysis (ranked by contribution strength):\n[1] \"T\" - Page: p4 - (contribution strength: 61.0%)";
        let (body, sources, analysis) = split_sections(answer);
        assert_eq!(body, "Body text [A].");
        assert!(sources.unwrap().contains("[DOC: 12ab34cd]"));
        let analysis = analysis.unwrap();
        assert!(analysis.starts_with("Documents used for analysis"));
        assert!(analysis.contains("contribution strength: 61.0%"));
    }

    #[test]
    fn test_split_sections_without_sources() {
        let answer = "Just prose.";
        let (body, sources, analysis) = split_sections(answer);
        assert_eq!(body, "Just prose.");
        assert!(sources.is_none());
        assert!(analysis.is_none());
    }

    #[test]
    fn test_rebuild_sources_keeps_used_and_retitles() {
        let (id_a, prefix_a) = doc_with_prefix();
        let (id_b, prefix_b) = doc_with_prefix();

        let sources_text = format!(
            "Sources:\n- [A] [DOC: {}]\n- [B] [DOC: {}]",
            prefix_a, prefix_b
        );
        let mut letters = BTreeMap::new();
        letters.insert("A".to_string(), prefix_a.clone());
        // [B] points at a different doc than the letter map says.
        letters.insert("B".to_string(), prefix_a.clone());

        let used: HashSet<Uuid> = [id_a].into_iter().collect();
        let mut titles = HashMap::new();
        titles.insert(prefix_a.clone(), "Report A".to_string());

        let rebuilt = rebuild_sources(&sources_text, &letters, &used, &[id_a, id_b], &titles)
            .unwrap();
        assert!(rebuilt.contains("- [A] Report A"));
        assert!(!rebuilt.contains(&prefix_b));
        assert!(!rebuilt.contains("[B]"));
    }

    #[test]
    fn test_rebuild_sources_empty_when_nothing_survives() {
        let (id_a, _) = doc_with_prefix();
        let sources_text = "Sources:\n- [A] [DOC: 99999999]";
        let rebuilt = rebuild_sources(
            sources_text,
            &BTreeMap::new(),
            &HashSet::new(),
            &[id_a],
            &HashMap::new(),
        );
        assert!(rebuilt.is_none());
    }
}
