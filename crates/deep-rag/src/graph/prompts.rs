//! Prompt assembly for the pipeline nodes.

pub const PLANNER_SYSTEM: &str = "You plan tasks.";
pub const COMPRESSOR_SYSTEM: &str = "You compress evidence.";
pub const CRITIC_SYSTEM: &str = "You suggest refinements.";
pub const SYNTHESIZER_SYSTEM: &str = "You write precise, grounded answers. Avoid speculation and \
keep sources aligned. Answer with I dont know if you cannot ground your answer.";

pub fn planner_prompt(question: &str, doc_id_hint: Option<&str>) -> String {
    let doc_context = match doc_id_hint {
        Some(prefix) => format!(
            "\n\nNote: this question is about a specific document that was just ingested. \
Document {} was used for this planning. Focus your planning on this document's content.",
            prefix
        ),
        None => String::new(),
    };
    format!(
        "You are a planner. Decompose the user's question into 1-3 concrete sub-goals \
that can be answered ONLY from the provided assets such as PDFs, images, or other documents. \
Prefer explicit nouns and constraints.\nQuestion: {}{}",
        question, doc_context
    )
}

pub fn compressor_prompt(snippets: &str) -> String {
    format!(
        "Summarize the following snippets into crisp notes with bullets.\n\
Retain numbers and proper nouns verbatim. Avoid speculation.\n\
Snippets:\n{}",
        snippets
    )
}

pub fn refinement_prompt(plan: &str, notes: &str, multi_doc: bool) -> String {
    if multi_doc {
        format!(
            "Given the plan:\n{}\nAnd notes:\n{}\n\n\
This is a multi-document query. The user wants comprehensive information from multiple documents.\n\
Propose refined sub-queries (max 2) to retrieve MORE complete evidence from the documents.\n\
Focus on:\n\
1. Retrieving more chunks from each document\n\
2. Getting document metadata (titles, types, structure)\n\
3. Extracting key content sections\n\n\
Write queries as natural language questions without special characters like &, *, |, !, :, or quotes. \
Use plain text only. For example, write \"Hygiene and DX\" instead of \"Hygiene & DX\".",
            plan, notes
        )
    } else {
        format!(
            "Given the plan:\n{}\nAnd notes:\n{}\n\n\
Propose refined sub-queries (max 2) to retrieve missing evidence. Short, 1 line each.\n\n\
IMPORTANT: Write queries as natural language questions without special characters like &, *, |, !, :, or quotes. \
Use plain text only. For example, write \"Hygiene and DX\" instead of \"Hygiene & DX\".",
            plan, notes
        )
    }
}

/// Phrases that mark a question as multi-document, steering refinement
/// toward breadth over depth.
pub const MULTI_DOC_PHRASES: &[&str] = &[
    "all documents",
    "these documents",
    "multiple documents",
    "each document",
    "contents of",
    "share the contents",
    "what documents",
];

pub fn is_multi_doc_question(question: &str) -> bool {
    let lower = question.to_lowercase();
    MULTI_DOC_PHRASES.iter().any(|p| lower.contains(p))
}

/// Phrases that mark a question as a content dump request.
pub const CONTENT_REQUEST_PHRASES: &[&str] = &[
    "share the contents",
    "what is in",
    "what are in",
    "contents of",
    "summarize these",
    "tell me about these",
    "describe these",
];

pub fn is_content_request(question: &str) -> bool {
    let lower = question.to_lowercase();
    CONTENT_REQUEST_PHRASES.iter().any(|p| lower.contains(p))
}

pub struct SynthesizerPromptParts<'a> {
    pub chunk_reference_list: &'a str,
    pub question: &'a str,
    pub citation_format: &'a str,
    pub order_block: &'a str,
    pub context: &'a str,
    pub num_documents: usize,
}

pub fn synthesizer_standard(parts: &SynthesizerPromptParts) -> String {
    format!(
        "{}\n\nAnswer the question using ONLY the context below. Cite every claim with the \
alphabetic citation of the chunk it came from.\n\nQuestion: {}\n\n{}Context:\n{}\n{}",
        parts.chunk_reference_list,
        parts.question,
        parts.order_block,
        parts.context,
        parts.citation_format
    )
}

pub fn synthesizer_content_multi_doc(parts: &SynthesizerPromptParts) -> String {
    format!(
        "{}\n\nThe user asked for the contents of {} selected documents. Describe what EACH \
document contains, one section per document, in the order given below. Use ONLY the context. \
Cite every claim with the alphabetic citation of the chunk it came from.\n\n{}Context:\n{}\n{}",
        parts.chunk_reference_list,
        parts.num_documents,
        parts.order_block,
        parts.context,
        parts.citation_format
    )
}
