use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Content kind carried by a chunk. Multimodal chunks were embedded as the
/// re-normalized mean of a text and an image embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    PdfText,
    PdfImage,
    Image,
    Multimodal,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::PdfText => "pdf_text",
            Self::PdfImage => "pdf_image",
            Self::Image => "image",
            Self::Multimodal => "multimodal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pdf_text" => Self::PdfText,
            "pdf_image" => Self::PdfImage,
            "image" => Self::Image,
            "multimodal" => Self::Multimodal,
            _ => Self::Text,
        }
    }

    /// Whether chunks of this kind reference an image file.
    pub fn has_image(&self) -> bool {
        matches!(self, Self::PdfImage | Self::Image | Self::Multimodal)
    }
}

/// Persistent document row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub doc_id: Uuid,
    pub title: String,
    pub source_path: String,
    pub created_at: i64,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

/// Persistent chunk row. Created in one batch with its parent document,
/// read-only afterward, destroyed only by document deletion.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub section: String,
    pub text: String,
    pub is_ocr: bool,
    pub is_figure: bool,
    pub content_type: ContentType,
    pub image_path: Option<String>,
    pub embedding: Vec<f32>,
    pub meta: HashMap<String, String>,
    pub created_at: i64,
}

/// A chunk as returned by retrieval, carried by value in pipeline state.
/// Holds copies of the essential fields plus the three relevance scores,
/// never a live reference into the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub doc_id: Option<Uuid>,
    pub text: String,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub content_type: ContentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    /// Lexical (BM25) relevance; 0.0 when the lexical pool did not produce it.
    pub lex: f32,
    /// Cosine similarity to the query embedding.
    pub vec: f32,
    /// Cross-encoder rerank score; 0.0 when the reranker is unavailable.
    pub ce: f32,
    /// Dense embedding, present when the hydration round-trip succeeded.
    /// Dropped from checkpoints to keep serialized state small.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
}

impl RetrievedChunk {
    /// First 8 hex characters of the owning document id, used for citations.
    pub fn doc_prefix(&self) -> Option<String> {
        self.doc_id.map(|d| d.to_string()[..8].to_string())
    }
}

/// Final action decided for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RagAction {
    Answer,
    Clarify,
    Abstain,
}

impl Default for RagAction {
    fn default() -> Self {
        Self::Answer
    }
}

/// Per-document usage entry returned alongside the final answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocMapEntry {
    pub doc_id: Uuid,
    pub title: Option<String>,
    pub used: bool,
}

/// Result of one `ask` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskOutcome {
    pub answer: String,
    /// Display confidence as a percentage in [0, 100].
    pub confidence: f32,
    pub action: RagAction,
    pub doc_id: Option<Uuid>,
    pub doc_ids: Vec<Uuid>,
    pub doc_map: Vec<DocMapEntry>,
    pub pages: Vec<i32>,
    pub citations: Vec<String>,
}

/// Inspection report for a single document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentReport {
    pub doc_id: Uuid,
    pub title: String,
    pub source_path: String,
    pub created_at: i64,
    pub chunk_count: usize,
    pub first_page: Option<i32>,
    pub last_page: Option<i32>,
    pub content_type_counts: HashMap<String, usize>,
    pub sample_chunks: Vec<String>,
}

/// The fixed abstain phrase. Abstaining scrubs all sources and emits
/// exactly this text.
pub const ABSTAIN_ANSWER: &str = "I don't know.";

/// Sentinel answer for an empty explicit selection with cross-doc disabled.
pub const NO_DOCUMENTS_ANSWER: &str =
    "No documents are selected. Select one or more documents or enable cross-document search, then ask again.";
