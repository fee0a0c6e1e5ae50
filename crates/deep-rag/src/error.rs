//! Error types for the retrieval engine and agent pipeline.
//!
//! Every failure surfaced by the core is one of the tagged kinds below;
//! sentinels like "no documents selected" or a low-confidence abstain are
//! ordinary pipeline outcomes, not errors.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, RagError>;

#[derive(Error, Debug)]
pub enum RagError {
    /// The chunk store could not be reached (connection-level failure).
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store query or write failed.
    #[error("store error: {0}")]
    Store(String),

    /// The embedding model failed after all truncation retries.
    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    /// A persisted vector could not be parsed. Never silently substituted;
    /// the affected chunk is excluded from ranking and the incident logged.
    #[error("vector parse error: {0}")]
    VectorParse(String),

    /// The LLM provider failed after the retry budget was exhausted.
    #[error("LLM unavailable: {0}")]
    LlmUnavailable(String),

    /// Unsupported file type handed to ingestion.
    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    /// Full-text index failure.
    #[error("text index error: {0}")]
    TextIndex(String),

    /// Configuration is invalid or incomplete.
    #[error("configuration error: {0}")]
    Config(String),

    /// Checkpoint load/save failure.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Document parsing failure during ingestion.
    #[error("ingestion error: {0}")]
    Ingestion(String),

    /// Generic I/O wrapper.
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        Self::Checkpoint(err.to_string())
    }
}

impl From<tantivy::TantivyError> for RagError {
    fn from(err: tantivy::TantivyError) -> Self {
        Self::TextIndex(err.to_string())
    }
}

impl From<tantivy::directory::error::OpenReadError> for RagError {
    fn from(err: tantivy::directory::error::OpenReadError) -> Self {
        Self::TextIndex(err.to_string())
    }
}
