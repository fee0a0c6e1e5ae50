pub mod chunker;
pub mod parser;

pub use chunker::{ChunkDraft, Chunker, PageItem};
pub use parser::{DocumentParser, FileKind, ImageExtractor, OcrEngine};
