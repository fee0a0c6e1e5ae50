//! Unified ingestion: parse, chunk, embed, persist.
//!
//! One document row plus all chunk rows are written as a single batch. A
//! chunk whose embedding fails is skipped and logged rather than aborting
//! the batch. Scratch space for extracted images lives in a TempDir owned
//! by the ingestion call and is removed on completion, including failure.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::embeddings::{EmbeddingModel, ImageInput};
use crate::error::{RagError, Result};
use crate::processing::{ChunkDraft, Chunker, DocumentParser};
use crate::search::TextSearch;
use crate::storage::ChunkStore;
use crate::types::{ChunkRecord, ContentType, DocumentRecord};

/// External image-decoding hook: turns an image file into the
/// preprocessed pixel tensor the vision encoder expects. Decoding itself
/// is outside the core.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path) -> Result<ImageInput>;
}

pub struct Ingestor {
    store: Arc<dyn ChunkStore>,
    text_search: Arc<TextSearch>,
    embedder: Arc<dyn EmbeddingModel>,
    parser: DocumentParser,
    chunker: Chunker,
    image_decoder: Option<Arc<dyn ImageDecoder>>,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        text_search: Arc<TextSearch>,
        embedder: Arc<dyn EmbeddingModel>,
        parser: DocumentParser,
        chunking: &ChunkingConfig,
        image_decoder: Option<Arc<dyn ImageDecoder>>,
    ) -> Self {
        Self {
            store,
            text_search,
            embedder,
            parser,
            chunker: Chunker::new(chunking.max_words, chunking.overlap_words),
            image_decoder,
        }
    }

    /// Ingest one file and return the new document id.
    pub async fn ingest(&self, path: &Path, title: Option<&str>) -> Result<Uuid> {
        let scratch = tempfile::TempDir::new()
            .map_err(|e| RagError::Ingestion(format!("failed to create scratch dir: {}", e)))?;

        let pages = self.parser.parse(path, scratch.path())?;
        let drafts = self.chunker.chunk_pages(&pages);
        if drafts.is_empty() {
            return Err(RagError::Ingestion(format!(
                "no content extracted from {}",
                path.display()
            )));
        }

        let doc_id = Uuid::new_v4();
        let now = chrono::Utc::now().timestamp();
        let mut records = Vec::with_capacity(drafts.len());
        let mut skipped = 0usize;

        // Plain text drafts go through the batch encoder in one pass;
        // image-bearing drafts (and any batch failure) take the per-chunk
        // path where a single bad chunk is skipped, never the whole batch.
        let text_only: Vec<usize> = drafts
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.content_type.has_image())
            .map(|(i, _)| i)
            .collect();
        let mut batched: HashMap<usize, Vec<f32>> = HashMap::new();
        if text_only.len() > 1 {
            let texts: Vec<&str> = text_only.iter().map(|&i| drafts[i].text.as_str()).collect();
            match self.embedder.embed_texts(&texts) {
                Ok(embeddings) if embeddings.len() == texts.len() => {
                    batched = text_only.iter().copied().zip(embeddings).collect();
                }
                Ok(_) => {
                    tracing::warn!("batch embedding returned a short result; embedding per chunk");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "batch embedding failed; embedding per chunk");
                }
            }
        }

        for (idx, draft) in drafts.into_iter().enumerate() {
            let embedded = match batched.remove(&idx) {
                Some(embedding) if !embedding.is_empty() && !draft.text.trim().is_empty() => {
                    Ok((embedding, draft.content_type))
                }
                _ => self.embed_draft(&draft),
            };
            match embedded {
                Ok((embedding, content_type)) => {
                    records.push(ChunkRecord {
                        chunk_id: Uuid::new_v4(),
                        doc_id,
                        page_start: draft.page_start,
                        page_end: draft.page_end,
                        section: String::new(),
                        text: draft.text,
                        is_ocr: draft.is_ocr,
                        is_figure: draft.is_figure,
                        content_type,
                        image_path: draft.image_path,
                        embedding,
                        meta: HashMap::new(),
                        created_at: now,
                    });
                }
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(
                        page = ?draft.page_start,
                        error = %e,
                        "chunk embedding failed; skipping chunk"
                    );
                }
            }
        }

        if records.is_empty() {
            return Err(RagError::Ingestion(format!(
                "every chunk of {} failed to embed",
                path.display()
            )));
        }

        let derived_title = title
            .map(str::to_string)
            .or_else(|| {
                path.file_stem()
                    .and_then(|s| s.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "Untitled".to_string());

        let document = DocumentRecord {
            doc_id,
            title: derived_title,
            source_path: path.display().to_string(),
            created_at: now,
            meta: HashMap::new(),
        };

        self.store.insert_document(&document, &records).await?;

        let fts_batch: Vec<(Uuid, Uuid, String)> = records
            .iter()
            .map(|r| (r.chunk_id, r.doc_id, r.text.clone()))
            .collect();
        self.text_search.index_chunks_batch(&fts_batch)?;
        self.text_search.commit()?;

        tracing::info!(
            doc_id = %doc_id,
            title = %document.title,
            chunks = records.len(),
            skipped = skipped,
            "document ingested"
        );

        // `scratch` drops here, removing extracted images even on the error
        // paths above.
        Ok(doc_id)
    }

    /// Embed one draft according to its content type. Returns the
    /// embedding and the effective content type, which may demote to a
    /// text kind when no image decoder is wired in.
    fn embed_draft(&self, draft: &ChunkDraft) -> Result<(Vec<f32>, ContentType)> {
        if draft.text.trim().is_empty() && !draft.content_type.has_image() {
            return Err(RagError::Ingestion("empty chunk text".to_string()));
        }

        match draft.content_type {
            ContentType::Text | ContentType::PdfText => {
                Ok((self.embedder.embed_text(&draft.text)?, draft.content_type))
            }
            ContentType::Multimodal | ContentType::PdfImage | ContentType::Image => {
                let image_path = draft.image_path.as_deref().ok_or_else(|| {
                    RagError::Ingestion("image-bearing chunk without an image path".to_string())
                })?;

                let Some(decoder) = &self.image_decoder else {
                    // No decoder wired in: embed the text side only and
                    // demote so the multimodal invariant stays honest.
                    tracing::warn!(
                        image = image_path,
                        "no image decoder configured; embedding chunk text only"
                    );
                    return Ok((
                        self.embedder.embed_text(&draft.text)?,
                        ContentType::PdfText,
                    ));
                };

                if !Path::new(image_path).exists() {
                    return Err(RagError::Ingestion(format!(
                        "image path not resolvable at insertion time: {}",
                        image_path
                    )));
                }

                let pixels = decoder.decode(Path::new(image_path))?;
                if draft.text.trim().is_empty() {
                    Ok((self.embedder.embed_image(&pixels)?, draft.content_type))
                } else {
                    Ok((
                        self.embedder.embed_multimodal(&draft.text, &pixels)?,
                        ContentType::Multimodal,
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::testing::MemoryStore;
    use tempfile::TempDir;

    struct StubEmbedder {
        fail_on: Option<String>,
    }

    impl EmbeddingModel for StubEmbedder {
        fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
            if let Some(marker) = &self.fail_on {
                if text.contains(marker) {
                    return Err(RagError::EmbeddingFailed("scripted failure".to_string()));
                }
            }
            Ok(vec![1.0, 0.0, 0.0])
        }

        fn embed_image(&self, _image: &ImageInput) -> Result<Vec<f32>> {
            Ok(vec![0.0, 1.0, 0.0])
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    fn ingestor(
        dir: &TempDir,
        store: Arc<MemoryStore>,
        fail_on: Option<String>,
    ) -> (Arc<TextSearch>, Ingestor) {
        let text_search = Arc::new(TextSearch::new(dir.path()).unwrap());
        let chunking = crate::config::RagConfig::default().chunking;
        let ing = Ingestor::new(
            store,
            text_search.clone(),
            Arc::new(StubEmbedder { fail_on }),
            DocumentParser::new(),
            &chunking,
            None,
        );
        (text_search, ing)
    }

    #[tokio::test]
    async fn test_ingest_text_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("report.txt");
        std::fs::write(&file, "revenue grew in the fourth quarter").unwrap();

        let store = Arc::new(MemoryStore::new());
        let (text_search, ingestor) = ingestor(&dir, store.clone(), None);

        let doc_id = ingestor.ingest(&file, Some("Report Q4")).await.unwrap();

        let doc = store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(doc.title, "Report Q4");
        assert!(store.chunk_count(Some(doc_id)).await.unwrap() > 0);
        assert!(text_search.count() > 0);
    }

    #[tokio::test]
    async fn test_title_defaults_to_file_stem() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("minutes.txt");
        std::fs::write(&file, "meeting minutes content here").unwrap();

        let store = Arc::new(MemoryStore::new());
        let (_ts, ingestor) = ingestor(&dir, store.clone(), None);

        let doc_id = ingestor.ingest(&file, None).await.unwrap();
        let doc = store.get_document(doc_id).await.unwrap().unwrap();
        assert_eq!(doc.title, "minutes");
    }

    #[tokio::test]
    async fn test_unsupported_extension_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("deck.pptx");
        std::fs::write(&file, "x").unwrap();

        let store = Arc::new(MemoryStore::new());
        let (_ts, ingestor) = ingestor(&dir, store, None);

        let err = ingestor.ingest(&file, None).await.unwrap_err();
        assert!(matches!(err, RagError::UnsupportedInput(_)));
    }

    #[tokio::test]
    async fn test_failed_chunk_embedding_skips_not_aborts() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("mixed.txt");
        // Two paragraphs; the second contains the failure marker.
        let long_a: String = (0..30).map(|i| format!("alpha{} ", i)).collect();
        let long_b: String = (0..30).map(|i| format!("POISON{} ", i)).collect();
        std::fs::write(&file, format!("{}\n\n{}", long_a.trim(), long_b.trim())).unwrap();

        let store = Arc::new(MemoryStore::new());
        let (_ts, ingestor) = ingestor(&dir, store.clone(), Some("POISON".to_string()));

        let doc_id = ingestor.ingest(&file, None).await.unwrap();
        let count = store.chunk_count(Some(doc_id)).await.unwrap();
        assert!(count >= 1);
        let chunks = store.chunks.lock();
        assert!(chunks.iter().all(|c| !c.text.contains("POISON") || c.doc_id != doc_id));
    }

    #[tokio::test]
    async fn test_all_chunks_failing_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("bad.txt");
        std::fs::write(&file, "POISON everywhere in this file").unwrap();

        let store = Arc::new(MemoryStore::new());
        let (_ts, ingestor) = ingestor(&dir, store, Some("POISON".to_string()));

        assert!(ingestor.ingest(&file, None).await.is_err());
    }
}
