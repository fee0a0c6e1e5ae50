pub mod lance_store;
pub mod vector_text;
pub mod wait;

pub use lance_store::LanceStore;
pub use wait::wait_for_chunks;

use std::collections::HashMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{ChunkRecord, ContentType, DocumentRecord};

/// A hit from the vector candidate pool: id, owning doc, and
/// `1 - cosineDistance(embedding, query)`.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub score: f32,
}

/// A fully hydrated chunk row. `embedding` is `None` when the persisted
/// vector was malformed (already logged) or absent.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub chunk_id: Uuid,
    pub doc_id: Uuid,
    pub text: String,
    pub page_start: Option<i32>,
    pub page_end: Option<i32>,
    pub section: String,
    pub is_ocr: bool,
    pub is_figure: bool,
    pub content_type: ContentType,
    pub image_path: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub meta: HashMap<String, String>,
}

/// Structure-based retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructureStrategy {
    /// Pages <= 10 only, good for document overviews.
    FirstPages,
    /// First `max` chunks across the whole document.
    AllPages,
    /// Same ordering as AllPages.
    Sequential,
}

/// Persistent chunk store. One implementation backs production (LanceDB);
/// tests use an in-memory double.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Write a document row and all its chunk rows as one unit. If the
    /// chunk batch fails the document row is compensated away so no orphan
    /// parent survives.
    async fn insert_document(&self, doc: &DocumentRecord, chunks: &[ChunkRecord]) -> Result<()>;

    /// Vector candidate pool: nearest chunks by cosine, optionally scoped
    /// to a document set or excluding one document.
    async fn vector_candidates(
        &self,
        query_emb: &[f32],
        limit: usize,
        scope: Option<&[Uuid]>,
        exclude: Option<Uuid>,
    ) -> Result<Vec<VectorHit>>;

    /// Hydration round-trip: full rows (text, pages, embedding) for the
    /// given chunk ids.
    async fn fetch_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<StoredChunk>>;

    /// Sequential chunks of one document ordered by
    /// (page_start, page_end, chunk_id).
    async fn structure_chunks(
        &self,
        doc_id: Uuid,
        max_chunks: usize,
        strategy: StructureStrategy,
    ) -> Result<Vec<StoredChunk>>;

    async fn get_document(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>>;

    async fn find_document_by_title(&self, title: &str) -> Result<Option<DocumentRecord>>;

    async fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>>;

    /// Cascade delete: the document row and every chunk row. Returns the
    /// number of chunks removed.
    async fn delete_document(&self, doc_id: Uuid) -> Result<usize>;

    async fn chunk_count(&self, doc_id: Option<Uuid>) -> Result<usize>;
}

/// In-memory store used by unit tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        pub docs: Mutex<Vec<DocumentRecord>>,
        pub chunks: Mutex<Vec<ChunkRecord>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn to_stored(c: &ChunkRecord) -> StoredChunk {
            StoredChunk {
                chunk_id: c.chunk_id,
                doc_id: c.doc_id,
                text: c.text.clone(),
                page_start: c.page_start,
                page_end: c.page_end,
                section: c.section.clone(),
                is_ocr: c.is_ocr,
                is_figure: c.is_figure,
                content_type: c.content_type,
                image_path: c.image_path.clone(),
                embedding: if c.embedding.is_empty() {
                    None
                } else {
                    Some(c.embedding.clone())
                },
                meta: c.meta.clone(),
            }
        }
    }

    #[async_trait]
    impl ChunkStore for MemoryStore {
        async fn insert_document(
            &self,
            doc: &DocumentRecord,
            chunks: &[ChunkRecord],
        ) -> Result<()> {
            self.docs.lock().push(doc.clone());
            self.chunks.lock().extend(chunks.iter().cloned());
            Ok(())
        }

        async fn vector_candidates(
            &self,
            query_emb: &[f32],
            limit: usize,
            scope: Option<&[Uuid]>,
            exclude: Option<Uuid>,
        ) -> Result<Vec<VectorHit>> {
            let mut hits: Vec<VectorHit> = self
                .chunks
                .lock()
                .iter()
                .filter(|c| scope.map_or(true, |s| s.contains(&c.doc_id)))
                .filter(|c| exclude.map_or(true, |e| c.doc_id != e))
                .filter(|c| !c.embedding.is_empty())
                .map(|c| VectorHit {
                    chunk_id: c.chunk_id,
                    doc_id: c.doc_id,
                    score: c
                        .embedding
                        .iter()
                        .zip(query_emb.iter())
                        .map(|(a, b)| a * b)
                        .sum(),
                })
                .collect();
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(limit);
            Ok(hits)
        }

        async fn fetch_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<StoredChunk>> {
            Ok(self
                .chunks
                .lock()
                .iter()
                .filter(|c| chunk_ids.contains(&c.chunk_id))
                .map(Self::to_stored)
                .collect())
        }

        async fn structure_chunks(
            &self,
            doc_id: Uuid,
            max_chunks: usize,
            strategy: StructureStrategy,
        ) -> Result<Vec<StoredChunk>> {
            let mut rows: Vec<StoredChunk> = self
                .chunks
                .lock()
                .iter()
                .filter(|c| c.doc_id == doc_id)
                .filter(|c| match strategy {
                    StructureStrategy::FirstPages => {
                        c.page_start.map_or(false, |p| p <= 10)
                    }
                    _ => true,
                })
                .map(Self::to_stored)
                .collect();
            rows.sort_by_key(|c| {
                (
                    c.page_start.unwrap_or(i32::MAX),
                    c.page_end.unwrap_or(i32::MAX),
                    c.chunk_id,
                )
            });
            rows.truncate(max_chunks);
            Ok(rows)
        }

        async fn get_document(&self, doc_id: Uuid) -> Result<Option<DocumentRecord>> {
            Ok(self.docs.lock().iter().find(|d| d.doc_id == doc_id).cloned())
        }

        async fn find_document_by_title(&self, title: &str) -> Result<Option<DocumentRecord>> {
            Ok(self.docs.lock().iter().find(|d| d.title == title).cloned())
        }

        async fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>> {
            let mut docs = self.docs.lock().clone();
            docs.sort_by_key(|d| std::cmp::Reverse(d.created_at));
            docs.truncate(limit);
            Ok(docs)
        }

        async fn delete_document(&self, doc_id: Uuid) -> Result<usize> {
            self.docs.lock().retain(|d| d.doc_id != doc_id);
            let mut chunks = self.chunks.lock();
            let before = chunks.len();
            chunks.retain(|c| c.doc_id != doc_id);
            Ok(before - chunks.len())
        }

        async fn chunk_count(&self, doc_id: Option<Uuid>) -> Result<usize> {
            Ok(self
                .chunks
                .lock()
                .iter()
                .filter(|c| doc_id.map_or(true, |d| c.doc_id == d))
                .count())
        }
    }
}
