//! LanceDB-backed chunk store.
//!
//! Two tables: `documents` (one row per ingested file) and `chunks` (the
//! retrieval units with their dense embeddings). Vector candidates come
//! from LanceDB cosine ANN; scoping and cascade deletion use SQL
//! predicates on the stored doc id.

use std::collections::HashMap;
use std::sync::Arc;

use arrow_array::{
    Array, BooleanArray, FixedSizeListArray, Float32Array, Int32Array, Int64Array, RecordBatch,
    RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use super::{vector_text, ChunkStore, StoredChunk, StructureStrategy, VectorHit};
use crate::error::{RagError, Result};
use crate::types::{ChunkRecord, ContentType, DocumentRecord};

const DOCUMENTS_TABLE: &str = "documents";
const CHUNKS_TABLE: &str = "chunks";
const SEED_ID: &str = "__seed__";

pub struct LanceStore {
    db: lancedb::Connection,
    dimension: usize,
}

fn store_err(e: impl std::fmt::Display) -> RagError {
    RagError::Store(e.to_string())
}

fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

impl LanceStore {
    pub async fn new(path: &str, dimension: usize) -> Result<Self> {
        std::fs::create_dir_all(path).ok();
        let db = lancedb::connect(path)
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(e.to_string()))?;

        let store = Self { db, dimension };
        store.ensure_tables().await?;
        Ok(store)
    }

    fn documents_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("title", DataType::Utf8, false),
            Field::new("source_path", DataType::Utf8, false),
            Field::new("created_at", DataType::Int64, false),
            Field::new("meta_json", DataType::Utf8, false),
        ]))
    }

    fn chunks_schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Utf8, false),
            Field::new("page_start", DataType::Int32, true),
            Field::new("page_end", DataType::Int32, true),
            Field::new("section", DataType::Utf8, false),
            Field::new("text", DataType::Utf8, false),
            Field::new("is_ocr", DataType::Boolean, false),
            Field::new("is_figure", DataType::Boolean, false),
            Field::new("content_type", DataType::Utf8, false),
            Field::new("image_path", DataType::Utf8, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
            Field::new("meta_json", DataType::Utf8, false),
            Field::new("created_at", DataType::Int64, false),
        ]))
    }

    fn vector_array(&self, vectors: &[&[f32]]) -> FixedSizeListArray {
        let flat: Vec<f32> = vectors.iter().flat_map(|v| v.iter().copied()).collect();
        let values = Float32Array::from(flat);
        FixedSizeListArray::new(
            Arc::new(Field::new("item", DataType::Float32, true)),
            self.dimension as i32,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
    }

    async fn ensure_tables(&self) -> Result<()> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(e.to_string()))?;

        if !names.contains(&DOCUMENTS_TABLE.to_string()) {
            let schema = Self::documents_schema();
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(vec![SEED_ID])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(Int64Array::from(vec![0i64])),
                    Arc::new(StringArray::from(vec!["{}"])),
                ],
            )
            .map_err(store_err)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(DOCUMENTS_TABLE, Box::new(batches))
                .execute()
                .await
                .map_err(store_err)?;
            let table = self.open(DOCUMENTS_TABLE).await?;
            table.delete(&format!("id = '{}'", SEED_ID)).await.ok();
        }

        if !names.contains(&CHUNKS_TABLE.to_string()) {
            let schema = self.chunks_schema();
            let seed_vec = vec![0.0f32; self.dimension];
            let vector_array = self.vector_array(&[&seed_vec]);
            let batch = RecordBatch::try_new(
                schema.clone(),
                vec![
                    Arc::new(StringArray::from(vec![SEED_ID])) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec![SEED_ID])),
                    Arc::new(Int32Array::from(vec![None::<i32>])),
                    Arc::new(Int32Array::from(vec![None::<i32>])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(BooleanArray::from(vec![false])),
                    Arc::new(BooleanArray::from(vec![false])),
                    Arc::new(StringArray::from(vec!["text"])),
                    Arc::new(StringArray::from(vec![""])),
                    Arc::new(vector_array) as Arc<dyn Array>,
                    Arc::new(StringArray::from(vec!["{}"])),
                    Arc::new(Int64Array::from(vec![0i64])),
                ],
            )
            .map_err(store_err)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            self.db
                .create_table(CHUNKS_TABLE, Box::new(batches))
                .execute()
                .await
                .map_err(store_err)?;
            let table = self.open(CHUNKS_TABLE).await?;
            table.delete(&format!("id = '{}'", SEED_ID)).await.ok();
        }

        Ok(())
    }

    async fn open(&self, name: &str) -> Result<lancedb::Table> {
        self.db
            .open_table(name)
            .execute()
            .await
            .map_err(|e| RagError::StoreUnavailable(e.to_string()))
    }

    async fn collect_batches<E>(
        results: impl futures::Stream<Item = std::result::Result<RecordBatch, E>>,
    ) -> Result<Vec<RecordBatch>>
    where
        E: std::fmt::Display,
    {
        futures::TryStreamExt::try_collect(results)
            .await
            .map_err(store_err)
    }

    fn extract_documents(batches: &[RecordBatch]) -> Vec<DocumentRecord> {
        let mut docs = Vec::new();
        for batch in batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let titles = batch
                .column_by_name("title")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let sources = batch
                .column_by_name("source_path")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let created = batch
                .column_by_name("created_at")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
            let metas = batch
                .column_by_name("meta_json")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());

            let (Some(ids), Some(titles), Some(sources)) = (ids, titles, sources) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                let Ok(doc_id) = Uuid::parse_str(ids.value(i)) else {
                    continue;
                };
                let meta: HashMap<String, String> = metas
                    .map(|m| serde_json::from_str(m.value(i)).unwrap_or_default())
                    .unwrap_or_default();
                docs.push(DocumentRecord {
                    doc_id,
                    title: titles.value(i).to_string(),
                    source_path: sources.value(i).to_string(),
                    created_at: created.map(|c| c.value(i)).unwrap_or(0),
                    meta,
                });
            }
        }
        docs
    }

    fn extract_chunks(&self, batches: &[RecordBatch]) -> Vec<StoredChunk> {
        let mut rows = Vec::new();
        for batch in batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let doc_ids = batch
                .column_by_name("doc_id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let texts = batch
                .column_by_name("text")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let page_starts = batch
                .column_by_name("page_start")
                .and_then(|c| c.as_any().downcast_ref::<Int32Array>());
            let page_ends = batch
                .column_by_name("page_end")
                .and_then(|c| c.as_any().downcast_ref::<Int32Array>());
            let sections = batch
                .column_by_name("section")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let is_ocrs = batch
                .column_by_name("is_ocr")
                .and_then(|c| c.as_any().downcast_ref::<BooleanArray>());
            let is_figures = batch
                .column_by_name("is_figure")
                .and_then(|c| c.as_any().downcast_ref::<BooleanArray>());
            let content_types = batch
                .column_by_name("content_type")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let image_paths = batch
                .column_by_name("image_path")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let vectors = batch
                .column_by_name("vector")
                .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>());
            let metas = batch
                .column_by_name("meta_json")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());

            let (Some(ids), Some(doc_ids), Some(texts)) = (ids, doc_ids, texts) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                let (Ok(chunk_id), Ok(doc_id)) =
                    (Uuid::parse_str(ids.value(i)), Uuid::parse_str(doc_ids.value(i)))
                else {
                    continue;
                };

                let meta: HashMap<String, String> = metas
                    .map(|m| serde_json::from_str(m.value(i)).unwrap_or_default())
                    .unwrap_or_default();

                let embedding = self.read_embedding(vectors, i, &meta, chunk_id);

                let opt_i32 = |arr: Option<&Int32Array>| {
                    arr.and_then(|a| if a.is_null(i) { None } else { Some(a.value(i)) })
                };

                let image_path = image_paths
                    .map(|p| p.value(i).to_string())
                    .filter(|p| !p.is_empty());

                rows.push(StoredChunk {
                    chunk_id,
                    doc_id,
                    text: texts.value(i).to_string(),
                    page_start: opt_i32(page_starts),
                    page_end: opt_i32(page_ends),
                    section: sections.map(|s| s.value(i).to_string()).unwrap_or_default(),
                    is_ocr: is_ocrs.map(|a| a.value(i)).unwrap_or(false),
                    is_figure: is_figures.map(|a| a.value(i)).unwrap_or(false),
                    content_type: content_types
                        .map(|c| ContentType::parse(c.value(i)))
                        .unwrap_or(ContentType::Text),
                    image_path,
                    embedding,
                    meta,
                });
            }
        }
        rows
    }

    /// Read the embedding for one row: the vector column when present,
    /// otherwise the legacy text vector in `meta_json["emb"]`. A malformed
    /// legacy vector is excluded and logged, never substituted.
    fn read_embedding(
        &self,
        vectors: Option<&FixedSizeListArray>,
        row: usize,
        meta: &HashMap<String, String>,
        chunk_id: Uuid,
    ) -> Option<Vec<f32>> {
        if let Some(arr) = vectors {
            if !arr.is_null(row) {
                let values = arr.value(row);
                if let Some(floats) = values.as_any().downcast_ref::<Float32Array>() {
                    if floats.len() == self.dimension {
                        return Some(floats.values().to_vec());
                    }
                    tracing::warn!(
                        chunk_id = %chunk_id,
                        got = floats.len(),
                        expected = self.dimension,
                        "stored vector has wrong dimension; excluding chunk from ranking"
                    );
                    return None;
                }
            }
        }

        let raw = meta.get("emb")?;
        match vector_text::parse_vector_checked(raw, self.dimension) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(
                    chunk_id = %chunk_id,
                    error = %e,
                    "legacy text vector unparseable; excluding chunk from ranking"
                );
                None
            }
        }
    }

    fn scope_predicate(scope: Option<&[Uuid]>, exclude: Option<Uuid>) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(docs) = scope {
            if docs.is_empty() {
                // An empty scope matches nothing.
                return Some("doc_id = ''".to_string());
            }
            let list: Vec<String> = docs.iter().map(|d| format!("'{}'", d)).collect();
            parts.push(format!("doc_id IN ({})", list.join(", ")));
        }
        if let Some(doc) = exclude {
            parts.push(format!("doc_id != '{}'", doc));
        }
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" AND "))
        }
    }
}

#[async_trait]
impl ChunkStore for LanceStore {
    async fn insert_document(&self, doc: &DocumentRecord, chunks: &[ChunkRecord]) -> Result<()> {
        for chunk in chunks {
            if chunk.embedding.len() != self.dimension {
                return Err(RagError::Store(format!(
                    "chunk {} embedding has {} dimensions, store expects {}",
                    chunk.chunk_id,
                    chunk.embedding.len(),
                    self.dimension
                )));
            }
            if chunk.text.is_empty() {
                return Err(RagError::Store(format!(
                    "chunk {} has empty text",
                    chunk.chunk_id
                )));
            }
        }

        let doc_table = self.open(DOCUMENTS_TABLE).await?;
        let doc_schema = Self::documents_schema();
        let meta_json = serde_json::to_string(&doc.meta).unwrap_or_else(|_| "{}".to_string());
        let doc_batch = RecordBatch::try_new(
            doc_schema.clone(),
            vec![
                Arc::new(StringArray::from(vec![doc.doc_id.to_string()])) as Arc<dyn Array>,
                Arc::new(StringArray::from(vec![doc.title.as_str()])),
                Arc::new(StringArray::from(vec![doc.source_path.as_str()])),
                Arc::new(Int64Array::from(vec![doc.created_at])),
                Arc::new(StringArray::from(vec![meta_json.as_str()])),
            ],
        )
        .map_err(store_err)?;
        doc_table
            .add(Box::new(RecordBatchIterator::new(vec![Ok(doc_batch)], doc_schema)))
            .execute()
            .await
            .map_err(store_err)?;

        if chunks.is_empty() {
            return Ok(());
        }

        let result = self.append_chunks(chunks).await;
        if let Err(e) = result {
            // Compensate: the document row must not survive without chunks.
            doc_table
                .delete(&format!("id = '{}'", doc.doc_id))
                .await
                .ok();
            return Err(e);
        }

        tracing::info!(
            doc_id = %doc.doc_id,
            title = %doc.title,
            chunks = chunks.len(),
            "document inserted"
        );
        Ok(())
    }

    async fn vector_candidates(
        &self,
        query_emb: &[f32],
        limit: usize,
        scope: Option<&[Uuid]>,
        exclude: Option<Uuid>,
    ) -> Result<Vec<VectorHit>> {
        if query_emb.len() != self.dimension {
            return Err(RagError::Store(format!(
                "query embedding has {} dimensions, store expects {}",
                query_emb.len(),
                self.dimension
            )));
        }

        let table = self.open(CHUNKS_TABLE).await?;
        let mut query = table
            .query()
            .nearest_to(query_emb)
            .map_err(store_err)?
            .distance_type(lancedb::DistanceType::Cosine)
            .limit(limit);
        if let Some(predicate) = Self::scope_predicate(scope, exclude) {
            query = query.only_if(predicate);
        }

        let results = query.execute().await.map_err(store_err)?;
        let batches = Self::collect_batches(results).await?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = batch
                .column_by_name("id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let doc_ids = batch
                .column_by_name("doc_id")
                .and_then(|c| c.as_any().downcast_ref::<StringArray>());
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

            let (Some(ids), Some(doc_ids), Some(distances)) = (ids, doc_ids, distances) else {
                continue;
            };

            for i in 0..batch.num_rows() {
                let (Ok(chunk_id), Ok(doc_id)) =
                    (Uuid::parse_str(ids.value(i)), Uuid::parse_str(doc_ids.value(i)))
                else {
                    continue;
                };
                hits.push(VectorHit {
                    chunk_id,
                    doc_id,
                    score: 1.0 - distances.value(i),
                });
            }
        }
        Ok(hits)
    }

    async fn fetch_chunks(&self, chunk_ids: &[Uuid]) -> Result<Vec<StoredChunk>> {
        if chunk_ids.is_empty() {
            return Ok(Vec::new());
        }

        let table = self.open(CHUNKS_TABLE).await?;
        let mut all = Vec::new();

        // Batched predicates keep the SQL short for large candidate sets.
        for batch_ids in chunk_ids.chunks(50) {
            let list: Vec<String> = batch_ids.iter().map(|id| format!("'{}'", id)).collect();
            let predicate = format!("id IN ({})", list.join(", "));
            let results = table
                .query()
                .only_if(predicate)
                .execute()
                .await
                .map_err(store_err)?;
            let batches = Self::collect_batches(results).await?;
            all.extend(self.extract_chunks(&batches));
        }
        Ok(all)
    }

    async fn structure_chunks(
        &self,
        doc_id: Uuid,
        max_chunks: usize,
        strategy: StructureStrategy,
    ) -> Result<Vec<StoredChunk>> {
        let table = self.open(CHUNKS_TABLE).await?;
        let mut predicate = format!("doc_id = '{}'", doc_id);
        if strategy == StructureStrategy::FirstPages {
            predicate.push_str(" AND page_start IS NOT NULL AND page_start <= 10");
        }

        let results = table
            .query()
            .only_if(predicate)
            .execute()
            .await
            .map_err(store_err)?;
        let batches = Self::collect_batches(results).await?;

        let mut rows = self.extract_chunks(&batches);
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
        let table = self.open(DOCUMENTS_TABLE).await?;
        let results = table
            .query()
            .only_if(format!("id = '{}'", doc_id))
            .limit(1)
            .execute()
            .await
            .map_err(store_err)?;
        let batches = Self::collect_batches(results).await?;
        Ok(Self::extract_documents(&batches).into_iter().next())
    }

    async fn find_document_by_title(&self, title: &str) -> Result<Option<DocumentRecord>> {
        let table = self.open(DOCUMENTS_TABLE).await?;
        let results = table
            .query()
            .only_if(format!("title = '{}'", quote(title)))
            .limit(1)
            .execute()
            .await
            .map_err(store_err)?;
        let batches = Self::collect_batches(results).await?;
        Ok(Self::extract_documents(&batches).into_iter().next())
    }

    async fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>> {
        let table = self.open(DOCUMENTS_TABLE).await?;
        let results = table.query().execute().await.map_err(store_err)?;
        let batches = Self::collect_batches(results).await?;
        let mut docs = Self::extract_documents(&batches);
        docs.sort_by_key(|d| std::cmp::Reverse(d.created_at));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn delete_document(&self, doc_id: Uuid) -> Result<usize> {
        let chunks_table = self.open(CHUNKS_TABLE).await?;
        let before = chunks_table.count_rows(None).await.unwrap_or(0);
        chunks_table
            .delete(&format!("doc_id = '{}'", doc_id))
            .await
            .map_err(store_err)?;
        let after = chunks_table.count_rows(None).await.unwrap_or(0);

        let doc_table = self.open(DOCUMENTS_TABLE).await?;
        doc_table
            .delete(&format!("id = '{}'", doc_id))
            .await
            .map_err(store_err)?;

        let removed = before.saturating_sub(after);
        tracing::info!(doc_id = %doc_id, chunks = removed, "document deleted");
        Ok(removed)
    }

    async fn chunk_count(&self, doc_id: Option<Uuid>) -> Result<usize> {
        let table = self.open(CHUNKS_TABLE).await?;
        let filter = doc_id.map(|d| format!("doc_id = '{}'", d));
        table.count_rows(filter).await.map_err(store_err)
    }
}

impl LanceStore {
    async fn append_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        let table = self.open(CHUNKS_TABLE).await?;
        let schema = self.chunks_schema();

        let ids: Vec<String> = chunks.iter().map(|c| c.chunk_id.to_string()).collect();
        let doc_ids: Vec<String> = chunks.iter().map(|c| c.doc_id.to_string()).collect();
        let page_starts: Vec<Option<i32>> = chunks.iter().map(|c| c.page_start).collect();
        let page_ends: Vec<Option<i32>> = chunks.iter().map(|c| c.page_end).collect();
        let sections: Vec<&str> = chunks.iter().map(|c| c.section.as_str()).collect();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        let is_ocrs: Vec<bool> = chunks.iter().map(|c| c.is_ocr).collect();
        let is_figures: Vec<bool> = chunks.iter().map(|c| c.is_figure).collect();
        let content_types: Vec<&str> = chunks.iter().map(|c| c.content_type.as_str()).collect();
        let image_paths: Vec<&str> = chunks
            .iter()
            .map(|c| c.image_path.as_deref().unwrap_or(""))
            .collect();
        let metas: Vec<String> = chunks
            .iter()
            .map(|c| serde_json::to_string(&c.meta).unwrap_or_else(|_| "{}".to_string()))
            .collect();
        let created: Vec<i64> = chunks.iter().map(|c| c.created_at).collect();
        let vectors: Vec<&[f32]> = chunks.iter().map(|c| c.embedding.as_slice()).collect();

        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let doc_id_refs: Vec<&str> = doc_ids.iter().map(String::as_str).collect();
        let meta_refs: Vec<&str> = metas.iter().map(String::as_str).collect();

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(id_refs)) as Arc<dyn Array>,
                Arc::new(StringArray::from(doc_id_refs)),
                Arc::new(Int32Array::from(page_starts)),
                Arc::new(Int32Array::from(page_ends)),
                Arc::new(StringArray::from(sections)),
                Arc::new(StringArray::from(texts)),
                Arc::new(BooleanArray::from(is_ocrs)),
                Arc::new(BooleanArray::from(is_figures)),
                Arc::new(StringArray::from(content_types)),
                Arc::new(StringArray::from(image_paths)),
                Arc::new(self.vector_array(&vectors)) as Arc<dyn Array>,
                Arc::new(StringArray::from(meta_refs)),
                Arc::new(Int64Array::from(created)),
            ],
        )
        .map_err(store_err)?;

        table
            .add(Box::new(RecordBatchIterator::new(vec![Ok(batch)], schema)))
            .execute()
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
