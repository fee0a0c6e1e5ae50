//! Tantivy-backed lexical index over chunk text.
//!
//! The lexical pool of hybrid retrieval: BM25 scores over simple
//! (lowercased, ascii-folded) tokenization serve as `lex`. Queries are
//! parsed with conjunction-by-default so a query is a Boolean AND of its
//! tokens.

use std::collections::HashSet;
use std::path::Path;

use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{
    self, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value as TantivyValue,
    STORED, STRING,
};
use tantivy::tokenizer::{AsciiFoldingFilter, LowerCaser, RemoveLongFilter, SimpleTokenizer, TextAnalyzer};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};
use uuid::Uuid;

use crate::error::{RagError, Result};

const TOKENIZER_NAME: &str = "simple_unaccent";

pub struct TextSearch {
    index: Index,
    reader: IndexReader,
    writer: parking_lot::Mutex<IndexWriter>,
    id_field: schema::Field,
    doc_id_field: schema::Field,
    text_field: schema::Field,
}

impl TextSearch {
    /// Build the canonical schema. `id` and `doc_id` must be STRING
    /// (indexed, not tokenized) so `delete_term` and scope filters work.
    fn build_schema() -> (Schema, schema::Field, schema::Field, schema::Field) {
        let mut sb = Schema::builder();
        let text_indexing = TextFieldIndexing::default()
            .set_tokenizer(TOKENIZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions);
        let text_options = TextOptions::default().set_indexing_options(text_indexing);

        let id_field = sb.add_text_field("id", STRING | STORED);
        let doc_id_field = sb.add_text_field("doc_id", STRING | STORED);
        let text_field = sb.add_text_field("text", text_options);
        (sb.build(), id_field, doc_id_field, text_field)
    }

    fn register_tokenizer(index: &Index) {
        let analyzer = TextAnalyzer::builder(SimpleTokenizer::default())
            .filter(RemoveLongFilter::limit(40))
            .filter(LowerCaser)
            .filter(AsciiFoldingFilter)
            .build();
        index.tokenizers().register(TOKENIZER_NAME, analyzer);
    }

    pub fn new(data_dir: &Path) -> Result<Self> {
        let index_path = data_dir.join("lex_index");
        std::fs::create_dir_all(&index_path)
            .map_err(|e| RagError::TextIndex(format!("failed to create index dir: {}", e)))?;

        let (schema, id_field, doc_id_field, text_field) = Self::build_schema();

        let dir = tantivy::directory::MmapDirectory::open(&index_path)
            .map_err(|e| RagError::TextIndex(e.to_string()))?;
        let index = if Index::exists(&dir)? {
            Index::open_in_dir(&index_path)?
        } else {
            Index::create_in_dir(&index_path, schema.clone())?
        };
        Self::register_tokenizer(&index);

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e: tantivy::TantivyError| RagError::TextIndex(e.to_string()))?;

        let writer = index
            .writer(50_000_000)
            .map_err(|e| RagError::TextIndex(format!("failed to create writer: {}", e)))?;

        Ok(Self {
            index,
            reader,
            writer: parking_lot::Mutex::new(writer),
            id_field,
            doc_id_field,
            text_field,
        })
    }

    pub fn index_chunks_batch(&self, chunks: &[(Uuid, Uuid, String)]) -> Result<()> {
        let writer = self.writer.lock();
        for (chunk_id, doc_id, text) in chunks {
            writer.add_document(doc!(
                self.id_field => chunk_id.to_string(),
                self.doc_id_field => doc_id.to_string(),
                self.text_field => text.as_str(),
            ))?;
        }
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .commit()
            .map_err(|e| RagError::TextIndex(format!("commit failed: {}", e)))?;
        self.reader.reload()?;
        Ok(())
    }

    /// Search the sanitized query as a Boolean AND of its tokens.
    ///
    /// `scope` restricts hits to the given documents; `exclude` drops one
    /// document. Scoped queries over-fetch (3x) to compensate for
    /// post-filter reduction, otherwise scoped pools come back thinner than
    /// the vector pool and fusion goes asymmetric.
    pub fn search_scoped(
        &self,
        query: &str,
        limit: usize,
        scope: Option<&HashSet<Uuid>>,
        exclude: Option<Uuid>,
    ) -> Result<Vec<(Uuid, f32)>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();
        let mut parser = QueryParser::for_index(&self.index, vec![self.text_field]);
        parser.set_conjunction_by_default();

        let parsed = match parser.parse_query(query) {
            Ok(q) => q,
            Err(_) => {
                // Fall back to a fully escaped phrase-free parse.
                let escaped: String = query
                    .chars()
                    .filter(|c| c.is_alphanumeric() || c.is_whitespace())
                    .collect();
                if escaped.trim().is_empty() {
                    return Ok(Vec::new());
                }
                parser
                    .parse_query(&escaped)
                    .map_err(|e| RagError::TextIndex(format!("query parse failed: {}", e)))?
            }
        };

        let filtered = scope.is_some() || exclude.is_some();
        let fetch_limit = if filtered { limit * 3 } else { limit };
        let top_docs = searcher
            .search(&parsed, &TopDocs::with_limit(fetch_limit.max(1)))
            .map_err(|e| RagError::TextIndex(e.to_string()))?;

        let scope_strings: Option<HashSet<String>> =
            scope.map(|s| s.iter().map(|d| d.to_string()).collect());
        let exclude_string = exclude.map(|d| d.to_string());

        let mut results = Vec::with_capacity(limit);
        for (score, addr) in top_docs {
            let Ok(stored) = searcher.doc::<TantivyDocument>(addr) else {
                continue;
            };
            let doc_id = stored
                .get_first(self.doc_id_field)
                .and_then(|v| v.as_str())
                .unwrap_or("");

            if let Some(ref allowed) = scope_strings {
                if !allowed.contains(doc_id) {
                    continue;
                }
            }
            if let Some(ref excluded) = exclude_string {
                if doc_id == excluded {
                    continue;
                }
            }

            let Some(chunk_id) = stored
                .get_first(self.id_field)
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };

            results.push((chunk_id, score));
            if results.len() >= limit {
                break;
            }
        }

        Ok(results)
    }

    /// Delete every posting belonging to a document and commit immediately
    /// so subsequent searches never return the deleted chunks.
    pub fn delete_document(&self, doc_id: Uuid) -> Result<()> {
        let mut writer = self.writer.lock();
        let term = tantivy::Term::from_field_text(self.doc_id_field, &doc_id.to_string());
        writer.delete_term(term);
        writer
            .commit()
            .map_err(|e| RagError::TextIndex(format!("commit after delete failed: {}", e)))?;
        drop(writer);
        self.reader.reload()?;
        tracing::info!(doc_id = %doc_id, "deleted document from lexical index");
        Ok(())
    }

    pub fn count(&self) -> usize {
        self.reader.searcher().num_docs() as usize
    }
}
