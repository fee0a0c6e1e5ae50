//! Engine facade: wires the store, indexes, models, and pipeline together
//! and exposes the public operations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use uuid::Uuid;

use crate::audit::AuditLog;
use crate::config::RagConfig;
use crate::embeddings::{ClipConfig, ClipEmbeddings, EmbeddingModel};
use crate::error::{RagError, Result};
use crate::graph::{AskScope, CheckpointStore, GraphRunner, PipelineCtx};
use crate::ingestion::{ImageDecoder, Ingestor};
use crate::llm::{provider_from_config, LlmProvider};
use crate::processing::DocumentParser;
use crate::reranking::{CrossEncoderReranker, Reranker};
use crate::retrieval::{HybridRetriever, RetrieveRequest};
use crate::search::TextSearch;
use crate::storage::{ChunkStore, LanceStore, StructureStrategy};
use crate::types::{AskOutcome, DocumentRecord, DocumentReport, RetrievedChunk};

pub struct RagEngine {
    config: Arc<RagConfig>,
    store: Arc<dyn ChunkStore>,
    text_search: Arc<TextSearch>,
    embedder: Arc<dyn EmbeddingModel>,
    retriever: Arc<HybridRetriever>,
    ingestor: Ingestor,
    runner: GraphRunner,
}

impl RagEngine {
    /// Construct the engine. The embedding model is a process singleton
    /// whose first initialization runs a self-test; a self-test failure is
    /// terminal. The reranker is optional and its absence only logged.
    pub async fn new(config: RagConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).ok();
        let config = Arc::new(config);

        let lance_path = config.data_dir.join("lance_data");
        let store: Arc<dyn ChunkStore> = Arc::new(
            LanceStore::new(
                lance_path.to_str().unwrap_or("./lance_data"),
                config.embedding.dimension,
            )
            .await?,
        );

        let text_search = Arc::new(TextSearch::new(&config.data_dir)?);

        let clip_config = ClipConfig::from_model_dir(
            &config.embedding.model_dir,
            config.embedding.dimension,
            config.embedding.max_tokens,
        )
        .ok_or_else(|| {
            RagError::EmbeddingFailed(format!(
                "embedding model not found under {}",
                config.embedding.model_dir.display()
            ))
        })?;
        let embedder: Arc<dyn EmbeddingModel> = ClipEmbeddings::global(&clip_config)?;

        let reranker: Option<Arc<dyn Reranker>> = if config.embedding.enable_reranker {
            let reranker_dir = config.embedding.model_dir.join("bge-reranker-base");
            match CrossEncoderReranker::global(&reranker_dir) {
                Ok(r) => {
                    tracing::info!(dir = %reranker_dir.display(), "cross-encoder reranker loaded");
                    Some(r)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reranker unavailable; continuing without reranking");
                    None
                }
            }
        } else {
            None
        };

        let retriever = Arc::new(HybridRetriever::new(
            store.clone(),
            text_search.clone(),
            embedder.clone(),
            reranker,
            config.retrieval.clone(),
        ));

        let llm: Arc<dyn LlmProvider> = Arc::new(provider_from_config(&config.llm)?);
        let audit = Arc::new(AuditLog::new(config.audit_log_path())?);
        let checkpoint = CheckpointStore::new(config.checkpoint_dir())?;

        let ingestor = Ingestor::new(
            store.clone(),
            text_search.clone(),
            embedder.clone(),
            DocumentParser::new(),
            &config.chunking,
            None,
        );

        let ctx = Arc::new(PipelineCtx {
            store: store.clone(),
            retriever: retriever.clone(),
            llm,
            audit,
            config: config.clone(),
        });
        let runner = GraphRunner::new(ctx, checkpoint);

        Ok(Self {
            config,
            store,
            text_search,
            embedder,
            retriever,
            ingestor,
            runner,
        })
    }

    /// Wire an image decoder into ingestion so image and multimodal
    /// chunks embed through the vision encoder.
    pub fn with_image_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.ingestor = Ingestor::new(
            self.store.clone(),
            self.text_search.clone(),
            self.embedder.clone(),
            DocumentParser::new(),
            &self.config.chunking,
            Some(decoder),
        );
        self
    }

    /// Ingest one file, returning the new document id.
    pub async fn ingest(&self, path: &Path, title: Option<&str>) -> Result<Uuid> {
        self.ingestor.ingest(path, title).await
    }

    /// One question against the pipeline, checkpointed by thread id.
    pub async fn ask(
        &self,
        question: &str,
        thread_id: &str,
        scope: &AskScope,
        cross_doc: bool,
    ) -> Result<AskOutcome> {
        self.runner.run(question, thread_id, scope, cross_doc).await
    }

    /// Direct hybrid retrieval, bypassing the agent pipeline.
    pub async fn retrieve(&self, request: &RetrieveRequest) -> Result<Vec<RetrievedChunk>> {
        self.retriever.retrieve(request).await
    }

    /// Sequential chunks of one document, unranked (neutral scores).
    pub async fn retrieve_by_structure(
        &self,
        doc_id: Uuid,
        max_chunks: usize,
        strategy: StructureStrategy,
    ) -> Result<Vec<RetrievedChunk>> {
        self.retriever
            .retrieve_by_structure(doc_id, max_chunks, strategy)
            .await
    }

    /// Run a retrieval and summarize it for inspection tooling.
    pub async fn diagnose_retrieval(
        &self,
        request: &RetrieveRequest,
    ) -> Result<crate::retrieval::RetrievalDiagnostics> {
        let hits = self.retriever.retrieve(request).await?;
        Ok(crate::retrieval::diagnose(&request.query, &hits))
    }

    /// Block until an ingested document's chunks are visible to retrieval.
    pub async fn wait_for_document(
        &self,
        doc_id: Uuid,
        min_chunks: usize,
        timeout: std::time::Duration,
    ) -> Result<usize> {
        crate::storage::wait_for_chunks(self.store.as_ref(), doc_id, min_chunks, timeout).await
    }

    /// Inspect a document by id or title.
    pub async fn inspect_document(&self, selector: &str) -> Result<DocumentReport> {
        let doc = match Uuid::parse_str(selector) {
            Ok(doc_id) => self.store.get_document(doc_id).await?,
            Err(_) => self.store.find_document_by_title(selector).await?,
        };
        let Some(doc) = doc else {
            return Err(RagError::Store(format!("document not found: {}", selector)));
        };

        let chunks = self
            .store
            .structure_chunks(doc.doc_id, usize::MAX, StructureStrategy::AllPages)
            .await?;

        let mut content_type_counts: HashMap<String, usize> = HashMap::new();
        for chunk in &chunks {
            *content_type_counts
                .entry(chunk.content_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        let sample_chunks: Vec<String> = chunks
            .iter()
            .take(3)
            .map(|c| c.text.chars().take(160).collect())
            .collect();

        Ok(DocumentReport {
            doc_id: doc.doc_id,
            title: doc.title,
            source_path: doc.source_path,
            created_at: doc.created_at,
            chunk_count: chunks.len(),
            first_page: chunks.iter().filter_map(|c| c.page_start).min(),
            last_page: chunks.iter().filter_map(|c| c.page_end).max(),
            content_type_counts,
            sample_chunks,
        })
    }

    /// Delete a document and everything it owns: chunk rows and lexical
    /// postings.
    pub async fn delete_document(&self, doc_id: Uuid) -> Result<usize> {
        let removed = self.store.delete_document(doc_id).await?;
        self.text_search.delete_document(doc_id)?;
        Ok(removed)
    }

    pub async fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>> {
        self.store.list_documents(limit).await
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }
}
