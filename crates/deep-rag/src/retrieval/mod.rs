//! Hybrid retrieval engine: two-path candidate generation (lexical +
//! dense vector), cross-encoder rerank, and MMR diversification, with
//! scoped, cross-document, two-stage, and structure-based modes.

pub mod diagnostics;
pub mod merge;
pub mod mmr;

pub use diagnostics::{diagnose, RetrievalDiagnostics};
pub use merge::merge_and_deduplicate;
pub use mmr::mmr;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::embeddings::{EmbeddingModel, ImageInput};
use crate::error::{RagError, Result};
use crate::reranking::Reranker;
use crate::search::{sanitize_query, TextSearch};
use crate::storage::{ChunkStore, StoredChunk, StructureStrategy};
use crate::types::RetrievedChunk;

/// Characters of each top stage-one chunk folded into the stage-two query.
const STAGE_TWO_SNIPPET_CHARS: usize = 500;

/// Stage-one chunks folded into the stage-two query.
const STAGE_TWO_TOP_CHUNKS: usize = 5;

/// One retrieval request.
#[derive(Debug, Clone)]
pub struct RetrieveRequest {
    pub query: String,
    pub k: usize,
    pub k_lex: usize,
    pub k_vec: usize,
    pub query_image: Option<ImageInput>,
    pub doc_id: Option<Uuid>,
    pub cross_doc: bool,
}

impl RetrieveRequest {
    pub fn new(query: impl Into<String>, config: &RetrievalConfig) -> Self {
        Self {
            query: query.into(),
            k: config.k,
            k_lex: config.k_lex,
            k_vec: config.k_vec,
            query_image: None,
            doc_id: None,
            cross_doc: false,
        }
    }
}

pub struct HybridRetriever {
    store: Arc<dyn ChunkStore>,
    text_search: Arc<TextSearch>,
    embedder: Arc<dyn EmbeddingModel>,
    reranker: Option<Arc<dyn Reranker>>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<dyn ChunkStore>,
        text_search: Arc<TextSearch>,
        embedder: Arc<dyn EmbeddingModel>,
        reranker: Option<Arc<dyn Reranker>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            text_search,
            embedder,
            reranker,
            config,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Hybrid retrieval with optional document filtering.
    ///
    /// With `cross_doc` and a primary document this becomes two-stage:
    /// stage one retrieves from the primary document, stage two embeds the
    /// query concatenated with the top stage-one texts and searches the
    /// complement, and the merge prioritizes stage-one chunks.
    pub async fn retrieve(&self, req: &RetrieveRequest) -> Result<Vec<RetrievedChunk>> {
        if req.query.trim().is_empty() {
            return Err(RagError::Store("retrieve called with empty query".to_string()));
        }

        if req.cross_doc {
            if let Some(doc_id) = req.doc_id {
                return self.two_stage(req, doc_id).await;
            }
            return self
                .run_stage(
                    &req.query,
                    req.k,
                    req.k_lex,
                    req.k_vec,
                    req.query_image.as_ref(),
                    None,
                    None,
                )
                .await;
        }

        // Strict scoping when a document is given, full-corpus fallback
        // otherwise.
        self.run_stage(
            &req.query,
            req.k,
            req.k_lex,
            req.k_vec,
            req.query_image.as_ref(),
            req.doc_id,
            None,
        )
        .await
    }

    async fn two_stage(&self, req: &RetrieveRequest, doc_id: Uuid) -> Result<Vec<RetrievedChunk>> {
        tracing::info!(doc_id = %doc_id, "two-stage retrieval: primary document first, then complement");

        let primary = self
            .run_stage(
                &req.query,
                req.k,
                req.k_lex,
                req.k_vec,
                req.query_image.as_ref(),
                Some(doc_id),
                None,
            )
            .await?;

        if primary.is_empty() {
            tracing::warn!(doc_id = %doc_id, "no primary chunks; falling back to cross-document search");
            return self
                .run_stage(
                    &req.query,
                    req.k,
                    req.k_lex,
                    req.k_vec,
                    req.query_image.as_ref(),
                    None,
                    None,
                )
                .await;
        }

        // Stage two: expand the query with what stage one found so the
        // complement search carries document context.
        let mut combined = req.query.clone();
        for chunk in primary.iter().take(STAGE_TWO_TOP_CHUNKS) {
            combined.push(' ');
            let snippet: String = chunk.text.chars().take(STAGE_TWO_SNIPPET_CHARS).collect();
            combined.push_str(&snippet);
        }

        let secondary = self
            .run_stage(
                &combined,
                req.k,
                req.k_lex,
                req.k_vec,
                req.query_image.as_ref(),
                None,
                Some(doc_id),
            )
            .await?;

        Ok(merge_and_deduplicate(primary, secondary, req.k))
    }

    /// One retrieval stage: candidate pools, union, hydration, rerank, MMR.
    async fn run_stage(
        &self,
        query: &str,
        k: usize,
        k_lex: usize,
        k_vec: usize,
        image: Option<&ImageInput>,
        scope: Option<Uuid>,
        exclude: Option<Uuid>,
    ) -> Result<Vec<RetrievedChunk>> {
        let qemb = match image {
            Some(img) => self.embedder.embed_multimodal(query, img)?,
            None => self.embedder.embed_text(query)?,
        };
        if qemb.len() != self.embedder.dimension() {
            return Err(RagError::EmbeddingFailed(format!(
                "query embedding has {} dimensions, expected {}",
                qemb.len(),
                self.embedder.dimension()
            )));
        }

        // The sanitized query feeds the lexical parser only; the embedding
        // path uses the raw query.
        let sanitized = sanitize_query(query);
        if sanitized != query {
            tracing::debug!(original = query, sanitized = %sanitized, "query sanitized for lexical search");
        }

        let scope_set: Option<HashSet<Uuid>> = scope.map(|d| [d].into_iter().collect());
        let scope_vec: Option<Vec<Uuid>> = scope.map(|d| vec![d]);

        let lex_hits = self
            .text_search
            .search_scoped(&sanitized, k_lex, scope_set.as_ref(), exclude)?;
        let vec_hits = self
            .store
            .vector_candidates(&qemb, k_vec, scope_vec.as_deref(), exclude)
            .await?;

        // Union of both pools keyed by chunk id; whichever pool missed a
        // chunk contributes a zero score.
        let mut pool: HashMap<Uuid, (f32, f32)> = HashMap::new();
        for (chunk_id, lex) in &lex_hits {
            pool.entry(*chunk_id).or_insert((0.0, 0.0)).0 = *lex;
        }
        for hit in &vec_hits {
            pool.entry(hit.chunk_id).or_insert((0.0, 0.0)).1 = hit.score;
        }

        let mut combined: Vec<(Uuid, f32, f32)> =
            pool.into_iter().map(|(id, (lex, vec))| (id, lex, vec)).collect();
        combined.sort_by(|a, b| {
            let ka = 0.6 * a.1 + 0.4 * a.2;
            let kb = 0.6 * b.1 + 0.4 * b.2;
            kb.partial_cmp(&ka).unwrap_or(std::cmp::Ordering::Equal)
        });
        combined.truncate(k_lex + k_vec);

        if combined.is_empty() {
            return Ok(Vec::new());
        }

        // Hydration round-trip: full rows with embeddings.
        let ids: Vec<Uuid> = combined.iter().map(|(id, _, _)| *id).collect();
        let hydrated = self.store.fetch_chunks(&ids).await?;
        let by_id: HashMap<Uuid, StoredChunk> =
            hydrated.into_iter().map(|c| (c.chunk_id, c)).collect();

        let mut candidates: Vec<RetrievedChunk> = Vec::with_capacity(combined.len());
        for (chunk_id, lex, vec) in combined {
            let Some(stored) = by_id.get(&chunk_id) else {
                continue;
            };
            let Some(embedding) = stored.embedding.clone() else {
                // Vector was malformed or missing; the store already logged
                // the incident. Excluded from ranking.
                continue;
            };
            candidates.push(RetrievedChunk {
                chunk_id,
                doc_id: Some(stored.doc_id),
                text: stored.text.clone(),
                page_start: stored.page_start,
                page_end: stored.page_end,
                content_type: stored.content_type,
                image_path: stored.image_path.clone(),
                lex,
                vec,
                ce: 0.0,
                embedding: Some(embedding),
            });
        }

        // Cross-encoder rerank: precision step, skipped on failure.
        if let Some(reranker) = &self.reranker {
            let texts: Vec<&str> = candidates.iter().map(|c| c.text.as_str()).collect();
            match reranker.score_batch(query, &texts) {
                Ok(scores) => {
                    for (chunk, score) in candidates.iter_mut().zip(scores) {
                        chunk.ce = score;
                    }
                    candidates.sort_by(|a, b| {
                        b.ce.partial_cmp(&a.ce).unwrap_or(std::cmp::Ordering::Equal)
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reranking failed; continuing without reranking");
                }
            }
        }

        let pool_len = candidates.len().min(self.config.mmr_pool);
        let selected = mmr(&candidates[..pool_len], &qemb, self.config.mmr_lambda, k);

        tracing::debug!(
            lex_pool = lex_hits.len(),
            vec_pool = vec_hits.len(),
            candidates = pool_len,
            selected = selected.len(),
            "retrieval stage complete"
        );
        Ok(selected)
    }

    /// Sequential chunks of one document, unranked. Scores default to
    /// neutral values so downstream scoring keeps working.
    pub async fn retrieve_by_structure(
        &self,
        doc_id: Uuid,
        max_chunks: usize,
        strategy: StructureStrategy,
    ) -> Result<Vec<RetrievedChunk>> {
        let rows = self.store.structure_chunks(doc_id, max_chunks, strategy).await?;
        Ok(rows
            .into_iter()
            .map(|stored| RetrievedChunk {
                chunk_id: stored.chunk_id,
                doc_id: Some(stored.doc_id),
                text: stored.text,
                page_start: stored.page_start,
                page_end: stored.page_end,
                content_type: stored.content_type,
                image_path: stored.image_path,
                lex: 0.5,
                vec: 0.5,
                ce: 0.0,
                embedding: stored.embedding,
            })
            .collect())
    }
}
