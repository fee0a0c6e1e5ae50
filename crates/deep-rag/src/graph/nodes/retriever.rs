//! Retriever node: resolves the document scope and fetches evidence.

use std::collections::HashSet;

use serde_json::json;
use uuid::Uuid;

use crate::error::Result;
use crate::graph::state::{PipelineState, StatePatch};
use crate::graph::PipelineCtx;
use crate::retrieval::RetrieveRequest;
use crate::storage::StructureStrategy;
use crate::types::RetrievedChunk;

/// Chunks pulled per document when similarity results are poor.
const STRUCTURE_SUPPLEMENT_CHUNKS: usize = 15;

/// Coverage considered sufficient in hybrid mode before supplementing
/// with cross-document retrieval.
const HYBRID_COVERAGE_TARGET: usize = 12;

/// Cap on evidence produced by the scoped and hybrid paths.
const SCOPED_RESULT_CAP: usize = 20;

/// A document's similarity results are good when at least one chunk has a
/// positive cross-encoder score, both a lexical and a solid vector match,
/// or a very high vector score alone. The triple test keeps marginal
/// vector matches with negative ce from counting as relevance.
pub(crate) fn has_good_similarity(hits: &[RetrievedChunk]) -> bool {
    hits.iter().any(|h| {
        h.ce > 0.3 || (h.lex > 0.0 && h.vec > 0.6) || h.vec > 0.7
    })
}

fn dedup_by_chunk_id(chunks: Vec<RetrievedChunk>) -> Vec<RetrievedChunk> {
    let mut seen: HashSet<Uuid> = HashSet::new();
    chunks
        .into_iter()
        .filter(|c| seen.insert(c.chunk_id))
        .collect()
}

pub async fn run(
    ctx: &PipelineCtx,
    state: &PipelineState,
    thread_id: &str,
) -> Result<StatePatch> {
    let query = format!("{}  {}", state.question, state.plan);
    let cross_doc = state.cross_doc;

    // An explicitly empty selection means the user deselected everything;
    // with cross-doc disabled that overrides any doc_id or upload list
    // still carried in the state. Checked before scope resolution so a
    // stale doc_id cannot sneak retrieval back in.
    let deselected_all = matches!(state.selected_doc_ids.as_deref(), Some([]));
    if !cross_doc && deselected_all {
        tracing::info!("selection explicitly empty and cross_doc disabled; returning empty evidence");
        return Ok(StatePatch {
            evidence: Some(Vec::new()),
            doc_ids: Some(Vec::new()),
            ..StatePatch::default()
        });
    }

    let scope = state.scope_docs();

    // No document was ever specified and cross-doc search is off:
    // nothing to search either.
    if !cross_doc && scope.is_empty() {
        tracing::info!("no documents in scope and cross_doc disabled; returning empty evidence");
        return Ok(StatePatch {
            evidence: Some(Vec::new()),
            doc_ids: Some(Vec::new()),
            ..StatePatch::default()
        });
    }

    let rcfg = &ctx.config.retrieval;
    let hits = if cross_doc && !scope.is_empty() {
        // Hybrid mode: prioritize the selected documents, supplement with
        // cross-document retrieval only when coverage is thin.
        let mut selected_hits: Vec<RetrievedChunk> = Vec::new();
        for doc in &scope {
            let mut req = RetrieveRequest::new(query.clone(), rcfg);
            req.doc_id = Some(*doc);
            req.cross_doc = false;
            let doc_hits = ctx.retriever.retrieve(&req).await?;
            tracing::info!(doc = %doc, found = doc_hits.len(), "scope document retrieval");

            if !has_good_similarity(&doc_hits) {
                let structure_hits = ctx
                    .retriever
                    .retrieve_by_structure(*doc, STRUCTURE_SUPPLEMENT_CHUNKS, StructureStrategy::FirstPages)
                    .await?;
                tracing::info!(
                    doc = %doc,
                    supplement = structure_hits.len(),
                    "similarity poor; supplementing with structure-based retrieval"
                );
                selected_hits.extend(doc_hits);
                selected_hits.extend(structure_hits);
            } else {
                selected_hits.extend(doc_hits);
            }
        }
        let unique_selected = dedup_by_chunk_id(selected_hits);

        if unique_selected.len() >= HYBRID_COVERAGE_TARGET {
            unique_selected.into_iter().take(SCOPED_RESULT_CAP).collect()
        } else {
            let mut req = RetrieveRequest::new(query.clone(), rcfg);
            req.cross_doc = true;
            let cross_hits = ctx.retriever.retrieve(&req).await?;
            tracing::info!(
                selected = unique_selected.len(),
                cross = cross_hits.len(),
                "thin scope coverage; merging cross-document hits"
            );
            let mut merged = unique_selected;
            let mut seen: HashSet<Uuid> = merged.iter().map(|c| c.chunk_id).collect();
            for hit in cross_hits {
                if merged.len() >= SCOPED_RESULT_CAP {
                    break;
                }
                if seen.insert(hit.chunk_id) {
                    merged.push(hit);
                }
            }
            merged
        }
    } else if !scope.is_empty() {
        // Strictly scoped: every returned chunk must belong to the scope.
        let mut all_hits: Vec<RetrievedChunk> = Vec::new();
        for doc in &scope {
            let mut req = RetrieveRequest::new(query.clone(), rcfg);
            req.doc_id = Some(*doc);
            req.cross_doc = false;
            let doc_hits = ctx.retriever.retrieve(&req).await?;
            tracing::info!(doc = %doc, found = doc_hits.len(), "scoped retrieval");

            if !has_good_similarity(&doc_hits) {
                let structure_hits = ctx
                    .retriever
                    .retrieve_by_structure(*doc, STRUCTURE_SUPPLEMENT_CHUNKS, StructureStrategy::FirstPages)
                    .await?;
                tracing::info!(
                    doc = %doc,
                    supplement = structure_hits.len(),
                    "similarity poor; supplementing with structure-based retrieval"
                );
                all_hits.extend(doc_hits);
                all_hits.extend(structure_hits);
            } else {
                all_hits.extend(doc_hits);
            }
        }

        let scope_set: HashSet<Uuid> = scope.iter().copied().collect();
        dedup_by_chunk_id(all_hits)
            .into_iter()
            .filter(|h| h.doc_id.map_or(false, |d| scope_set.contains(&d)))
            .collect()
    } else {
        // Unscoped cross-document search over the full corpus, with wider
        // pools than the per-document paths.
        let mut req = RetrieveRequest::new(query.clone(), rcfg);
        req.k = 20;
        req.k_lex = 100;
        req.k_vec = 100;
        req.cross_doc = cross_doc;
        ctx.retriever.retrieve(&req).await?
    };

    // Merge with prior evidence (refinement rounds), dedup by chunk id.
    let new_count = hits.len();
    let merged = dedup_by_chunk_id(
        state
            .evidence
            .iter()
            .cloned()
            .chain(hits.into_iter())
            .collect(),
    );

    let doc_ids_found: Vec<Uuid> = {
        let mut seen = HashSet::new();
        merged
            .iter()
            .filter_map(|h| h.doc_id)
            .filter(|d| seen.insert(*d))
            .collect()
    };

    tracing::info!(
        new_chunks = new_count,
        total = merged.len(),
        docs = doc_ids_found.len(),
        "retrieval merged into evidence"
    );
    ctx.audit.log_step(
        thread_id,
        "retriever",
        "retrieve",
        None,
        Some(state.iterations),
        Some(json!({
            "query": query,
            "new_chunks": new_count,
            "total_chunks": merged.len(),
        })),
    );

    Ok(StatePatch {
        evidence: Some(merged),
        doc_ids: Some(doc_ids_found),
        ..StatePatch::default()
    })
}

#[cfg(test)]
mod node_tests {
    use super::*;
    use crate::embeddings::{EmbeddingModel, ImageInput};
    use crate::graph::{PipelineCtx, PipelineState};
    use crate::llm::LlmProvider;
    use crate::retrieval::HybridRetriever;
    use crate::search::TextSearch;
    use crate::storage::testing::MemoryStore;
    use crate::storage::ChunkStore;
    use crate::types::{ChunkRecord, ContentType, DocumentRecord};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StubEmbedder;
    impl EmbeddingModel for StubEmbedder {
        fn embed_text(&self, _text: &str) -> crate::error::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        fn embed_image(&self, _image: &ImageInput) -> crate::error::Result<Vec<f32>> {
            Ok(vec![0.0, 1.0, 0.0])
        }
        fn dimension(&self) -> usize {
            3
        }
    }

    struct NoopLlm;
    #[async_trait]
    impl LlmProvider for NoopLlm {
        async fn generate(
            &self,
            _system: &str,
            _user: &str,
            _max_tokens: usize,
            _temperature: f32,
        ) -> crate::error::Result<String> {
            Ok(String::new())
        }
    }

    async fn ctx_with_poor_similarity_doc() -> (TempDir, Arc<PipelineCtx>, Uuid) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let text_search = Arc::new(TextSearch::new(dir.path()).unwrap());
        let doc_id = Uuid::new_v4();

        let doc = DocumentRecord {
            doc_id,
            title: "Opaque Scan".to_string(),
            source_path: String::new(),
            created_at: 0,
            meta: HashMap::new(),
        };
        // Page 1 is visible to similarity search but orthogonal to the
        // query; pages 2-3 carry no usable embedding, so only the
        // structure path can surface them.
        let chunks: Vec<ChunkRecord> = (1..=3)
            .map(|page| ChunkRecord {
                chunk_id: Uuid::new_v4(),
                doc_id,
                page_start: Some(page),
                page_end: Some(page),
                section: String::new(),
                text: format!("unrelated ledger material page {}", page),
                is_ocr: false,
                is_figure: false,
                content_type: ContentType::PdfText,
                image_path: None,
                embedding: if page == 1 { vec![0.0, 1.0, 0.0] } else { Vec::new() },
                meta: HashMap::new(),
                created_at: 0,
            })
            .collect();
        store.insert_document(&doc, &chunks).await.unwrap();
        let batch: Vec<(Uuid, Uuid, String)> = chunks
            .iter()
            .map(|c| (c.chunk_id, c.doc_id, c.text.clone()))
            .collect();
        text_search.index_chunks_batch(&batch).unwrap();
        text_search.commit().unwrap();

        let config = Arc::new(crate::config::RagConfig::default());
        let retriever = Arc::new(HybridRetriever::new(
            store.clone(),
            text_search,
            Arc::new(StubEmbedder),
            None,
            config.retrieval.clone(),
        ));
        let audit = Arc::new(crate::audit::AuditLog::new(dir.path().join("audit.jsonl")).unwrap());

        let ctx = Arc::new(PipelineCtx {
            store,
            retriever,
            llm: Arc::new(NoopLlm),
            audit,
            config,
        });
        (dir, ctx, doc_id)
    }

    #[tokio::test]
    async fn test_scoped_poor_similarity_supplements_with_structure() {
        let (_dir, ctx, doc_id) = ctx_with_poor_similarity_doc().await;

        let mut state = PipelineState::default();
        state.question = "quarterly hygiene summary".to_string();
        state.selected_doc_ids = Some(vec![doc_id]);
        state.cross_doc = false;

        let patch = run(&ctx, &state, "t").await.unwrap();
        let evidence = patch.evidence.unwrap();

        // Structure-based fallback pulled the first pages with neutral
        // scores, all within scope.
        assert!(!evidence.is_empty());
        assert!(evidence.iter().all(|c| c.doc_id == Some(doc_id)));
        assert!(evidence.iter().any(|c| (c.lex - 0.5).abs() < 1e-6 && (c.vec - 0.5).abs() < 1e-6));
        assert_eq!(patch.doc_ids.unwrap(), vec![doc_id]);
    }

    #[tokio::test]
    async fn test_empty_scope_returns_empty_without_store_hits() {
        let (_dir, ctx, _doc_id) = ctx_with_poor_similarity_doc().await;

        let mut state = PipelineState::default();
        state.question = "anything".to_string();
        state.selected_doc_ids = Some(vec![]);
        state.cross_doc = false;

        let patch = run(&ctx, &state, "t").await.unwrap();
        assert!(patch.evidence.unwrap().is_empty());
        assert!(patch.doc_ids.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deselected_all_overrides_stale_doc_id() {
        let (_dir, ctx, doc_id) = ctx_with_poor_similarity_doc().await;

        // A doc_id (and upload) left over from a previous request on the
        // thread must not defeat the explicit deselection.
        let mut state = PipelineState::default();
        state.question = "anything".to_string();
        state.selected_doc_ids = Some(vec![]);
        state.doc_id = Some(doc_id);
        state.uploaded_doc_ids = Some(vec![doc_id]);
        state.cross_doc = false;

        let patch = run(&ctx, &state, "t").await.unwrap();
        assert!(patch.evidence.unwrap().is_empty());
        assert!(patch.doc_ids.unwrap().is_empty());
    }
}
