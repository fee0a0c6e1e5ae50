//! Agent pipeline: planner → retriever → compressor → critic →
//! (refine-retrieve ⟲) → synthesizer → citation pruner.
//!
//! The graph is a small finite state machine with one back-edge, expressed
//! as an explicit node enum and a transition function. Each node is a pure
//! function on the state returning a patch; the runner merges patches and
//! checkpoints after every node, so a node that fails or is cancelled
//! mid-flight never persists partial results.

pub mod checkpoint;
pub mod nodes;
pub mod prompts;
pub mod state;

pub use checkpoint::CheckpointStore;
pub use state::{AskScope, PipelineState, StatePatch};

use std::sync::Arc;

use serde_json::json;

use crate::audit::AuditLog;
use crate::config::RagConfig;
use crate::error::Result;
use crate::llm::LlmProvider;
use crate::retrieval::HybridRetriever;
use crate::storage::ChunkStore;
use crate::types::{AskOutcome, RagAction};

/// Critic heuristic confidence target: below this the critic proposes
/// refinements and the conditional edge routes back into the loop.
pub const CRITIC_CONFIDENCE_TARGET: f32 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    Planner,
    Retriever,
    Compressor,
    Critic,
    RefineRetrieve,
    Synthesizer,
    CitationPruner,
}

impl NodeId {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Retriever => "retriever",
            Self::Compressor => "compressor",
            Self::Critic => "critic",
            Self::RefineRetrieve => "refine_retrieve",
            Self::Synthesizer => "synthesizer",
            Self::CitationPruner => "citation_pruner",
        }
    }
}

/// Transition table. The only conditional edge is out of the critic:
/// refine when the heuristic is weak, the loop bound is not exhausted,
/// and refinements are pending; synthesize otherwise.
pub fn next_node(current: NodeId, state: &PipelineState, max_iters: u32) -> Option<NodeId> {
    match current {
        NodeId::Planner => Some(NodeId::Retriever),
        NodeId::Retriever => Some(NodeId::Compressor),
        NodeId::Compressor => Some(NodeId::Critic),
        NodeId::Critic => {
            if state.confidence < CRITIC_CONFIDENCE_TARGET
                && state.iterations <= max_iters
                && !state.refinements.is_empty()
            {
                Some(NodeId::RefineRetrieve)
            } else {
                Some(NodeId::Synthesizer)
            }
        }
        NodeId::RefineRetrieve => Some(NodeId::Compressor),
        NodeId::Synthesizer => Some(NodeId::CitationPruner),
        NodeId::CitationPruner => None,
    }
}

/// Shared handles every node runs against.
pub struct PipelineCtx {
    pub store: Arc<dyn ChunkStore>,
    pub retriever: Arc<HybridRetriever>,
    pub llm: Arc<dyn LlmProvider>,
    pub audit: Arc<AuditLog>,
    pub config: Arc<RagConfig>,
}

pub struct GraphRunner {
    ctx: Arc<PipelineCtx>,
    checkpoint: CheckpointStore,
}

impl GraphRunner {
    pub fn new(ctx: Arc<PipelineCtx>, checkpoint: CheckpointStore) -> Self {
        Self { ctx, checkpoint }
    }

    /// Run one invocation on a thread. The checkpoint is loaded, merged
    /// with the explicit initial state, persisted after every node, and
    /// the final state becomes the outcome.
    pub async fn run(
        &self,
        question: &str,
        thread_id: &str,
        scope: &AskScope,
        cross_doc: bool,
    ) -> Result<AskOutcome> {
        // The user deselected every document and cross-doc search is off:
        // answer with the sentinel immediately, touching neither the LLM
        // nor the chunk store.
        if !cross_doc && scope.is_explicitly_empty() {
            tracing::info!("empty explicit selection with cross_doc disabled; short-circuiting");
            let outcome = AskOutcome {
                answer: crate::types::NO_DOCUMENTS_ANSWER.to_string(),
                confidence: 0.0,
                action: RagAction::Clarify,
                doc_id: None,
                doc_ids: Vec::new(),
                doc_map: Vec::new(),
                pages: Vec::new(),
                citations: Vec::new(),
            };
            self.ctx.audit.log_interaction(
                "anonymous",
                thread_id,
                Some(question),
                &[],
                Some(&outcome.answer),
                None,
                cross_doc,
                Some(json!({"reason": "no_documents_selected"})),
            );
            return Ok(outcome);
        }

        let prev = self.checkpoint.load(thread_id)?;
        let mut state = PipelineState::for_invocation(prev, question, scope, cross_doc);

        let mut node = NodeId::Planner;
        loop {
            tracing::info!(node = node.name(), iterations = state.iterations, "running node");
            let patch = match self.run_node(node, &state, thread_id).await {
                Ok(patch) => patch,
                Err(e) => {
                    self.ctx.audit.log_step(
                        thread_id,
                        node.name(),
                        "error",
                        None,
                        Some(state.iterations),
                        Some(json!({"error": e.to_string()})),
                    );
                    return Err(e);
                }
            };
            patch.apply(&mut state);
            self.checkpoint.save(thread_id, &state)?;

            match next_node(node, &state, self.ctx.config.agent.max_iters) {
                Some(next) => node = next,
                None => break,
            }
        }

        let outcome = AskOutcome {
            answer: state.answer.clone(),
            confidence: state.confidence,
            action: state.action,
            doc_id: state.doc_id,
            doc_ids: state.doc_ids.clone(),
            doc_map: state.doc_map.clone(),
            pages: state.pages.clone(),
            citations: state.citations.clone(),
        };

        self.ctx.audit.log_interaction(
            "anonymous",
            thread_id,
            Some(question),
            &outcome.doc_ids,
            Some(&outcome.answer),
            serde_json::to_value(&state).ok(),
            cross_doc,
            Some(json!({
                "iterations": state.iterations,
                "action": state.action,
                "confidence": state.confidence,
            })),
        );

        Ok(outcome)
    }

    async fn run_node(
        &self,
        node: NodeId,
        state: &PipelineState,
        thread_id: &str,
    ) -> Result<StatePatch> {
        let ctx = &self.ctx;
        match node {
            NodeId::Planner => nodes::planner::run(ctx, state, thread_id).await,
            NodeId::Retriever => nodes::retriever::run(ctx, state, thread_id).await,
            NodeId::Compressor => nodes::compressor::run(ctx, state, thread_id).await,
            NodeId::Critic => nodes::critic::run(ctx, state, thread_id).await,
            NodeId::RefineRetrieve => nodes::refine_retrieve::run(ctx, state, thread_id).await,
            NodeId::Synthesizer => nodes::synthesizer::run(ctx, state, thread_id).await,
            NodeId::CitationPruner => nodes::citation_pruner::run(ctx, state, thread_id).await,
        }
    }
}

/// Abstain patch shared by the synthesizer gates and the refusal path:
/// the fixed phrase with every source scrubbed.
pub(crate) fn abstain_patch(confidence: f32) -> StatePatch {
    StatePatch {
        answer: Some(crate::types::ABSTAIN_ANSWER.to_string()),
        confidence: Some(confidence),
        action: Some(RagAction::Abstain),
        doc_id: Some(None),
        doc_ids: Some(Vec::new()),
        pages: Some(Vec::new()),
        citations: Some(Vec::new()),
        doc_map: Some(Vec::new()),
        ..StatePatch::default()
    }
}

#[cfg(test)]
mod pipeline_tests {
    use super::*;
    use crate::embeddings::{EmbeddingModel, ImageInput};
    use crate::error::Result;
    use crate::retrieval::HybridRetriever;
    use crate::search::TextSearch;
    use crate::storage::testing::MemoryStore;
    use crate::types::{ChunkRecord, ContentType, DocumentRecord, ABSTAIN_ANSWER, NO_DOCUMENTS_ANSWER};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct StubEmbedder;
    impl EmbeddingModel for StubEmbedder {
        fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0, 0.0, 0.0])
        }
        fn embed_image(&self, _image: &ImageInput) -> Result<Vec<f32>> {
            Ok(vec![0.0, 1.0, 0.0])
        }
        fn dimension(&self) -> usize {
            3
        }
    }

    /// LLM double that answers by node role (dispatched on the system
    /// prompt) and records every call.
    struct ScriptedLlm {
        refinement_reply: String,
        synthesizer_reply: String,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl crate::llm::LlmProvider for ScriptedLlm {
        async fn generate(
            &self,
            system: &str,
            _user: &str,
            _max_tokens: usize,
            _temperature: f32,
        ) -> Result<String> {
            self.calls.lock().push(system.to_string());
            Ok(if system == prompts::PLANNER_SYSTEM {
                "hygiene protocols overview".to_string()
            } else if system == prompts::COMPRESSOR_SYSTEM {
                "- compressed notes".to_string()
            } else if system == prompts::CRITIC_SYSTEM {
                self.refinement_reply.clone()
            } else {
                self.synthesizer_reply.clone()
            })
        }
    }

    impl ScriptedLlm {
        fn count(&self, system: &str) -> usize {
            self.calls.lock().iter().filter(|s| s.as_str() == system).count()
        }
        fn total(&self) -> usize {
            self.calls.lock().len()
        }
    }

    struct Fixture {
        _dir: TempDir,
        runner: GraphRunner,
        llm: Arc<ScriptedLlm>,
        doc_id: Uuid,
    }

    async fn fixture(with_doc: bool, synthesizer_reply: Option<String>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let text_search = Arc::new(TextSearch::new(dir.path()).unwrap());
        let doc_id = Uuid::new_v4();
        let prefix = doc_id.to_string()[..8].to_string();

        if with_doc {
            let doc = DocumentRecord {
                doc_id,
                title: "Clinic Handbook".to_string(),
                source_path: "/docs/handbook.pdf".to_string(),
                created_at: 0,
                meta: HashMap::new(),
            };
            let chunks: Vec<ChunkRecord> = [
                "hygiene protocols overview for the clinic",
                "hygiene protocols overview appendix section",
            ]
            .iter()
            .map(|text| ChunkRecord {
                chunk_id: Uuid::new_v4(),
                doc_id,
                page_start: Some(4),
                page_end: Some(4),
                section: String::new(),
                text: text.to_string(),
                is_ocr: false,
                is_figure: false,
                content_type: ContentType::PdfText,
                image_path: None,
                embedding: vec![1.0, 0.0, 0.0],
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
        }

        let mut config = crate::config::RagConfig::default();
        config.llm.max_retries = 1;
        config.llm.retry_backoff_secs = 0.001;
        let config = Arc::new(config);

        let retriever = Arc::new(HybridRetriever::new(
            store.clone(),
            text_search,
            Arc::new(StubEmbedder),
            None,
            config.retrieval.clone(),
        ));
        let llm = Arc::new(ScriptedLlm {
            refinement_reply: "refined query alpha\nrefined query beta".to_string(),
            synthesizer_reply: synthesizer_reply.unwrap_or_else(|| {
                format!(
                    "The protocols require weekly review [A].\n\nSources:\n- [A] [DOC: {}]",
                    prefix
                )
            }),
            calls: Mutex::new(Vec::new()),
        });
        let audit = Arc::new(crate::audit::AuditLog::new(dir.path().join("audit.jsonl")).unwrap());
        let checkpoint = CheckpointStore::new(dir.path().join("checkpoints")).unwrap();

        let ctx = Arc::new(PipelineCtx {
            store,
            retriever,
            llm: llm.clone(),
            audit,
            config,
        });
        Fixture {
            _dir: dir,
            runner: GraphRunner::new(ctx, checkpoint),
            llm,
            doc_id,
        }
    }

    #[tokio::test]
    async fn test_happy_path_answers_with_citations() {
        let fx = fixture(true, None).await;
        let outcome = fx
            .runner
            .run("hygiene protocols", "t-happy", &AskScope::default(), true)
            .await
            .unwrap();

        assert_eq!(outcome.action, crate::types::RagAction::Answer);
        assert_eq!(outcome.doc_ids, vec![fx.doc_id]);
        assert!(outcome.answer.contains("weekly review"));
        assert!(outcome.answer.contains("Documents used for analysis"));
        assert!(outcome.answer.contains("- [A] Clinic Handbook"));
        assert!(outcome.confidence >= 40.0);
        assert_eq!(outcome.pages, vec![4]);
        assert_eq!(outcome.citations.len(), 1);
        assert!(outcome.citations[0].contains("Clinic Handbook"));
        // Strong evidence: no refinement round was needed.
        assert_eq!(fx.llm.count(prompts::CRITIC_SYSTEM), 0);
    }

    #[tokio::test]
    async fn test_empty_corpus_bounded_loop_then_abstain() {
        let fx = fixture(false, None).await;
        let outcome = fx
            .runner
            .run("nonsense xyzzy plugh", "t-empty", &AskScope::default(), true)
            .await
            .unwrap();

        assert_eq!(outcome.answer, ABSTAIN_ANSWER);
        assert_eq!(outcome.action, crate::types::RagAction::Abstain);
        assert!(outcome.doc_ids.is_empty());
        assert!(outcome.pages.is_empty());
        assert!(outcome.citations.is_empty());
        assert!(outcome.confidence < 40.0);
        // The refinement loop ran exactly MAX_ITERS times, then stopped.
        assert_eq!(fx.llm.count(prompts::CRITIC_SYSTEM), 3);
        // The synthesizer abstained before calling the LLM.
        assert_eq!(fx.llm.count(prompts::SYNTHESIZER_SYSTEM), 0);
    }

    #[tokio::test]
    async fn test_empty_selection_short_circuits_without_llm() {
        let fx = fixture(true, None).await;
        let scope = AskScope {
            doc_id: None,
            selected_doc_ids: Some(vec![]),
            uploaded_doc_ids: None,
        };
        let outcome = fx
            .runner
            .run("anything", "t-noscope", &scope, false)
            .await
            .unwrap();

        assert_eq!(outcome.answer, NO_DOCUMENTS_ANSWER);
        assert!(outcome.doc_ids.is_empty());
        assert_eq!(fx.llm.total(), 0);
    }

    #[tokio::test]
    async fn test_empty_selection_short_circuits_despite_doc_id() {
        let fx = fixture(true, None).await;
        // The caller deselected everything but a doc_id (e.g. from a
        // fresh ingest) is still in the scope struct: the deselection
        // wins and neither the LLM nor the store is consulted.
        let scope = AskScope {
            doc_id: Some(fx.doc_id),
            selected_doc_ids: Some(vec![]),
            uploaded_doc_ids: Some(vec![fx.doc_id]),
        };
        let outcome = fx
            .runner
            .run("anything", "t-noscope-staledoc", &scope, false)
            .await
            .unwrap();

        assert_eq!(outcome.answer, NO_DOCUMENTS_ANSWER);
        assert!(outcome.doc_ids.is_empty());
        assert_eq!(fx.llm.total(), 0);
    }

    #[tokio::test]
    async fn test_llm_refusal_scrubs_sources() {
        let fx = fixture(
            true,
            Some("The document does not contain the answer.".to_string()),
        )
        .await;
        let outcome = fx
            .runner
            .run("hygiene protocols", "t-refusal", &AskScope::default(), true)
            .await
            .unwrap();

        assert_eq!(outcome.answer, ABSTAIN_ANSWER);
        assert_eq!(outcome.action, crate::types::RagAction::Abstain);
        assert!(outcome.doc_ids.is_empty());
        assert!(outcome.pages.is_empty());
        assert!(outcome.citations.is_empty());
        assert!(outcome.confidence <= 40.0);
    }

    #[tokio::test]
    async fn test_scoped_run_restricts_evidence() {
        let fx = fixture(true, None).await;
        let scope = AskScope {
            doc_id: None,
            selected_doc_ids: Some(vec![fx.doc_id]),
            uploaded_doc_ids: None,
        };
        let outcome = fx
            .runner
            .run("hygiene protocols", "t-scoped", &scope, false)
            .await
            .unwrap();

        assert_eq!(outcome.action, crate::types::RagAction::Answer);
        assert_eq!(outcome.doc_ids, vec![fx.doc_id]);
        assert_eq!(outcome.doc_id, Some(fx.doc_id));
    }
}
