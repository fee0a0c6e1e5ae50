//! Pipeline state: one explicit record shared by every node, checkpointed
//! per thread id after each node returns.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DocMapEntry, RagAction, RetrievedChunk};

/// Caller-supplied document scoping for one `ask` invocation.
#[derive(Debug, Clone, Default)]
pub struct AskScope {
    pub doc_id: Option<Uuid>,
    /// `Some(vec![])` means "user deselected everything" and is distinct
    /// from `None` (no explicit selection).
    pub selected_doc_ids: Option<Vec<Uuid>>,
    pub uploaded_doc_ids: Option<Vec<Uuid>>,
}

impl AskScope {
    /// True when the user scoped the request to specific documents.
    pub fn is_explicit(&self) -> bool {
        self.doc_id.is_some()
            || self.selected_doc_ids.as_ref().map_or(false, |v| !v.is_empty())
            || self.uploaded_doc_ids.as_ref().map_or(false, |v| !v.is_empty())
    }

    /// True when the user explicitly deselected every document. The
    /// deselection wins even when a stale `doc_id` or upload list is
    /// still around from an earlier request on the same thread.
    pub fn is_explicitly_empty(&self) -> bool {
        matches!(self.selected_doc_ids.as_deref(), Some([]))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    pub question: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub evidence: Vec<RetrievedChunk>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub answer: String,
    /// Critic heuristic (0-1) while the loop runs; the synthesizer
    /// overwrites it with the display percentage (0-100).
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub action: RagAction,
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub refinements: Vec<String>,
    /// Primary document scope.
    #[serde(default)]
    pub doc_id: Option<Uuid>,
    /// Explicit user selection; empty list means "deselected everything".
    #[serde(default)]
    pub selected_doc_ids: Option<Vec<Uuid>>,
    /// Documents ingested during this same request.
    #[serde(default)]
    pub uploaded_doc_ids: Option<Vec<Uuid>>,
    /// Documents observed in retrieved evidence.
    #[serde(default)]
    pub doc_ids: Vec<Uuid>,
    #[serde(default)]
    pub cross_doc: bool,
    #[serde(default)]
    pub citations: Vec<String>,
    #[serde(default)]
    pub pages: Vec<i32>,
    /// chunk id (string form) -> citation letter.
    #[serde(default)]
    pub chunk_to_letter: HashMap<String, String>,
    /// citation letter -> first 8 chars of the doc id.
    #[serde(default)]
    pub letter_to_doc_prefix: BTreeMap<String, String>,
    /// citation letter -> chunk id (string form).
    #[serde(default)]
    pub letter_to_chunk: BTreeMap<String, String>,
    #[serde(default)]
    pub doc_map: Vec<DocMapEntry>,
}

impl PipelineState {
    /// Build the state for a new invocation on a thread.
    ///
    /// The checkpoint may carry values from a prior invocation, so every
    /// per-request field is explicitly overwritten here rather than
    /// relying on omission; in particular `doc_id` and `selected_doc_ids`
    /// are reset before the caller's scope is applied.
    pub fn for_invocation(
        prev: Option<PipelineState>,
        question: &str,
        scope: &AskScope,
        cross_doc: bool,
    ) -> Self {
        let mut state = prev.unwrap_or_default();
        state.question = question.to_string();
        state.plan.clear();
        state.evidence.clear();
        state.notes.clear();
        state.answer.clear();
        state.confidence = 0.0;
        state.action = RagAction::Answer;
        state.iterations = 0;
        state.refinements.clear();
        state.doc_ids.clear();
        state.citations.clear();
        state.pages.clear();
        state.doc_map.clear();
        state.cross_doc = cross_doc;

        state.doc_id = None;
        state.selected_doc_ids = None;
        state.uploaded_doc_ids = scope.uploaded_doc_ids.clone();

        match &scope.selected_doc_ids {
            Some(selected) if !selected.is_empty() => {
                let mut combined = selected.clone();
                if let Some(doc) = scope.doc_id {
                    if !combined.contains(&doc) {
                        combined.push(doc);
                    }
                }
                state.doc_id = Some(combined[0]);
                state.selected_doc_ids = Some(combined);
            }
            Some(_) => {
                // Explicitly empty selection overrides anything persisted.
                state.selected_doc_ids = Some(Vec::new());
            }
            None => {
                if let Some(doc) = scope.doc_id {
                    state.doc_id = Some(doc);
                    state.selected_doc_ids = Some(vec![doc]);
                }
            }
        }

        state
    }

    /// Scope set for retrieval: selected ∪ uploaded ∪ {doc_id}.
    pub fn scope_docs(&self) -> Vec<Uuid> {
        let mut docs: Vec<Uuid> = Vec::new();
        if let Some(selected) = &self.selected_doc_ids {
            for d in selected {
                if !docs.contains(d) {
                    docs.push(*d);
                }
            }
        }
        if let Some(uploaded) = &self.uploaded_doc_ids {
            for d in uploaded {
                if !docs.contains(d) {
                    docs.push(*d);
                }
            }
        }
        if let Some(doc) = self.doc_id {
            if !docs.contains(&doc) {
                docs.push(doc);
            }
        }
        docs
    }
}

/// Partial state update returned by a node. The runner merges the patch
/// and persists the full state; a node that fails mid-way leaves the
/// checkpoint untouched.
#[derive(Debug, Clone, Default)]
pub struct StatePatch {
    pub plan: Option<String>,
    pub evidence: Option<Vec<RetrievedChunk>>,
    pub notes: Option<String>,
    pub answer: Option<String>,
    pub confidence: Option<f32>,
    pub action: Option<RagAction>,
    pub iterations: Option<u32>,
    pub refinements: Option<Vec<String>>,
    /// `Some(None)` clears the primary document.
    pub doc_id: Option<Option<Uuid>>,
    pub doc_ids: Option<Vec<Uuid>>,
    pub pages: Option<Vec<i32>>,
    pub citations: Option<Vec<String>>,
    pub chunk_to_letter: Option<HashMap<String, String>>,
    pub letter_to_doc_prefix: Option<BTreeMap<String, String>>,
    pub letter_to_chunk: Option<BTreeMap<String, String>>,
    pub doc_map: Option<Vec<DocMapEntry>>,
}

impl StatePatch {
    pub fn apply(self, state: &mut PipelineState) {
        if let Some(plan) = self.plan {
            state.plan = plan;
        }
        if let Some(evidence) = self.evidence {
            state.evidence = evidence;
        }
        if let Some(notes) = self.notes {
            state.notes = notes;
        }
        if let Some(answer) = self.answer {
            state.answer = answer;
        }
        if let Some(confidence) = self.confidence {
            state.confidence = confidence;
        }
        if let Some(action) = self.action {
            state.action = action;
        }
        if let Some(iterations) = self.iterations {
            state.iterations = iterations;
        }
        if let Some(refinements) = self.refinements {
            state.refinements = refinements;
        }
        if let Some(doc_id) = self.doc_id {
            state.doc_id = doc_id;
        }
        if let Some(doc_ids) = self.doc_ids {
            state.doc_ids = doc_ids;
        }
        if let Some(pages) = self.pages {
            state.pages = pages;
        }
        if let Some(citations) = self.citations {
            state.citations = citations;
        }
        if let Some(map) = self.chunk_to_letter {
            state.chunk_to_letter = map;
        }
        if let Some(map) = self.letter_to_doc_prefix {
            state.letter_to_doc_prefix = map;
        }
        if let Some(map) = self.letter_to_chunk {
            state.letter_to_chunk = map;
        }
        if let Some(doc_map) = self.doc_map {
            state.doc_map = doc_map;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_resets_prior_scope() {
        let stale_doc = Uuid::new_v4();
        let mut prev = PipelineState::default();
        prev.doc_id = Some(stale_doc);
        prev.selected_doc_ids = Some(vec![stale_doc]);
        prev.iterations = 2;
        prev.answer = "old answer".to_string();

        let state = PipelineState::for_invocation(
            Some(prev),
            "new question",
            &AskScope::default(),
            false,
        );

        assert_eq!(state.question, "new question");
        assert_eq!(state.doc_id, None);
        assert_eq!(state.selected_doc_ids, None);
        assert_eq!(state.iterations, 0);
        assert!(state.answer.is_empty());
        assert!(state.evidence.is_empty());
    }

    #[test]
    fn test_invocation_combines_selected_and_doc_id() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let scope = AskScope {
            doc_id: Some(b),
            selected_doc_ids: Some(vec![a]),
            uploaded_doc_ids: None,
        };
        let state = PipelineState::for_invocation(None, "q", &scope, false);
        assert_eq!(state.doc_id, Some(a));
        assert_eq!(state.selected_doc_ids, Some(vec![a, b]));
    }

    #[test]
    fn test_explicitly_empty_selection_is_preserved() {
        let scope = AskScope {
            doc_id: None,
            selected_doc_ids: Some(vec![]),
            uploaded_doc_ids: None,
        };
        assert!(scope.is_explicitly_empty());
        assert!(!scope.is_explicit());

        let state = PipelineState::for_invocation(None, "q", &scope, false);
        assert_eq!(state.selected_doc_ids, Some(vec![]));
        assert_eq!(state.doc_id, None);
    }

    #[test]
    fn test_empty_selection_wins_over_stale_doc_id() {
        // Deselecting everything short-circuits even when a doc_id or
        // upload list is still present.
        let scope = AskScope {
            doc_id: Some(Uuid::new_v4()),
            selected_doc_ids: Some(vec![]),
            uploaded_doc_ids: Some(vec![Uuid::new_v4()]),
        };
        assert!(scope.is_explicitly_empty());
    }

    #[test]
    fn test_doc_id_alone_becomes_selection() {
        let d = Uuid::new_v4();
        let scope = AskScope {
            doc_id: Some(d),
            selected_doc_ids: None,
            uploaded_doc_ids: None,
        };
        assert!(scope.is_explicit());
        let state = PipelineState::for_invocation(None, "q", &scope, true);
        assert_eq!(state.doc_id, Some(d));
        assert_eq!(state.selected_doc_ids, Some(vec![d]));
        assert!(state.cross_doc);
    }

    #[test]
    fn test_scope_docs_unions_all_sources() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let mut state = PipelineState::default();
        state.selected_doc_ids = Some(vec![a, b]);
        state.uploaded_doc_ids = Some(vec![b, c]);
        state.doc_id = Some(a);
        let docs = state.scope_docs();
        assert_eq!(docs, vec![a, b, c]);
    }

    #[test]
    fn test_patch_apply_overwrites_only_set_fields() {
        let mut state = PipelineState::default();
        state.plan = "old plan".to_string();
        state.notes = "old notes".to_string();

        let patch = StatePatch {
            notes: Some("new notes".to_string()),
            iterations: Some(2),
            ..StatePatch::default()
        };
        patch.apply(&mut state);

        assert_eq!(state.plan, "old plan");
        assert_eq!(state.notes, "new notes");
        assert_eq!(state.iterations, 2);
    }

    #[test]
    fn test_state_serde_round_trip() {
        let mut state = PipelineState::default();
        state.question = "q".to_string();
        state.letter_to_doc_prefix.insert("A".to_string(), "12ab34cd".to_string());
        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back.question, "q");
        assert_eq!(back.letter_to_doc_prefix.get("A").unwrap(), "12ab34cd");
    }
}
