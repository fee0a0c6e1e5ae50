//! Diagnostics over retrieval results: score distributions, document
//! breakdowns, and a human-readable report for inspection tooling.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::RetrievedChunk;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSummary {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl ScoreSummary {
    fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
            };
        }
        let min = values.iter().cloned().fold(f32::MAX, f32::min);
        let max = values.iter().cloned().fold(f32::MIN, f32::max);
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        Self { min, max, mean }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocBreakdown {
    pub doc_id: Uuid,
    pub chunks: usize,
    pub pages: Vec<i32>,
    pub best_ce: f32,
    pub best_vec: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalDiagnostics {
    pub query: String,
    pub total_chunks: usize,
    pub lex: ScoreSummary,
    pub vec: ScoreSummary,
    pub ce: ScoreSummary,
    pub reranker_active: bool,
    pub documents: Vec<DocBreakdown>,
}

/// Summarize one retrieval result set.
pub fn diagnose(query: &str, chunks: &[RetrievedChunk]) -> RetrievalDiagnostics {
    let lex: Vec<f32> = chunks.iter().map(|c| c.lex).collect();
    let vec: Vec<f32> = chunks.iter().map(|c| c.vec).collect();
    let ce: Vec<f32> = chunks.iter().map(|c| c.ce).collect();

    let mut per_doc: HashMap<Uuid, DocBreakdown> = HashMap::new();
    let mut order: Vec<Uuid> = Vec::new();
    for chunk in chunks {
        let Some(doc_id) = chunk.doc_id else { continue };
        let entry = per_doc.entry(doc_id).or_insert_with(|| {
            order.push(doc_id);
            DocBreakdown {
                doc_id,
                chunks: 0,
                pages: Vec::new(),
                best_ce: f32::MIN,
                best_vec: f32::MIN,
            }
        });
        entry.chunks += 1;
        if let Some(page) = chunk.page_start {
            if !entry.pages.contains(&page) {
                entry.pages.push(page);
            }
        }
        entry.best_ce = entry.best_ce.max(chunk.ce);
        entry.best_vec = entry.best_vec.max(chunk.vec);
    }
    let mut documents: Vec<DocBreakdown> = order
        .into_iter()
        .filter_map(|doc| per_doc.remove(&doc))
        .collect();
    for doc in &mut documents {
        doc.pages.sort_unstable();
    }
    documents.sort_by(|a, b| b.chunks.cmp(&a.chunks));

    RetrievalDiagnostics {
        query: query.to_string(),
        total_chunks: chunks.len(),
        lex: ScoreSummary::from_values(&lex),
        vec: ScoreSummary::from_values(&vec),
        ce: ScoreSummary::from_values(&ce),
        reranker_active: chunks.iter().any(|c| c.ce != 0.0),
        documents,
    }
}

impl RetrievalDiagnostics {
    /// Multi-line report for logs and inspection endpoints.
    pub fn to_report(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Query: {}\n", self.query));
        out.push_str(&format!(
            "Chunks: {} across {} document(s), reranker {}\n",
            self.total_chunks,
            self.documents.len(),
            if self.reranker_active { "active" } else { "inactive" }
        ));
        out.push_str(&format!(
            "Scores: lex [{:.3}, {:.3}] mean {:.3} | vec [{:.3}, {:.3}] mean {:.3} | ce [{:.3}, {:.3}] mean {:.3}\n",
            self.lex.min, self.lex.max, self.lex.mean,
            self.vec.min, self.vec.max, self.vec.mean,
            self.ce.min, self.ce.max, self.ce.mean,
        ));
        for doc in &self.documents {
            let pages: Vec<String> = doc.pages.iter().map(|p| p.to_string()).collect();
            out.push_str(&format!(
                "  {}: {} chunk(s), pages [{}], best ce {:.3}, best vec {:.3}\n",
                &doc.doc_id.to_string()[..8],
                doc.chunks,
                pages.join(", "),
                doc.best_ce,
                doc.best_vec,
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContentType;

    fn chunk(doc: Uuid, page: i32, lex: f32, vec: f32, ce: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::new_v4(),
            doc_id: Some(doc),
            text: "t".to_string(),
            page_start: Some(page),
            page_end: Some(page),
            content_type: ContentType::Text,
            image_path: None,
            lex,
            vec,
            ce,
            embedding: None,
        }
    }

    #[test]
    fn test_score_summaries() {
        let doc = Uuid::new_v4();
        let chunks = vec![chunk(doc, 1, 0.2, 0.4, 0.0), chunk(doc, 2, 0.8, 0.6, 0.0)];
        let diag = diagnose("q", &chunks);
        assert_eq!(diag.total_chunks, 2);
        assert!((diag.lex.min - 0.2).abs() < 1e-6);
        assert!((diag.lex.max - 0.8).abs() < 1e-6);
        assert!((diag.vec.mean - 0.5).abs() < 1e-6);
        assert!(!diag.reranker_active);
    }

    #[test]
    fn test_doc_breakdown_sorted_by_chunk_count() {
        let big = Uuid::new_v4();
        let small = Uuid::new_v4();
        let chunks = vec![
            chunk(small, 1, 0.1, 0.1, 0.0),
            chunk(big, 1, 0.1, 0.1, 0.5),
            chunk(big, 3, 0.1, 0.9, 0.2),
        ];
        let diag = diagnose("q", &chunks);
        assert_eq!(diag.documents.len(), 2);
        assert_eq!(diag.documents[0].doc_id, big);
        assert_eq!(diag.documents[0].chunks, 2);
        assert_eq!(diag.documents[0].pages, vec![1, 3]);
        assert!((diag.documents[0].best_ce - 0.5).abs() < 1e-6);
        assert!((diag.documents[0].best_vec - 0.9).abs() < 1e-6);
        assert!(diag.reranker_active);
    }

    #[test]
    fn test_empty_result_report() {
        let diag = diagnose("nothing", &[]);
        assert_eq!(diag.total_chunks, 0);
        let report = diag.to_report();
        assert!(report.contains("Query: nothing"));
        assert!(report.contains("0 document(s)"));
    }
}
