//! Append-only JSONL audit log: per-request interactions and per-node
//! progress steps.
//!
//! Writes are mutex-serialized appends; non-finite floats are nulled
//! before serialization so every line stays valid JSON.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    /// One pipeline request, logged once on completion or failure.
    Interaction {
        user_id: String,
        thread_id: String,
        query_text: Option<String>,
        doc_ids: Vec<Uuid>,
        final_answer: Option<String>,
        graphstate: Option<JsonValue>,
        ingestion_meta: Option<JsonValue>,
        entry_point: Option<String>,
        pipeline_type: Option<String>,
        cross_doc: bool,
        metadata: Option<JsonValue>,
        created_at: i64,
        completed_at: i64,
    },
    /// One node-level progress record.
    Step {
        thread_id: String,
        node: String,
        action: String,
        confidence: Option<f32>,
        iterations: Option<u32>,
        metadata: Option<JsonValue>,
        created_at: i64,
    },
}

pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RagError::Io(format!("failed to create audit dir: {}", e)))?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    pub fn log_step(
        &self,
        thread_id: &str,
        node: &str,
        action: &str,
        confidence: Option<f32>,
        iterations: Option<u32>,
        metadata: Option<JsonValue>,
    ) {
        let record = AuditRecord::Step {
            thread_id: thread_id.to_string(),
            node: node.to_string(),
            action: action.to_string(),
            confidence,
            iterations,
            metadata,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.append(&record);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_interaction(
        &self,
        user_id: &str,
        thread_id: &str,
        query_text: Option<&str>,
        doc_ids: &[Uuid],
        final_answer: Option<&str>,
        graphstate: Option<JsonValue>,
        cross_doc: bool,
        metadata: Option<JsonValue>,
    ) {
        let now = chrono::Utc::now().timestamp();
        let record = AuditRecord::Interaction {
            user_id: user_id.to_string(),
            thread_id: thread_id.to_string(),
            query_text: query_text.map(str::to_string),
            doc_ids: doc_ids.to_vec(),
            final_answer: final_answer.map(str::to_string),
            graphstate,
            ingestion_meta: None,
            entry_point: Some("core".to_string()),
            pipeline_type: Some("graph".to_string()),
            cross_doc,
            metadata,
            created_at: now,
            completed_at: now,
        };
        self.append(&record);
    }

    fn append(&self, record: &AuditRecord) {
        let Ok(value) = serde_json::to_value(record) else {
            tracing::warn!("audit record not serializable; dropping");
            return;
        };
        let value = scrub_non_finite(value);
        let Ok(line) = serde_json::to_string(&value) else {
            return;
        };

        let _guard = self.writer.lock();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", line));
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %self.path.display(), "audit append failed");
        }
    }

    fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let _guard = self.writer.lock();
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(RagError::Io(e.to_string())),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str::<AuditRecord>(line).ok())
            .collect())
    }

    /// Read back every record for a thread, oldest first.
    pub fn records_for_thread(&self, thread_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|record| match record {
                AuditRecord::Interaction { thread_id: t, .. } => t == thread_id,
                AuditRecord::Step { thread_id: t, .. } => t == thread_id,
            })
            .collect())
    }

    /// Most recent interactions across all threads, newest first.
    pub fn recent_interactions(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut interactions: Vec<AuditRecord> = self
            .read_all()?
            .into_iter()
            .filter(|r| matches!(r, AuditRecord::Interaction { .. }))
            .collect();
        interactions.reverse();
        interactions.truncate(limit);
        Ok(interactions)
    }

    /// The final answer most recently recorded for a thread, if any.
    pub fn latest_answer(&self, thread_id: &str) -> Result<Option<String>> {
        Ok(self
            .records_for_thread(thread_id)?
            .into_iter()
            .rev()
            .find_map(|record| match record {
                AuditRecord::Interaction { final_answer, .. } => final_answer,
                AuditRecord::Step { .. } => None,
            }))
    }
}

/// Replace NaN/Inf numbers with null recursively; JSON has no spelling
/// for them and a single bad float must not poison the log line.
fn scrub_non_finite(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Number(n) => {
            if n.as_f64().map_or(false, |f| !f.is_finite()) {
                JsonValue::Null
            } else {
                JsonValue::Number(n)
            }
        }
        JsonValue::Array(items) => {
            JsonValue::Array(items.into_iter().map(scrub_non_finite).collect())
        }
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter().map(|(k, v)| (k, scrub_non_finite(v))).collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_steps_and_interactions_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl")).unwrap();

        log.log_step("t1", "planner", "plan_generation", None, Some(0), None);
        log.log_step("t1", "critic", "evaluate", Some(0.5), Some(1), None);
        log.log_step("t2", "planner", "plan_generation", None, Some(0), None);
        log.log_interaction("u1", "t1", Some("question"), &[], Some("answer"), None, false, None);

        let t1 = log.records_for_thread("t1").unwrap();
        assert_eq!(t1.len(), 3);
        let t2 = log.records_for_thread("t2").unwrap();
        assert_eq!(t2.len(), 1);
    }

    #[test]
    fn test_recent_interactions_newest_first() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl")).unwrap();
        log.log_interaction("u", "t1", Some("first"), &[], Some("a1"), None, false, None);
        log.log_interaction("u", "t2", Some("second"), &[], Some("a2"), None, false, None);

        let recent = log.recent_interactions(1).unwrap();
        assert_eq!(recent.len(), 1);
        match &recent[0] {
            AuditRecord::Interaction { thread_id, .. } => assert_eq!(thread_id, "t2"),
            _ => panic!("expected an interaction record"),
        }
    }

    #[test]
    fn test_latest_answer_for_thread() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl")).unwrap();
        log.log_interaction("u", "t1", Some("q"), &[], Some("old"), None, false, None);
        log.log_interaction("u", "t1", Some("q"), &[], Some("new"), None, false, None);

        assert_eq!(log.latest_answer("t1").unwrap().as_deref(), Some("new"));
        assert!(log.latest_answer("missing").unwrap().is_none());
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl")).unwrap();
        assert!(log.records_for_thread("none").unwrap().is_empty());
    }

    #[test]
    fn test_scrub_non_finite() {
        let value = serde_json::json!({"a": 1.0, "b": [2.0, 3.0]});
        let scrubbed = scrub_non_finite(value.clone());
        assert_eq!(scrubbed, value);
    }
}
