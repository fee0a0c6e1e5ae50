//! File-backed checkpoint store keyed by thread id.
//!
//! One JSON document per thread. Writes go through a temp file and an
//! atomic rename so a crashed writer never leaves a torn checkpoint;
//! concurrent writers on the same thread id resolve last-writer-wins.

use std::path::PathBuf;

use super::state::PipelineState;
use crate::error::{RagError, Result};

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&dir)
            .map_err(|e| RagError::Checkpoint(format!("failed to create checkpoint dir: {}", e)))?;
        Ok(Self { dir })
    }

    /// Thread ids are caller strings; percent-encode anything that is not
    /// filesystem-safe.
    fn file_for(&self, thread_id: &str) -> PathBuf {
        let mut name = String::with_capacity(thread_id.len());
        for byte in thread_id.bytes() {
            match byte {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                    name.push(byte as char)
                }
                other => name.push_str(&format!("%{:02x}", other)),
            }
        }
        self.dir.join(format!("{}.json", name))
    }

    pub fn load(&self, thread_id: &str) -> Result<Option<PipelineState>> {
        let path = self.file_for(thread_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RagError::Checkpoint(e.to_string())),
        };
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                // A checkpoint that no longer deserializes is dropped, not
                // fatal: the thread restarts from a fresh state.
                tracing::warn!(thread_id, error = %e, "unreadable checkpoint discarded");
                Ok(None)
            }
        }
    }

    pub fn save(&self, thread_id: &str, state: &PipelineState) -> Result<()> {
        let path = self.file_for(thread_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string(state)
            .map_err(|e| RagError::Checkpoint(format!("serialize failed: {}", e)))?;
        std::fs::write(&tmp, json)
            .map_err(|e| RagError::Checkpoint(format!("write failed: {}", e)))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| RagError::Checkpoint(format!("rename failed: {}", e)))?;
        Ok(())
    }

    pub fn delete(&self, thread_id: &str) -> Result<()> {
        let path = self.file_for(thread_id);
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RagError::Checkpoint(e.to_string())),
        }
    }
}
