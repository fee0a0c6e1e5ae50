//! Post-ingestion visibility wait.
//!
//! Callers that query immediately after ingesting can poll until the new
//! document's chunks are visible to retrieval, bounding the wait.

use std::time::Duration;

use uuid::Uuid;

use super::ChunkStore;
use crate::error::{RagError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Poll the store until `doc_id` has at least `min_chunks` visible chunks
/// or the timeout elapses. Returns the observed chunk count.
pub async fn wait_for_chunks(
    store: &dyn ChunkStore,
    doc_id: Uuid,
    min_chunks: usize,
    timeout: Duration,
) -> Result<usize> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let count = store.chunk_count(Some(doc_id)).await?;
        if count >= min_chunks {
            return Ok(count);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(RagError::Store(format!(
                "timed out waiting for chunks of document {} ({} of {} visible)",
                doc_id, count, min_chunks
            )));
        }
        tracing::debug!(doc_id = %doc_id, count, min_chunks, "waiting for chunks");
        tokio::time::sleep(POLL_INTERVAL.min(timeout)).await;
    }
}
