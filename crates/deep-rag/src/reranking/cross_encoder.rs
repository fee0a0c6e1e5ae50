//! Cross-encoder reranker over ONNX Runtime (bge-reranker-base class).
//!
//! Candidates are scored in padded batches: one session run per group of
//! [`MAX_BATCH`] (query, text) pairs rather than one run per pair, which
//! keeps reranking cheap even at the full MMR pool width.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::Mutex;

use super::Reranker;
use crate::error::{RagError, Result};

/// Pairs scored per session run.
const MAX_BATCH: usize = 16;

static GLOBAL: OnceLock<Arc<CrossEncoderReranker>> = OnceLock::new();

/// Token ids, attention mask, and type ids for one encoded pair.
struct EncodedPair {
    ids: Vec<i64>,
    mask: Vec<i64>,
    type_ids: Vec<i64>,
}

pub struct CrossEncoderReranker {
    session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    max_length: usize,
}

impl CrossEncoderReranker {
    pub fn new(model_dir: &Path) -> Result<Self> {
        let model_path = Self::locate_model(model_dir)?;

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            RagError::EmbeddingFailed(format!(
                "reranker tokenizer missing or unreadable at {}: {:?}",
                tokenizer_path.display(),
                e
            ))
        })?;

        let bytes = std::fs::read(&model_path)
            .map_err(|e| RagError::EmbeddingFailed(format!("failed to read reranker: {}", e)))?;
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.commit_from_memory(&bytes))
            .map_err(|e| RagError::EmbeddingFailed(format!("reranker session: {:?}", e)))?;

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            max_length: 512,
        })
    }

    /// Shared process-wide instance, lazily constructed. Unlike the
    /// embedding model, absence is not fatal: the caller logs and
    /// continues without reranking.
    pub fn global(model_dir: &Path) -> Result<Arc<Self>> {
        if let Some(existing) = GLOBAL.get() {
            return Ok(existing.clone());
        }
        let reranker = Arc::new(Self::new(model_dir)?);
        let _ = GLOBAL.set(reranker.clone());
        Ok(GLOBAL.get().cloned().unwrap_or(reranker))
    }

    /// Pick an ONNX export from the model directory, preferring optimized
    /// variants when several are present.
    fn locate_model(model_dir: &Path) -> Result<PathBuf> {
        let mut exports: Vec<PathBuf> = std::fs::read_dir(model_dir)
            .map_err(|e| {
                RagError::EmbeddingFailed(format!(
                    "cannot read reranker dir {}: {}",
                    model_dir.display(),
                    e
                ))
            })?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "onnx"))
            .collect();

        if exports.is_empty() {
            return Err(RagError::EmbeddingFailed(format!(
                "no .onnx export found in {}",
                model_dir.display()
            )));
        }

        // Optimized exports sort first, then plain "model.onnx", then the
        // rest alphabetically.
        exports.sort_by_key(|p| {
            let name = p
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let rank = if name.contains("_O") || name.contains("quant") {
                0
            } else if name == "model.onnx" {
                1
            } else {
                2
            };
            (rank, name)
        });
        Ok(exports.remove(0))
    }

    fn encode_pair(&self, query: &str, text: &str) -> Result<EncodedPair> {
        let encoding = self
            .tokenizer
            .encode((query, text), true)
            .map_err(|e| RagError::EmbeddingFailed(format!("pair tokenization: {:?}", e)))?;

        let take = encoding.get_ids().len().min(self.max_length);
        let to_i64 = |values: &[u32]| values[..take].iter().map(|&v| v as i64).collect::<Vec<_>>();

        Ok(EncodedPair {
            ids: to_i64(encoding.get_ids()),
            mask: to_i64(encoding.get_attention_mask()),
            type_ids: to_i64(encoding.get_type_ids()),
        })
    }

    /// Score one batch of pairs in a single session run. Pairs are padded
    /// to the longest sequence in the batch.
    fn run_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let pairs: Vec<EncodedPair> = texts
            .iter()
            .map(|text| self.encode_pair(query, text))
            .collect::<Result<_>>()?;
        let padded_len = pairs.iter().map(|p| p.ids.len()).max().unwrap_or(1).max(1);

        let rows = pairs.len();
        let mut ids_flat = Vec::with_capacity(rows * padded_len);
        let mut mask_flat = Vec::with_capacity(rows * padded_len);
        let mut type_flat = Vec::with_capacity(rows * padded_len);
        for pair in &pairs {
            let pad = padded_len - pair.ids.len();
            ids_flat.extend_from_slice(&pair.ids);
            ids_flat.extend(std::iter::repeat(0i64).take(pad));
            mask_flat.extend_from_slice(&pair.mask);
            mask_flat.extend(std::iter::repeat(0i64).take(pad));
            type_flat.extend_from_slice(&pair.type_ids);
            type_flat.extend(std::iter::repeat(0i64).take(pad));
        }

        let shape = vec![rows, padded_len];
        let input_ids = Value::from_array((shape.clone(), ids_flat))
            .map_err(|e| RagError::EmbeddingFailed(format!("input_ids: {:?}", e)))?;
        let attention_mask = Value::from_array((shape.clone(), mask_flat))
            .map_err(|e| RagError::EmbeddingFailed(format!("attention_mask: {:?}", e)))?;
        let token_type_ids = Value::from_array((shape, type_flat))
            .map_err(|e| RagError::EmbeddingFailed(format!("token_type_ids: {:?}", e)))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
            "token_type_ids" => token_type_ids,
        ];

        let mut session = self.session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| RagError::EmbeddingFailed(format!("reranker inference: {:?}", e)))?;

        let (logits_shape, data) = outputs["logits"]
            .try_extract_tensor::<f32>()
            .map_err(|e| RagError::EmbeddingFailed(format!("logits extraction: {:?}", e)))?;

        // Relevance is the first logit of each row, whether the head
        // emits [rows], [rows, 1], or a wider classification shape.
        let out_rows = logits_shape.first().copied().unwrap_or(0) as usize;
        if out_rows != rows || data.len() < rows {
            return Err(RagError::EmbeddingFailed(format!(
                "reranker returned {} logit rows for {} pairs",
                out_rows, rows
            )));
        }
        let stride = (data.len() / rows).max(1);
        Ok((0..rows).map(|row| data[row * stride]).collect())
    }
}

impl Reranker for CrossEncoderReranker {
    fn score(&self, query: &str, text: &str) -> Result<f32> {
        let scores = self.run_batch(query, &[text])?;
        scores.into_iter().next().ok_or_else(|| {
            RagError::EmbeddingFailed("reranker returned no score for pair".to_string())
        })
    }

    /// One padded session run per [`MAX_BATCH`] candidates.
    fn score_batch(&self, query: &str, texts: &[&str]) -> Result<Vec<f32>> {
        let mut scores = Vec::with_capacity(texts.len());
        for group in texts.chunks(MAX_BATCH) {
            scores.extend(self.run_batch(query, group)?);
        }
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"x").unwrap();
    }

    #[test]
    fn test_locate_model_prefers_optimized_export() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(dir.path(), "model.onnx");
        touch(dir.path(), "model_O4.onnx");
        touch(dir.path(), "notes.txt");

        let picked = CrossEncoderReranker::locate_model(dir.path()).unwrap();
        assert_eq!(picked.file_name().unwrap(), "model_O4.onnx");
    }

    #[test]
    fn test_locate_model_falls_back_to_plain_export() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(dir.path(), "model.onnx");
        touch(dir.path(), "extra.onnx");

        let picked = CrossEncoderReranker::locate_model(dir.path()).unwrap();
        assert_eq!(picked.file_name().unwrap(), "model.onnx");
    }

    #[test]
    fn test_locate_model_errors_without_exports() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(dir.path(), "tokenizer.json");
        let err = CrossEncoderReranker::locate_model(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no .onnx export"));
    }
}
