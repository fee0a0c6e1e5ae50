//! CLIP dual-encoder embeddings over ONNX Runtime.
//!
//! Text and image encoders are separate ONNX sessions sharing one output
//! space. The text side enforces the 77-token CLIP budget with a
//! tokenizer-backed truncation fallback that shrinks the input on each
//! retry. The model is a process-wide lazy singleton whose first
//! initialization runs a self-test; a failing self-test is terminal.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use parking_lot::{Mutex, RwLock};

use super::{l2_normalize, EmbeddingModel, ImageInput};
use crate::error::{RagError, Result};

/// Word budgets tried after a failed encode, most permissive first.
const TRUNCATION_STEPS: &[usize] = &[20, 10, 5];

static GLOBAL: OnceLock<Arc<ClipEmbeddings>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct ClipConfig {
    pub model_dir: PathBuf,
    pub dimension: usize,
    /// Hard token budget of the text encoder.
    pub max_tokens: usize,
    pub cache_size: usize,
}

impl ClipConfig {
    /// Locate the encoder files under a model directory. Expects
    /// `text_model.onnx`, `vision_model.onnx`, and `tokenizer.json`.
    pub fn from_model_dir(model_dir: &Path, dimension: usize, max_tokens: usize) -> Option<Self> {
        let text = model_dir.join("text_model.onnx");
        let vision = model_dir.join("vision_model.onnx");
        let tokenizer = model_dir.join("tokenizer.json");
        if !text.exists() || !vision.exists() || !tokenizer.exists() {
            return None;
        }
        Some(Self {
            model_dir: model_dir.to_path_buf(),
            dimension,
            max_tokens,
            cache_size: 1000,
        })
    }
}

pub struct ClipEmbeddings {
    text_session: Mutex<Session>,
    vision_session: Mutex<Session>,
    tokenizer: tokenizers::Tokenizer,
    config: ClipConfig,
    cache: RwLock<lru::LruCache<u64, Vec<f32>>>,
}

impl ClipEmbeddings {
    pub fn new(config: ClipConfig) -> Result<Self> {
        let text_session = Self::load_session(&config.model_dir.join("text_model.onnx"))?;
        let vision_session = Self::load_session(&config.model_dir.join("vision_model.onnx"))?;

        let tokenizer_path = config.model_dir.join("tokenizer.json");
        let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            RagError::EmbeddingFailed(format!(
                "failed to load tokenizer from {}: {:?}",
                tokenizer_path.display(),
                e
            ))
        })?;

        let cache_size = NonZeroUsize::new(config.cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            text_session: Mutex::new(text_session),
            vision_session: Mutex::new(vision_session),
            tokenizer,
            cache: RwLock::new(lru::LruCache::new(cache_size)),
            config,
        })
    }

    /// Shared process-wide instance. The first call loads the sessions and
    /// runs a self-test; callers propagate a self-test failure out of
    /// engine construction, terminating startup.
    pub fn global(config: &ClipConfig) -> Result<Arc<Self>> {
        if let Some(existing) = GLOBAL.get() {
            return Ok(existing.clone());
        }
        let model = Self::new(config.clone())?;
        model.self_test()?;
        let arc = Arc::new(model);
        // A racing initializer may have won; either instance is equivalent.
        let _ = GLOBAL.set(arc.clone());
        Ok(GLOBAL.get().cloned().unwrap_or(arc))
    }

    fn load_session(path: &Path) -> Result<Session> {
        if !path.exists() {
            return Err(RagError::EmbeddingFailed(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let bytes = std::fs::read(path)
            .map_err(|e| RagError::EmbeddingFailed(format!("failed to read model: {}", e)))?;

        let num_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(num_threads))
            .and_then(|b| b.with_inter_threads(1))
            .and_then(|b| b.commit_from_memory(&bytes))
            .map_err(|e| RagError::EmbeddingFailed(format!("session init: {:?}", e)))
    }

    fn self_test(&self) -> Result<()> {
        let probe = self.embed_text("embedding self test")?;
        if probe.len() != self.config.dimension {
            return Err(RagError::EmbeddingFailed(format!(
                "self-test produced {} dimensions, configured {}",
                probe.len(),
                self.config.dimension
            )));
        }
        tracing::info!(dimension = self.config.dimension, "embedding model self-test passed");
        Ok(())
    }

    fn cache_key(text: &str) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        text.hash(&mut hasher);
        hasher.finish()
    }

    fn encode_ids(&self, text: &str) -> Result<Vec<i64>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| RagError::EmbeddingFailed(format!("tokenization failed: {:?}", e)))?;
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
        if ids.len() > self.config.max_tokens {
            ids.truncate(self.config.max_tokens);
        }
        Ok(ids)
    }

    fn run_text_encoder(&self, ids: &[i64]) -> Result<Vec<f32>> {
        let shape = vec![1usize, ids.len()];
        let input_ids = Value::from_array((shape.clone(), ids.to_vec()))
            .map_err(|e| RagError::EmbeddingFailed(format!("input_ids tensor: {:?}", e)))?;
        let mask: Vec<i64> = vec![1; ids.len()];
        let attention_mask = Value::from_array((shape, mask))
            .map_err(|e| RagError::EmbeddingFailed(format!("attention_mask tensor: {:?}", e)))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
        ];

        let mut session = self.text_session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| RagError::EmbeddingFailed(format!("text inference failed: {:?}", e)))?;
        Self::extract_pooled(&outputs, self.config.dimension)
    }

    fn run_vision_encoder(&self, image: &ImageInput) -> Result<Vec<f32>> {
        let shape = vec![1usize, 3, image.height, image.width];
        let pixel_values = Value::from_array((shape, image.pixels.clone()))
            .map_err(|e| RagError::EmbeddingFailed(format!("pixel_values tensor: {:?}", e)))?;

        let inputs = ort::inputs!["pixel_values" => pixel_values];

        let mut session = self.vision_session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| RagError::EmbeddingFailed(format!("vision inference failed: {:?}", e)))?;
        Self::extract_pooled(&outputs, self.config.dimension)
    }

    /// Pull the pooled embedding from the session output. CLIP exports name
    /// it `text_embeds`/`image_embeds`; fall back to the first 2-D output.
    fn extract_pooled(outputs: &ort::session::SessionOutputs, dimension: usize) -> Result<Vec<f32>> {
        for name in ["text_embeds", "image_embeds", "pooler_output", "sentence_embedding"] {
            let found = outputs.iter().any(|(n, _)| n == name);
            if found {
                if let Ok((shape, data)) = outputs[name].try_extract_tensor::<f32>() {
                    if shape.len() == 2 && shape[1] as usize == dimension {
                        return Ok(data[..dimension].to_vec());
                    }
                }
            }
        }

        for (name, value) in outputs.iter() {
            if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
                if shape.len() == 2 && shape[1] as usize == dimension {
                    tracing::debug!(output = name, "using fallback pooled output");
                    return Ok(data[..dimension].to_vec());
                }
            }
        }

        Err(RagError::EmbeddingFailed(
            "no pooled embedding output found in model outputs".to_string(),
        ))
    }
}

impl ClipEmbeddings {
    /// Batched text encoding: one padded session run per group of
    /// `MAX_BATCH_SIZE` inputs.
    fn run_text_batch(&self, batch: &[Vec<i64>]) -> Result<Vec<Vec<f32>>> {
        let padded_len = batch.iter().map(Vec::len).max().unwrap_or(0);
        if padded_len == 0 {
            return Ok(vec![Vec::new(); batch.len()]);
        }

        let mut ids_flat = Vec::with_capacity(batch.len() * padded_len);
        let mut mask_flat = Vec::with_capacity(batch.len() * padded_len);
        for ids in batch {
            ids_flat.extend_from_slice(ids);
            mask_flat.extend(std::iter::repeat(1i64).take(ids.len()));
            ids_flat.extend(std::iter::repeat(0i64).take(padded_len - ids.len()));
            mask_flat.extend(std::iter::repeat(0i64).take(padded_len - ids.len()));
        }

        let shape = vec![batch.len(), padded_len];
        let input_ids = Value::from_array((shape.clone(), ids_flat))
            .map_err(|e| RagError::EmbeddingFailed(format!("input_ids tensor: {:?}", e)))?;
        let attention_mask = Value::from_array((shape, mask_flat))
            .map_err(|e| RagError::EmbeddingFailed(format!("attention_mask tensor: {:?}", e)))?;

        let inputs = ort::inputs![
            "input_ids" => input_ids,
            "attention_mask" => attention_mask,
        ];

        let mut session = self.text_session.lock();
        let outputs = session
            .run(inputs)
            .map_err(|e| RagError::EmbeddingFailed(format!("batch inference failed: {:?}", e)))?;

        let dimension = self.config.dimension;
        for name in ["text_embeds", "pooler_output", "sentence_embedding"] {
            if !outputs.iter().any(|(n, _)| n == name) {
                continue;
            }
            if let Ok((shape, data)) = outputs[name].try_extract_tensor::<f32>() {
                if shape.len() == 2 && shape[1] as usize == dimension {
                    let mut embeddings = Vec::with_capacity(batch.len());
                    for row in 0..batch.len() {
                        let offset = row * dimension;
                        embeddings.push(l2_normalize(data[offset..offset + dimension].to_vec()));
                    }
                    return Ok(embeddings);
                }
            }
        }
        Err(RagError::EmbeddingFailed(
            "no pooled embedding output found in batch outputs".to_string(),
        ))
    }
}

/// Inputs per batched text-encoder run.
const MAX_BATCH_SIZE: usize = 8;

impl EmbeddingModel for ClipEmbeddings {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let key = Self::cache_key(text);
        if let Some(cached) = self.cache.write().get(&key) {
            return Ok(cached.clone());
        }

        let mut attempt_text = text.to_string();
        let mut last_err: Option<RagError> = None;

        // First attempt at the full (token-truncated) text, then shrink the
        // word budget on each retry.
        for step in std::iter::once(None).chain(TRUNCATION_STEPS.iter().map(|s| Some(*s))) {
            if let Some(max_words) = step {
                let words: Vec<&str> = text.split_whitespace().collect();
                if words.len() <= max_words {
                    continue;
                }
                attempt_text = words[..max_words].join(" ");
                tracing::warn!(
                    from_words = words.len(),
                    to_words = max_words,
                    "retrying text embedding with truncated input"
                );
            }

            match self
                .encode_ids(&attempt_text)
                .and_then(|ids| self.run_text_encoder(&ids))
            {
                Ok(raw) => {
                    let emb = l2_normalize(raw);
                    self.cache.write().put(key, emb.clone());
                    return Ok(emb);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            RagError::EmbeddingFailed("text embedding failed with no attempts".to_string())
        }))
    }

    fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let mut all = Vec::with_capacity(texts.len());
        for group in texts.chunks(MAX_BATCH_SIZE) {
            let ids: Vec<Vec<i64>> = group
                .iter()
                .map(|t| self.encode_ids(t))
                .collect::<Result<_>>()?;
            all.extend(self.run_text_batch(&ids)?);
        }
        Ok(all)
    }

    fn embed_image(&self, image: &ImageInput) -> Result<Vec<f32>> {
        let raw = self.run_vision_encoder(image)?;
        Ok(l2_normalize(raw))
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}
