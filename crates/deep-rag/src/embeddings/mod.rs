pub mod clip;

pub use clip::{ClipConfig, ClipEmbeddings};

use crate::error::{RagError, Result};

/// Preprocessed image pixels ready for the vision encoder: CHW float32,
/// already resized and normalized. Decoding and preprocessing happen in the
/// ingestion collaborators, not here.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub pixels: Vec<f32>,
    pub width: usize,
    pub height: usize,
}

impl ImageInput {
    pub fn new(pixels: Vec<f32>, width: usize, height: usize) -> Result<Self> {
        if pixels.len() != 3 * width * height {
            return Err(RagError::EmbeddingFailed(format!(
                "pixel buffer has {} values, expected {} for {}x{} RGB",
                pixels.len(),
                3 * width * height,
                width,
                height
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
        })
    }

    /// Build from a CHW ndarray, the shape image decoders usually hand
    /// over after preprocessing.
    pub fn from_array(pixels: ndarray::Array3<f32>) -> Result<Self> {
        let (channels, height, width) = pixels.dim();
        if channels != 3 {
            return Err(RagError::EmbeddingFailed(format!(
                "expected 3 channels (CHW), got {}",
                channels
            )));
        }
        let buffer = pixels
            .as_standard_layout()
            .iter()
            .copied()
            .collect::<Vec<f32>>();
        Self::new(buffer, width, height)
    }
}

/// Shared-space embedding model. Text and image embeddings live in the
/// same space so multimodal inputs can be averaged.
pub trait EmbeddingModel: Send + Sync {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts. The default implementation loops; encoders
    /// with real batch support override it.
    fn embed_texts(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }

    fn embed_image(&self, image: &ImageInput) -> Result<Vec<f32>>;

    /// Mean of the text and image embeddings, re-normalized.
    fn embed_multimodal(&self, text: &str, image: &ImageInput) -> Result<Vec<f32>> {
        let text_emb = self.embed_text(text)?;
        let image_emb = self.embed_image(image)?;
        let combined: Vec<f32> = text_emb
            .iter()
            .zip(image_emb.iter())
            .map(|(t, i)| (t + i) / 2.0)
            .collect();
        Ok(l2_normalize(combined))
    }

    fn dimension(&self) -> usize;
}

/// Normalize a vector to unit length. Near-zero vectors are returned as-is.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
