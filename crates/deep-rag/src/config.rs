use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{RagError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub confidence: ConfidenceConfig,
    pub agent: AgentConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Model identifier, e.g. "openai/clip-vit-large-patch14-336".
    pub model_id: String,
    /// Local cache directory holding the ONNX encoders + tokenizer.
    pub model_dir: PathBuf,
    /// Must equal the encoder output dimension.
    pub dimension: usize,
    /// Hard token budget of the text encoder (77 for CLIP).
    pub max_tokens: usize,
    pub cache_size: usize,
    pub enable_reranker: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Word budget per chunk. Conservative because of the CLIP token limit.
    pub max_words: usize,
    pub overlap_words: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub k: usize,
    pub k_lex: usize,
    pub k_vec: usize,
    pub max_context_chunks: usize,
    pub max_chunks_per_doc: usize,
    pub mmr_lambda: f32,
    /// Reranked candidates considered by MMR.
    pub mmr_pool: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfidenceConfig {
    /// w0 is the bias; w1..w10 weight features f1..f10.
    pub weights: [f32; 11],
    pub abstain_threshold: f32,
    pub clarify_threshold: f32,
    /// Pre-LLM synthesizer gate, percentage.
    pub synth_threshold_default: f32,
    /// Reduced gate when the user scoped to specific documents, percentage.
    pub synth_threshold_explicit: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub max_iters: u32,
    /// Chunk strength threshold used by the critic.
    pub strong_chunk_threshold: f32,
    pub refine_k: usize,
    pub refine_k_lex: usize,
    pub refine_k_vec: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider selector: "openai", "gemini", "ollama", or "custom".
    pub provider: String,
    pub model: String,
    pub api_key: String,
    /// Base endpoint for the "custom" provider.
    pub endpoint: Option<String>,
    pub temperature: f32,
    pub max_retries: u32,
    pub retry_backoff_secs: f32,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl RagConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("RAG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(model) = std::env::var("CLIP_MODEL") {
            config.embedding.model_id = model;
        }
        if let Ok(path) = std::env::var("CLIP_MODEL_PATH") {
            config.embedding.model_dir = PathBuf::from(path);
        }
        config.embedding.dimension = env_or("EMBEDDING_DIM", config.embedding.dimension);

        config.retrieval.k = env_or("K_RETRIEVER", config.retrieval.k);
        config.retrieval.k_lex = env_or("K_LEX", config.retrieval.k_lex);
        config.retrieval.k_vec = env_or("K_VEC", config.retrieval.k_vec);
        config.retrieval.max_context_chunks =
            env_or("MAX_CONTEXT_CHUNKS", config.retrieval.max_context_chunks);
        config.retrieval.max_chunks_per_doc =
            env_or("MAX_CHUNKS_PER_DOC", config.retrieval.max_chunks_per_doc);

        for (i, w) in config.confidence.weights.iter_mut().enumerate() {
            *w = env_or(&format!("CONF_W{}", i), *w);
        }
        config.confidence.abstain_threshold =
            env_or("CONF_ABSTAIN_TH", config.confidence.abstain_threshold);
        config.confidence.clarify_threshold =
            env_or("CONF_CLARIFY_TH", config.confidence.clarify_threshold);
        config.confidence.synth_threshold_default = env_or(
            "SYNTHESIZER_CONFIDENCE_THRESHOLD_DEFAULT",
            config.confidence.synth_threshold_default,
        );
        config.confidence.synth_threshold_explicit = env_or(
            "SYNTHESIZER_CONFIDENCE_THRESHOLD_EXPLICIT_SELECTION",
            config.confidence.synth_threshold_explicit,
        );

        if let Ok(provider) = std::env::var("LLM_PROVIDER") {
            config.llm.provider = provider;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            config.llm.model = model;
        }
        if let Ok(key) = std::env::var("LLM_API_KEY") {
            config.llm.api_key = key;
        }
        if let Ok(endpoint) = std::env::var("LLM_ENDPOINT") {
            config.llm.endpoint = Some(endpoint);
        }
        config.llm.temperature = env_or("LLM_TEMPERATURE", config.llm.temperature);

        config.validate()?;
        Ok(config)
    }

    /// Load config from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RagError::Config(format!("failed to read config file: {}", e)))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| RagError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config values, rejecting clearly broken configurations.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(RagError::Config("embedding.dimension must be > 0".into()));
        }
        if self.embedding.max_tokens == 0 {
            return Err(RagError::Config("embedding.max_tokens must be > 0".into()));
        }
        if self.chunking.max_words == 0 {
            return Err(RagError::Config("chunking.max_words must be > 0".into()));
        }
        if self.chunking.overlap_words >= self.chunking.max_words {
            return Err(RagError::Config(
                "chunking.overlap_words must be < max_words".into(),
            ));
        }
        if self.retrieval.k == 0 || self.retrieval.k_lex == 0 || self.retrieval.k_vec == 0 {
            return Err(RagError::Config("retrieval limits must be > 0".into()));
        }
        if self.retrieval.k > self.retrieval.k_lex + self.retrieval.k_vec {
            return Err(RagError::Config("retrieval.k must be <= k_lex + k_vec".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.mmr_lambda) {
            return Err(RagError::Config("retrieval.mmr_lambda must be in [0, 1]".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence.abstain_threshold)
            || !(0.0..=1.0).contains(&self.confidence.clarify_threshold)
        {
            return Err(RagError::Config(
                "confidence thresholds must be probabilities in [0, 1]".into(),
            ));
        }
        if self.confidence.abstain_threshold > self.confidence.clarify_threshold {
            return Err(RagError::Config(
                "abstain threshold must not exceed clarify threshold".into(),
            ));
        }
        Ok(())
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.data_dir.join("thread_tracking.jsonl")
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("deep-rag");

        let model_dir = if Path::new("models").exists() {
            PathBuf::from("models")
        } else {
            data_dir.join("models")
        };

        Self {
            data_dir,
            embedding: EmbeddingConfig {
                model_id: "openai/clip-vit-large-patch14-336".to_string(),
                model_dir,
                dimension: 768,
                max_tokens: 77,
                cache_size: 1000,
                enable_reranker: true,
            },
            chunking: ChunkingConfig {
                max_words: 25,
                overlap_words: 12,
            },
            retrieval: RetrievalConfig {
                k: 8,
                k_lex: 60,
                k_vec: 60,
                max_context_chunks: 24,
                max_chunks_per_doc: 6,
                mmr_lambda: 0.5,
                mmr_pool: 30,
            },
            confidence: ConfidenceConfig {
                weights: [
                    -0.08, // bias
                    3.0,   // max rerank
                    1.5,   // margin
                    2.2,   // mean cosine
                    -0.3,  // cosine stddev
                    1.0,   // cosine coverage
                    1.5,   // bm25 norm
                    1.4,   // term coverage
                    0.8,   // unique page fraction
                    0.4,   // doc diversity
                    1.4,   // answer overlap
                ],
                abstain_threshold: 0.20,
                clarify_threshold: 0.60,
                synth_threshold_default: 40.0,
                synth_threshold_explicit: 30.0,
            },
            agent: AgentConfig {
                max_iters: 3,
                strong_chunk_threshold: 0.30,
                refine_k: 12,
                refine_k_lex: 72,
                refine_k_vec: 72,
            },
            llm: LlmConfig {
                provider: "gemini".to_string(),
                model: "gemini-1.5-flash".to_string(),
                api_key: String::new(),
                endpoint: None,
                temperature: 0.2,
                max_retries: 8,
                retry_backoff_secs: 2.0,
            },
        }
    }
}
