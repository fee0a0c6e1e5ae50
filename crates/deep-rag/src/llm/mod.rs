//! LLM provider abstraction.
//!
//! The pipeline only needs one operation: generate text from a system and
//! a user prompt. Providers are external HTTP APIs; local inference is out
//! of scope. All pipeline call sites go through [`retry::call_llm`], which
//! applies the retry budget and converts exhaustion into `LlmUnavailable`.

pub mod external;
pub mod retry;

pub use external::{ApiProvider, ExternalProvider};
pub use retry::call_llm;

use async_trait::async_trait;

use crate::config::LlmConfig;
use crate::error::{RagError, Result};

#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String>;
}

/// Build a provider from configuration.
pub fn provider_from_config(config: &LlmConfig) -> Result<ExternalProvider> {
    let provider = match config.provider.as_str() {
        "openai" => ApiProvider::OpenAi,
        "anthropic" => ApiProvider::Anthropic,
        "gemini" => ApiProvider::Gemini,
        "openrouter" => ApiProvider::OpenRouter,
        "ollama" => ApiProvider::Ollama,
        "custom" => {
            let endpoint = config.endpoint.clone().ok_or_else(|| {
                RagError::Config("LLM_ENDPOINT is required for the custom provider".to_string())
            })?;
            ApiProvider::Custom { endpoint }
        }
        other => {
            return Err(RagError::Config(format!(
                "unsupported LLM provider '{}' (supported: openai, anthropic, gemini, openrouter, ollama, custom)",
                other
            )))
        }
    };
    ExternalProvider::new(provider, config.api_key.clone(), config.model.clone())
}
