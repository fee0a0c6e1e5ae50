//! Retry wrapper for LLM calls: exponential backoff, then `LlmUnavailable`.

use super::LlmProvider;
use crate::config::LlmConfig;
use crate::error::{RagError, Result};

/// Call the provider with the configured retry budget. Backoff doubles on
/// each attempt starting from `retry_backoff_secs`.
pub async fn call_llm(
    provider: &dyn LlmProvider,
    config: &LlmConfig,
    system: &str,
    user: &str,
    max_tokens: usize,
    temperature: Option<f32>,
) -> Result<String> {
    let temperature = temperature.unwrap_or(config.temperature);
    let retries = config.max_retries.max(1);
    let mut last_err: Option<RagError> = None;

    for attempt in 1..=retries {
        match provider.generate(system, user, max_tokens, temperature).await {
            Ok(text) => return Ok(text.trim().to_string()),
            Err(e) => {
                tracing::warn!(attempt, retries, error = %e, "LLM call failed");
                last_err = Some(e);
                if attempt < retries {
                    let backoff = config.retry_backoff_secs * 2f32.powi(attempt as i32 - 1);
                    tokio::time::sleep(std::time::Duration::from_secs_f32(backoff)).await;
                }
            }
        }
    }

    Err(RagError::LlmUnavailable(format!(
        "LLM call failed after {} attempts: {}",
        retries,
        last_err.map(|e| e.to_string()).unwrap_or_default()
    )))
}
