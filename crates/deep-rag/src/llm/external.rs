//! External HTTP LLM providers: OpenAI-compatible endpoints, Anthropic,
//! and Gemini.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value as JsonValue};

use super::LlmProvider;
use crate::error::{RagError, Result};

#[derive(Debug, Clone)]
pub enum ApiProvider {
    OpenAi,
    Anthropic,
    Gemini,
    OpenRouter,
    Ollama,
    Custom { endpoint: String },
}

pub struct ExternalProvider {
    provider: ApiProvider,
    api_key: String,
    model: String,
    client: Client,
}

impl ExternalProvider {
    pub fn new(provider: ApiProvider, api_key: String, model: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(15))
            .timeout(std::time::Duration::from_secs(300))
            .pool_idle_timeout(std::time::Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RagError::LlmUnavailable(format!("http client: {}", e)))?;

        Ok(Self {
            provider,
            api_key,
            model,
            client,
        })
    }

    fn endpoint(&self) -> String {
        match &self.provider {
            ApiProvider::OpenAi => "https://api.openai.com/v1/chat/completions".to_string(),
            ApiProvider::Anthropic => "https://api.anthropic.com/v1/messages".to_string(),
            ApiProvider::Gemini => format!(
                "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
                self.model
            ),
            ApiProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            ApiProvider::Ollama => "http://localhost:11434/v1/chat/completions".to_string(),
            ApiProvider::Custom { endpoint } => endpoint.clone(),
        }
    }

    /// Parse a response body as JSON, with a clear error when the server
    /// answered with an HTML error page instead.
    async fn parse_json_response(response: reqwest::Response, endpoint: &str) -> Result<JsonValue> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RagError::LlmUnavailable(format!("reading body from {}: {}", endpoint, e)))?;

        let trimmed = body.trim_start();
        if trimmed.starts_with('<') {
            let preview: String = trimmed.chars().take(200).collect();
            return Err(RagError::LlmUnavailable(format!(
                "{} returned HTML instead of JSON (HTTP {}): {}",
                endpoint, status, preview
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            let preview: String = body.chars().take(300).collect();
            RagError::LlmUnavailable(format!(
                "bad JSON from {} (HTTP {}): {}. Body: {}",
                endpoint, status, e, preview
            ))
        })
    }

    async fn openai_compatible_generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        let endpoint = self.endpoint();
        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let mut request = self.client.post(&endpoint).json(&payload);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RagError::LlmUnavailable(format!("request to {}: {}", endpoint, e)))?;
        let body = Self::parse_json_response(response, &endpoint).await?;

        body["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                RagError::LlmUnavailable(format!(
                    "no completion content in response from {}",
                    endpoint
                ))
            })
    }

    async fn anthropic_generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        let endpoint = self.endpoint();
        let payload = json!({
            "model": self.model,
            "system": system,
            "messages": [{"role": "user", "content": user}],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await
            .map_err(|e| RagError::LlmUnavailable(format!("request to {}: {}", endpoint, e)))?;
        let body = Self::parse_json_response(response, &endpoint).await?;

        body["content"][0]["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                RagError::LlmUnavailable(format!("no content text in response from {}", endpoint))
            })
    }

    async fn gemini_generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        let endpoint = self.endpoint();
        let payload = json!({
            "systemInstruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": [{"text": user}]}],
            "generationConfig": {
                "maxOutputTokens": max_tokens,
                "temperature": temperature,
            },
        });

        let response = self
            .client
            .post(&endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&payload)
            .send()
            .await
            .map_err(|e| RagError::LlmUnavailable(format!("request to {}: {}", endpoint, e)))?;
        let body = Self::parse_json_response(response, &endpoint).await?;

        body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                RagError::LlmUnavailable(format!("no candidate text in response from {}", endpoint))
            })
    }
}

#[async_trait]
impl LlmProvider for ExternalProvider {
    async fn generate(
        &self,
        system: &str,
        user: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<String> {
        match &self.provider {
            ApiProvider::Gemini => {
                self.gemini_generate(system, user, max_tokens, temperature).await
            }
            ApiProvider::Anthropic => {
                self.anthropic_generate(system, user, max_tokens, temperature).await
            }
            ApiProvider::OpenAi
            | ApiProvider::OpenRouter
            | ApiProvider::Ollama
            | ApiProvider::Custom { .. } => {
                self.openai_compatible_generate(system, user, max_tokens, temperature)
                    .await
            }
        }
    }
}
