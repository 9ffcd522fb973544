use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::types::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, Message};
use crate::config::{LlmConfig, RequestConfig};
use crate::error::{LlmError, LlmResult};

/// Client for an OpenAI-compatible chat completions API.
///
/// Every call is a single attempt; retries and circuit breaking are composed by
/// the caller through [`crate::resilience`].
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: String,
    timeout_ms: u64,
}

impl LlmClient {
    /// Create a new client. Returns `Ok(None)` when no API key is configured.
    pub fn from_config(
        config: &LlmConfig,
        request_config: &RequestConfig,
    ) -> LlmResult<Option<Self>> {
        match &config.api_key {
            Some(key) => Self::new(config, key, request_config).map(Some),
            None => Ok(None),
        }
    }

    pub fn new(config: &LlmConfig, api_key: &str, request_config: &RequestConfig) -> LlmResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(LlmError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Run a chat completion and return the raw response.
    pub async fn chat(&self, request: &ChatRequest) -> LlmResult<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            model = %request.model,
            messages = request.messages.len(),
            "Calling chat completions"
        );

        let start = Instant::now();
        let response: ChatResponse = self.post_json(&url, request).await?;
        info!(
            model = %request.model,
            latency_ms = start.elapsed().as_millis() as u64,
            "Chat completion succeeded"
        );
        Ok(response)
    }

    /// Convenience wrapper: system prompt + user message, returns the reply text.
    pub async fn complete(&self, system: &str, user: &str, json_output: bool) -> LlmResult<String> {
        let mut request = ChatRequest::new(
            self.model.clone(),
            vec![Message::system(system), Message::user(user)],
        )
        .with_temperature(0.2)
        .with_max_tokens(800);
        if json_output {
            request = request.with_json_output();
        }

        let response = self.chat(&request).await?;
        response
            .content()
            .map(str::to_string)
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "Response contained no choices".to_string(),
            })
    }

    /// Embed a text with the configured embedding model.
    pub async fn embed(&self, input: &str) -> LlmResult<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model: self.embedding_model.clone(),
            input: input.to_string(),
        };

        let response: EmbeddingResponse = self.post_json(&url, &request).await?;
        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::InvalidResponse {
                message: "Embedding response contained no data".to_string(),
            })
    }

    async fn post_json<B, R>(&self, url: &str, body: &B) -> LlmResult<R>
    where
        B: serde::Serialize + ?Sized,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    LlmError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Whether an LLM error is worth retrying: timeouts, transport errors, 429 and 5xx.
pub fn is_retryable(err: &LlmError) -> bool {
    match err {
        LlmError::Timeout { .. } | LlmError::Http(_) => true,
        LlmError::Api { status, .. } => *status == 429 || *status >= 500,
        LlmError::InvalidResponse { .. } => false,
    }
}
