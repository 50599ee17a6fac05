//! OpenAI-compatible HTTP client for completions and embeddings.
//!
//! Retry strategy for both endpoints:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry with
//!   exponential backoff (1s, 2s, 4s, ... capped at 2^5)
//! - HTTP 401/403 → fail immediately as an auth error
//! - Other 4xx → fail immediately
//! - Network errors and timeouts → retry

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::warn;

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionModel, CompletionRequest, CompletionResponse, EmbeddingModel,
};

const PROVIDER: &str = "openai";

/// Client for an OpenAI-compatible API, serving both model capabilities.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    chat_model: String,
    embed_model: String,
    max_retries: u32,
}

impl OpenAiClient {
    /// Build a client from configuration.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.into(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            chat_model: config.chat_model.clone(),
            embed_model: config.embed_model.clone(),
            max_retries: config.max_retries,
        })
    }

    /// POST a JSON body with retry/backoff, returning the parsed response.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, LlmError> {
        let url = format!("{}{path}", self.base_url);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(attempt, delay_secs = delay.as_secs(), url = %url, "Retrying provider call");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(&url)
                .bearer_auth(self.api_key.expose_secret())
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<T>().await.map_err(|e| {
                            LlmError::InvalidResponse {
                                provider: PROVIDER.into(),
                                reason: e.to_string(),
                            }
                        });
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(LlmError::AuthFailed {
                            provider: PROVIDER.into(),
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 {
                        last_err = Some(LlmError::RateLimited {
                            provider: PROVIDER.into(),
                            retry_after: None,
                        });
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(LlmError::RequestFailed {
                            provider: PROVIDER.into(),
                            reason: format!("{status}: {body_text}"),
                        });
                        continue;
                    }

                    // Other client errors are not retryable
                    return Err(LlmError::RequestFailed {
                        provider: PROVIDER.into(),
                        reason: format!("{status}: {body_text}"),
                    });
                }
                Err(e) => {
                    last_err = Some(LlmError::RequestFailed {
                        provider: PROVIDER.into(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| LlmError::RequestFailed {
            provider: PROVIDER.into(),
            reason: "request failed after retries".into(),
        }))
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

fn wire_messages(messages: &[ChatMessage]) -> serde_json::Value {
    serde_json::to_value(messages).unwrap_or_else(|_| serde_json::Value::Array(vec![]))
}

#[async_trait]
impl CompletionModel for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.chat_model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let mut body = serde_json::json!({
            "model": self.chat_model,
            "messages": wire_messages(&request.messages),
        });
        if let Some(t) = request.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }

        let resp: ChatCompletionResponse = self.post_json("/chat/completions", &body).await?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: "no completion choice returned".into(),
            })?;

        let usage = resp.usage.unwrap_or_default();
        Ok(CompletionResponse {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        })
    }
}

#[async_trait]
impl EmbeddingModel for OpenAiClient {
    fn model_name(&self) -> &str {
        &self.embed_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = serde_json::json!({
            "model": self.embed_model,
            "input": text,
        });

        let resp: EmbeddingsResponse = self.post_json("/embeddings", &body).await?;

        resp.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| LlmError::InvalidResponse {
                provider: PROVIDER.into(),
                reason: "empty embedding response".into(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat_completion_wire_format() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": "Olá!"}}],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7}
        }"#;
        let resp: ChatCompletionResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.choices[0].message.content.as_deref(), Some("Olá!"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 42);
    }

    #[test]
    fn parses_embeddings_wire_format() {
        let raw = r#"{"data": [{"embedding": [0.1, -0.2, 0.3], "index": 0}]}"#;
        let resp: EmbeddingsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.data[0].embedding, vec![0.1, -0.2, 0.3]);
    }

    #[test]
    fn wire_messages_shape() {
        let msgs = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let v = wire_messages(&msgs);
        assert_eq!(v[0]["role"], "system");
        assert_eq!(v[1]["content"], "hi");
    }
}
