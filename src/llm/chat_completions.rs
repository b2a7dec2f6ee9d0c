//! OpenAI Chat Completions API backend.
//!
//! Implements [`CompletionBackend`] against `POST /v1/chat/completions`
//! (non-streaming) with a companion `GET /v1/models` health probe.

use anyhow::Context;
use serde::Deserialize;

use crate::messages::ChatMessage;

use super::{BackendHealth, BackendSettings, Completion, CompletionBackend, SamplingParams, Usage};

/// Backend talking to an OpenAI-compatible chat-completions endpoint.
#[derive(Clone)]
pub struct ChatCompletionsBackend {
    http: reqwest::Client,
    settings: BackendSettings,
}

impl std::fmt::Debug for ChatCompletionsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsBackend")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsBackend {
    /// Create a backend with the given settings. The request timeout is
    /// baked into the HTTP client; a timed-out call surfaces as an error
    /// and becomes a `fail` transition upstream.
    #[must_use]
    pub fn new(settings: BackendSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();
        Self { http, settings }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.settings.base_url.trim_end_matches('/'))
    }

    async fn probe_models(&self) -> anyhow::Result<Vec<String>> {
        let mut rb = self.http.get(self.url("/v1/models"));
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }
        let resp = rb.send().await?.error_for_status()?;
        let payload: ModelsResponse = resp.json().await?;
        Ok(payload.data.into_iter().map(|m| m.id).collect())
    }
}

#[async_trait::async_trait]
impl CompletionBackend for ChatCompletionsBackend {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> anyhow::Result<Completion> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "stream": false,
            "messages": messages,
            "temperature": params.temperature,
            "max_tokens": params.max_tokens,
        });

        let mut rb = self.http.post(self.url("/v1/chat/completions")).json(&body);
        if let Some(k) = &self.settings.api_key {
            rb = rb.bearer_auth(k);
        }

        let resp = rb
            .send()
            .await
            .context("chat completions request failed")?
            .error_for_status()
            .context("chat completions returned an error status")?;

        let payload: ChatCompletionsResponse = resp
            .json()
            .await
            .context("malformed chat completions response")?;
        parse_completion(payload)
    }

    async fn health(&self) -> BackendHealth {
        match self.probe_models().await {
            Ok(models) => BackendHealth {
                healthy: true,
                models,
            },
            Err(err) => {
                tracing::warn!(%err, "backend health probe failed");
                BackendHealth {
                    healthy: false,
                    models: Vec::new(),
                }
            }
        }
    }
}

/// Extract content and usage from a decoded response.
fn parse_completion(payload: ChatCompletionsResponse) -> anyhow::Result<Completion> {
    let choice = payload
        .choices
        .into_iter()
        .next()
        .context("chat completions response had no choices")?;
    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        usage: payload.usage.unwrap_or_default(),
    })
}

#[derive(Debug, Deserialize)]
struct ChatCompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_with_usage() {
        let payload: ChatCompletionsResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "4"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
        }))
        .unwrap();

        let completion = parse_completion(payload).unwrap();
        assert_eq!(completion.content, "4");
        assert_eq!(completion.usage.prompt_tokens, 12);
        assert_eq!(completion.usage.total_tokens, 13);
    }

    #[test]
    fn test_parse_completion_missing_usage_defaults_to_zero() {
        let payload: ChatCompletionsResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "hello"}}]
        }))
        .unwrap();

        let completion = parse_completion(payload).unwrap();
        assert_eq!(completion.content, "hello");
        assert_eq!(completion.usage.total_tokens, 0);
    }

    #[test]
    fn test_parse_completion_empty_choices_is_error() {
        let payload: ChatCompletionsResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(parse_completion(payload).is_err());
    }

    #[test]
    fn test_parse_completion_null_content_is_empty_string() {
        let payload: ChatCompletionsResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": null}}]
        }))
        .unwrap();
        assert_eq!(parse_completion(payload).unwrap().content, "");
    }
}
