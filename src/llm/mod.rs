//! Completion backend abstraction and settings.
//!
//! The gateway delegates all generation to one OpenAI-compatible endpoint.
//! [`CompletionBackend`] is the seam: the router and executor only ever see
//! "an ordered list of (role, text) pairs in, generated text plus token
//! usage out", which keeps the HTTP layer testable with a scripted backend.

pub mod chat_completions;

pub use chat_completions::ChatCompletionsBackend;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::messages::ChatMessage;

/// Backend connection and model settings, loaded once at startup.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// Base URL for the backend API (e.g. `http://localhost:1234`).
    pub base_url: String,
    /// Optional API key for bearer authentication.
    pub api_key: Option<String>,
    /// Model identifier passed through on every request.
    pub model: String,
    /// Name of the single agent definition this gateway serves.
    pub agent_name: String,
    /// Upstream request timeout.
    pub timeout: Duration,
}

/// Sampling parameters forwarded to the backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Token-usage counters reported by the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A successful generation.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Result of the backend health probe. Never an error: an unreachable
/// backend is reported as unhealthy, not as a failure of the probe itself.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,
    pub models: Vec<String>,
}

/// The external collaborator the gateway delegates generation to.
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Generate a completion for an ordered list of role-tagged pairs.
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure, timeout, or a malformed
    /// upstream response. The caller turns this into a `fail` transition.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &SamplingParams,
    ) -> anyhow::Result<Completion>;

    /// Probe backend availability and the model names it advertises.
    async fn health(&self) -> BackendHealth;
}
