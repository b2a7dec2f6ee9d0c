//! The single agent definition this gateway serves, and the run executor.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::RunError;
use crate::llm::{BackendSettings, CompletionBackend, SamplingParams};
use crate::messages::{self, Message};
use crate::runs::RunTracker;

/// Descriptor for an agent definition as exposed on `/agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub name: String,
    pub description: String,
}

impl AgentDescriptor {
    /// The gateway serves exactly one agent, named in the backend settings.
    #[must_use]
    pub fn from_settings(settings: &BackendSettings) -> Self {
        Self {
            name: settings.agent_name.clone(),
            description: format!("Chat agent backed by the {} model", settings.model),
        }
    }
}

/// Drive one run to a terminal status.
///
/// Transitions the run to `in-progress`, converts the inbound envelopes,
/// calls the backend, and records the result. The tracker's lock is only
/// held for the transitions themselves, never across the backend await.
///
/// A transition rejection after the backend call means the run reached a
/// terminal status while the call was in flight (cancellation is
/// fire-and-forget bookkeeping); the terminal state wins and the result is
/// dropped.
#[instrument(skip_all, fields(run_id = %run_id, agent = %agent_name))]
pub async fn execute_run(
    tracker: RunTracker,
    backend: Arc<dyn CompletionBackend>,
    run_id: String,
    agent_name: String,
    input: Vec<Message>,
    params: SamplingParams,
) {
    if let Err(err) = tracker.begin(&run_id) {
        tracing::warn!(%err, "run not started");
        return;
    }

    let chat = messages::to_backend(&input);
    match backend.complete(&chat, &params).await {
        Ok(completion) => {
            tracing::info!(
                prompt_tokens = completion.usage.prompt_tokens,
                completion_tokens = completion.usage.completion_tokens,
                "backend completion succeeded"
            );
            let output = vec![messages::from_backend(&completion.content, &agent_name)];
            if let Err(err) = tracker.complete(&run_id, output) {
                tracing::debug!(%err, "completion discarded");
            }
        }
        Err(err) => {
            tracing::warn!(%err, "backend completion failed");
            let error = RunError::server_error(err.to_string());
            if let Err(err) = tracker.fail(&run_id, error) {
                tracing::debug!(%err, "failure discarded");
            }
        }
    }
}
