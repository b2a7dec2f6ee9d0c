//! Agent Gateway
//!
//! A thin HTTP façade exposing a single backing language-model endpoint
//! through a small REST surface, translating between a wire-level "run"
//! abstraction and an upstream chat-completion call.
//!
//! # Architecture
//!
//! - **Server**: Axum-based HTTP surface with an SSE stream mode for run
//!   lifecycle frames
//! - **Run tracker**: in-memory run table with status transitions and
//!   append-only event logs
//! - **Session registry**: groups run ids under caller-defined labels
//! - **Backend**: OpenAI-compatible chat-completions client behind the
//!   [`llm::CompletionBackend`] seam
//!
//! # Modules
//!
//! - [`runs`]: run lifecycle tracker and event log
//! - [`session`]: session registry
//! - [`messages`]: wire envelopes and backend conversion
//! - [`llm`]: completion backend trait and client
//! - [`server`]: REST routes and handlers

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod messages;
pub mod runs;
pub mod server;
pub mod session;
pub mod sse;

use std::sync::Arc;

use agent::AgentDescriptor;
use llm::{BackendSettings, CompletionBackend, SamplingParams};
use runs::RunTracker;
use session::SessionRegistry;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Run lifecycle tracker; single authority for run state.
    pub tracker: RunTracker,
    /// Completion backend the gateway delegates generation to.
    pub backend: Arc<dyn CompletionBackend>,
    /// The single agent definition this gateway serves.
    pub agent: AgentDescriptor,
    /// Sampling parameters forwarded on every backend call.
    pub params: SamplingParams,
}

impl AppState {
    /// Assemble fresh state around the given backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        settings: &BackendSettings,
        params: SamplingParams,
    ) -> Self {
        Self {
            tracker: RunTracker::new(SessionRegistry::new()),
            backend,
            agent: AgentDescriptor::from_settings(settings),
            params,
        }
    }
}
