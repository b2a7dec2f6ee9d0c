//! Run lifecycle tracker: the single authority for run existence, status,
//! and event history.
//!
//! State machine:
//!
//! ```text
//! created --begin--> in-progress --complete--> completed [terminal]
//!                        |  \--fail--> failed [terminal]
//!                        \--await_input--> awaiting --resume--> completed [terminal]
//! created/in-progress/awaiting --cancel--> cancelled [terminal]
//! ```
//!
//! Every edge appends exactly one event; terminal statuses are final.
//! The run table and the per-run event logs live behind one lock inside a
//! cheaply-clonable handle, so tests can instantiate independent trackers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::RunError;
use crate::messages::Message;
use crate::session::SessionRegistry;

/// Broadcast buffer per run. Lifecycle events are few; subscribers that lag
/// this far behind have already lost the plot.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Created,
    InProgress,
    Awaiting,
    /// Reserved for a future asynchronous-cancellation extension; never
    /// produced today. Cancellation jumps straight to `Cancelled`.
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    /// Wire string, matching the serde representation.
    #[must_use]
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::InProgress => "in-progress",
            Self::Awaiting => "awaiting",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal statuses never change again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }
}

/// One tracked request for the backend to produce output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub agent_name: String,
    pub session_id: String,
    pub status: RunStatus,
    /// Present only while `status` is `Awaiting`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub await_request: Option<serde_json::Value>,
    /// Non-empty only when `status` is `Completed`.
    pub output: Vec<Message>,
    /// Present only when `status` is `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub created_at: DateTime<Utc>,
    /// Set exactly once, at the transition into a terminal status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Immutable record of a run-status transition.
///
/// The `type` tag mirrors the new status (`run.created`, `run.completed`,
/// ...) and the event carries a snapshot of the run at that instant. Events
/// for a run are totally ordered by append time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub run: Run,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    fn for_run(run: &Run) -> Self {
        Self {
            event_type: format!("run.{}", run.status.as_wire()),
            run: run.clone(),
            timestamp: Utc::now(),
        }
    }

    /// Whether the embedded snapshot is terminal (ends a stream).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.run.status.is_terminal()
    }
}

/// Errors signalled synchronously to the tracker's caller.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("run {run_id} not found")]
    NotFound { run_id: String },
    #[error("cannot {op} run {run_id} in status {status}", status = .status.as_wire())]
    Conflict {
        run_id: String,
        status: RunStatus,
        op: &'static str,
    },
}

/// Strategy turning a resume payload into run output.
///
/// The awaiting/resume pair is a documented extension point with no baseline
/// producer, so the payload's effect on output stays pluggable. The default
/// produces no output.
pub type ResumeOutput = Box<dyn Fn(&serde_json::Value) -> Vec<Message> + Send + Sync>;

struct RunEntry {
    run: Run,
    events: Vec<RunEvent>,
    tx: broadcast::Sender<RunEvent>,
}

struct RunTrackerInner {
    runs: RwLock<HashMap<String, RunEntry>>,
    sessions: SessionRegistry,
    resume_output: ResumeOutput,
}

/// Handle to the run table. Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct RunTracker {
    inner: Arc<RunTrackerInner>,
}

impl std::fmt::Debug for RunTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTracker")
            .field("runs", &self.inner.runs.read().unwrap().len())
            .finish()
    }
}

impl RunTracker {
    /// Create a tracker registering runs in the given session registry.
    #[must_use]
    pub fn new(sessions: SessionRegistry) -> Self {
        Self::with_resume_output(sessions, Box::new(|_| Vec::new()))
    }

    /// Create a tracker with a custom resume-payload-to-output strategy.
    #[must_use]
    pub fn with_resume_output(sessions: SessionRegistry, resume_output: ResumeOutput) -> Self {
        Self {
            inner: Arc::new(RunTrackerInner {
                runs: RwLock::new(HashMap::new()),
                sessions,
                resume_output,
            }),
        }
    }

    /// The session registry this tracker attaches runs to.
    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Allocate a fresh run under the given (or a new) session.
    ///
    /// Inserts the record with status `created`, appends the `run.created`
    /// event, and registers the run id under the session. The run id and the
    /// session list entry always derive from this single call, which is what
    /// keeps the two in agreement.
    pub fn create(&self, agent_name: &str, session_id: Option<String>) -> Run {
        let run_id = Uuid::new_v4().to_string();
        let session_id = match session_id {
            Some(id) => {
                self.inner.sessions.ensure(&id);
                id
            }
            None => self.inner.sessions.create(),
        };
        self.inner.sessions.attach(&session_id, &run_id);

        let run = Run {
            run_id: run_id.clone(),
            agent_name: agent_name.to_string(),
            session_id: session_id.clone(),
            status: RunStatus::Created,
            await_request: None,
            output: Vec::new(),
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };

        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let mut entry = RunEntry {
            run: run.clone(),
            events: Vec::new(),
            tx,
        };
        Self::append_event(&mut entry);

        let mut runs = self.inner.runs.write().unwrap();
        runs.insert(run_id.clone(), entry);
        drop(runs);

        tracing::info!(run_id = %run_id, session_id = %session_id, agent = %agent_name, "run created");
        run
    }

    /// `created -> in-progress`.
    pub fn begin(&self, run_id: &str) -> Result<Run, TrackerError> {
        self.transition(run_id, "begin", |entry| {
            if entry.run.status != RunStatus::Created {
                return Err(Self::conflict(entry, "begin"));
            }
            entry.run.status = RunStatus::InProgress;
            Ok(())
        })
    }

    /// `in-progress -> completed`; sets output and `finished_at`.
    pub fn complete(&self, run_id: &str, output: Vec<Message>) -> Result<Run, TrackerError> {
        self.transition(run_id, "complete", move |entry| {
            if entry.run.status != RunStatus::InProgress {
                return Err(Self::conflict(entry, "complete"));
            }
            entry.run.status = RunStatus::Completed;
            entry.run.output = output;
            entry.run.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Any non-terminal status `-> failed`; sets error and `finished_at`.
    pub fn fail(&self, run_id: &str, error: RunError) -> Result<Run, TrackerError> {
        self.transition(run_id, "fail", move |entry| {
            if entry.run.status.is_terminal() {
                return Err(Self::conflict(entry, "fail"));
            }
            entry.run.status = RunStatus::Failed;
            entry.run.error = Some(error);
            entry.run.await_request = None;
            entry.run.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Cancel a run. Idempotent: a terminal run is returned unchanged with
    /// no new event. Otherwise the run jumps straight to `cancelled`; the
    /// `cancelling` phase is reserved for interruptible backends.
    pub fn cancel(&self, run_id: &str) -> Result<Run, TrackerError> {
        let mut runs = self.inner.runs.write().unwrap();
        let entry = runs.get_mut(run_id).ok_or_else(|| TrackerError::NotFound {
            run_id: run_id.to_string(),
        })?;

        if entry.run.status.is_terminal() {
            return Ok(entry.run.clone());
        }

        entry.run.status = RunStatus::Cancelled;
        entry.run.await_request = None;
        entry.run.finished_at = Some(Utc::now());
        Self::append_event(entry);
        Ok(entry.run.clone())
    }

    /// `in-progress -> awaiting`; stores the await request payload.
    ///
    /// The baseline execution flow never takes this edge; it exists for
    /// external await triggers and keeps the awaiting/resume pair testable.
    pub fn await_input(
        &self,
        run_id: &str,
        request: serde_json::Value,
    ) -> Result<Run, TrackerError> {
        self.transition(run_id, "await", move |entry| {
            if entry.run.status != RunStatus::InProgress {
                return Err(Self::conflict(entry, "await"));
            }
            entry.run.status = RunStatus::Awaiting;
            entry.run.await_request = Some(request);
            Ok(())
        })
    }

    /// `awaiting -> completed`; output derived from the resume payload via
    /// the tracker's [`ResumeOutput`] strategy.
    pub fn resume(
        &self,
        run_id: &str,
        payload: &serde_json::Value,
    ) -> Result<Run, TrackerError> {
        let output = (self.inner.resume_output)(payload);
        self.transition(run_id, "resume", move |entry| {
            if entry.run.status != RunStatus::Awaiting {
                return Err(Self::conflict(entry, "resume"));
            }
            entry.run.status = RunStatus::Completed;
            entry.run.await_request = None;
            entry.run.output = output;
            entry.run.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Current snapshot of a run.
    #[must_use]
    pub fn get(&self, run_id: &str) -> Option<Run> {
        let runs = self.inner.runs.read().unwrap();
        runs.get(run_id).map(|entry| entry.run.clone())
    }

    /// Ordered event log of a run.
    #[must_use]
    pub fn events(&self, run_id: &str) -> Option<Vec<RunEvent>> {
        let runs = self.inner.runs.read().unwrap();
        runs.get(run_id).map(|entry| entry.events.clone())
    }

    /// Subscribe to events appended after this call.
    #[must_use]
    pub fn subscribe(&self, run_id: &str) -> Option<broadcast::Receiver<RunEvent>> {
        let runs = self.inner.runs.read().unwrap();
        runs.get(run_id).map(|entry| entry.tx.subscribe())
    }

    fn transition<F>(&self, run_id: &str, op: &'static str, apply: F) -> Result<Run, TrackerError>
    where
        F: FnOnce(&mut RunEntry) -> Result<(), TrackerError>,
    {
        let mut runs = self.inner.runs.write().unwrap();
        let entry = runs.get_mut(run_id).ok_or_else(|| TrackerError::NotFound {
            run_id: run_id.to_string(),
        })?;

        apply(entry).inspect_err(|err| {
            tracing::warn!(run_id = %run_id, op, %err, "rejected transition");
        })?;

        Self::append_event(entry);
        tracing::debug!(run_id = %run_id, op, status = entry.run.status.as_wire(), "run transition");
        Ok(entry.run.clone())
    }

    fn append_event(entry: &mut RunEntry) {
        let event = RunEvent::for_run(&entry.run);
        entry.events.push(event.clone());
        // No subscriber is fine; stream mode is optional.
        let _ = entry.tx.send(event);
    }

    fn conflict(entry: &RunEntry, op: &'static str) -> TrackerError {
        TrackerError::Conflict {
            run_id: entry.run.run_id.clone(),
            status: entry.run.status,
            op,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages;

    fn tracker() -> RunTracker {
        RunTracker::new(SessionRegistry::new())
    }

    fn output() -> Vec<Message> {
        vec![messages::from_backend("4", "chat")]
    }

    #[test]
    fn test_create_initial_state() {
        let tracker = tracker();
        let run = tracker.create("chat", Some("s1".to_string()));

        assert_eq!(run.status, RunStatus::Created);
        assert_eq!(run.agent_name, "chat");
        assert_eq!(run.session_id, "s1");
        assert!(run.output.is_empty());
        assert!(run.error.is_none());
        assert!(run.finished_at.is_none());

        let events = tracker.events(&run.run_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "run.created");
    }

    #[test]
    fn test_happy_path_event_log() {
        let tracker = tracker();
        let run = tracker.create("chat", None);

        tracker.begin(&run.run_id).unwrap();
        let done = tracker.complete(&run.run_id, output()).unwrap();

        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.output.len(), 1);
        assert!(done.finished_at.is_some());

        let events = tracker.events(&run.run_id).unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec!["run.created", "run.in-progress", "run.completed"]);

        // Last event snapshot always matches the current status.
        assert_eq!(events.last().unwrap().run.status, RunStatus::Completed);
    }

    #[test]
    fn test_begin_twice_is_conflict() {
        let tracker = tracker();
        let run = tracker.create("chat", None);
        tracker.begin(&run.run_id).unwrap();

        let err = tracker.begin(&run.run_id).unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Conflict {
                status: RunStatus::InProgress,
                ..
            }
        ));
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let tracker = tracker();
        let run = tracker.create("chat", None);

        // Not yet begun.
        assert!(tracker.complete(&run.run_id, output()).is_err());

        tracker.begin(&run.run_id).unwrap();
        tracker.complete(&run.run_id, output()).unwrap();

        // Terminal states are final.
        let err = tracker.complete(&run.run_id, output()).unwrap_err();
        assert!(matches!(err, TrackerError::Conflict { .. }));
        assert_eq!(tracker.events(&run.run_id).unwrap().len(), 3);
    }

    #[test]
    fn test_fail_from_any_non_terminal() {
        let tracker = tracker();

        let a = tracker.create("chat", None);
        tracker
            .fail(&a.run_id, RunError::server_error("boom"))
            .unwrap();
        assert_eq!(tracker.get(&a.run_id).unwrap().status, RunStatus::Failed);

        let b = tracker.create("chat", None);
        tracker.begin(&b.run_id).unwrap();
        let failed = tracker
            .fail(&b.run_id, RunError::server_error("timeout"))
            .unwrap();
        assert_eq!(failed.error.as_ref().unwrap().message, "timeout");
        assert!(failed.finished_at.is_some());

        let events = tracker.events(&b.run_id).unwrap();
        assert_eq!(events.last().unwrap().event_type, "run.failed");

        // Failing a failed run is a conflict, not a second transition.
        assert!(tracker
            .fail(&b.run_id, RunError::server_error("again"))
            .is_err());
    }

    #[test]
    fn test_cancel_is_idempotent_on_terminal() {
        let tracker = tracker();
        let run = tracker.create("chat", None);
        tracker.begin(&run.run_id).unwrap();
        let completed = tracker.complete(&run.run_id, output()).unwrap();

        let events_before = tracker.events(&run.run_id).unwrap().len();
        let cancelled = tracker.cancel(&run.run_id).unwrap();

        assert_eq!(cancelled.status, RunStatus::Completed);
        assert_eq!(cancelled.finished_at, completed.finished_at);
        assert_eq!(cancelled.output.len(), completed.output.len());
        assert_eq!(tracker.events(&run.run_id).unwrap().len(), events_before);
    }

    #[test]
    fn test_cancel_non_terminal() {
        let tracker = tracker();

        for setup in [false, true] {
            let run = tracker.create("chat", None);
            if setup {
                tracker.begin(&run.run_id).unwrap();
            }
            let cancelled = tracker.cancel(&run.run_id).unwrap();
            assert_eq!(cancelled.status, RunStatus::Cancelled);
            assert!(cancelled.finished_at.is_some());
            assert_eq!(
                tracker
                    .events(&run.run_id)
                    .unwrap()
                    .last()
                    .unwrap()
                    .event_type,
                "run.cancelled"
            );
        }
    }

    #[test]
    fn test_awaiting_resume_path() {
        let tracker = tracker();
        let run = tracker.create("chat", None);
        tracker.begin(&run.run_id).unwrap();

        let awaiting = tracker
            .await_input(&run.run_id, serde_json::json!({"question": "proceed?"}))
            .unwrap();
        assert_eq!(awaiting.status, RunStatus::Awaiting);
        assert!(awaiting.await_request.is_some());

        let resumed = tracker
            .resume(&run.run_id, &serde_json::json!({"answer": "yes"}))
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert!(resumed.await_request.is_none());

        let types: Vec<_> = tracker
            .events(&run.run_id)
            .unwrap()
            .iter()
            .map(|e| e.event_type.clone())
            .collect();
        assert_eq!(
            types,
            vec![
                "run.created",
                "run.in-progress",
                "run.awaiting",
                "run.completed"
            ]
        );
    }

    #[test]
    fn test_resume_requires_awaiting() {
        let tracker = tracker();
        let run = tracker.create("chat", None);
        tracker.begin(&run.run_id).unwrap();

        let err = tracker
            .resume(&run.run_id, &serde_json::Value::Null)
            .unwrap_err();
        assert!(matches!(
            err,
            TrackerError::Conflict {
                status: RunStatus::InProgress,
                ..
            }
        ));
    }

    #[test]
    fn test_resume_output_strategy() {
        let tracker = RunTracker::with_resume_output(
            SessionRegistry::new(),
            Box::new(|payload| {
                vec![messages::from_backend(
                    payload["answer"].as_str().unwrap_or_default(),
                    "chat",
                )]
            }),
        );

        let run = tracker.create("chat", None);
        tracker.begin(&run.run_id).unwrap();
        tracker
            .await_input(&run.run_id, serde_json::Value::Null)
            .unwrap();

        let resumed = tracker
            .resume(&run.run_id, &serde_json::json!({"answer": "resumed"}))
            .unwrap();
        assert_eq!(resumed.output[0].parts[0].content, "resumed");
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let tracker = tracker();
        assert!(tracker.get("missing").is_none());
        assert!(tracker.events("missing").is_none());
        assert!(matches!(
            tracker.begin("missing").unwrap_err(),
            TrackerError::NotFound { .. }
        ));
        assert!(matches!(
            tracker.cancel("missing").unwrap_err(),
            TrackerError::NotFound { .. }
        ));
    }

    #[test]
    fn test_session_grouping_matches_run_records() {
        let tracker = tracker();
        let ids: Vec<_> = (0..3)
            .map(|_| tracker.create("chat", Some("s1".to_string())).run_id)
            .collect();

        let session = tracker.sessions().get("s1").unwrap();
        assert_eq!(session.runs, ids);
        for id in &ids {
            assert_eq!(tracker.get(id).unwrap().session_id, "s1");
        }
    }

    #[tokio::test]
    async fn test_subscribe_receives_transitions() {
        let tracker = tracker();
        let run = tracker.create("chat", None);
        let mut rx = tracker.subscribe(&run.run_id).unwrap();

        tracker.begin(&run.run_id).unwrap();
        tracker.complete(&run.run_id, output()).unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type, "run.in-progress");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_type, "run.completed");
        assert!(second.is_terminal());
    }
}
