//! Server-push event stream for run lifecycle frames.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use crate::runs::RunEvent;

/// Wrap a run-event stream as an SSE response.
///
/// Each frame carries the event type (`run.created`, `run.completed`, ...)
/// in the SSE `event:` field and the JSON-encoded event as data.
pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = RunEvent> + Send + 'static,
{
    let stream = stream.map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().event(event.event_type.clone()).data(json))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
