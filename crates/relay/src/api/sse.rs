//! Run streams as Server-Sent Events.

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use relay_protocol::EventMessage;
use relay_protocol::events::PING;
use tracing::warn;

use crate::runs::RunStream;

/// One SSE frame: optional `id:`, `event:` and the JSON payload as `data:`.
pub fn to_event(message: &EventMessage) -> Event {
    let data = serde_json::to_string(&message.data).unwrap_or_else(|e| {
        warn!("Failed to serialize event data: {}", e);
        "null".to_string()
    });
    let event = Event::default().event(&message.event).data(data);
    match &message.id {
        Some(id) => event.id(id),
        None => event,
    }
}

/// Wrap a run stream as an SSE response with `ping` heartbeats.
///
/// A reader error is reported as a final `__stream_error__` frame.
pub fn run_sse(
    stream: RunStream,
    heartbeat: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let frames = stream.map(|item| {
        let message = match item {
            Ok(message) => message,
            Err(e) => {
                warn!("Run stream failed: {}", e);
                EventMessage::error(e.event_name(), e.to_string())
            }
        };
        Ok(to_event(&message))
    });

    Sse::new(frames).keep_alive(
        KeepAlive::new()
            .interval(heartbeat)
            .event(Event::default().event(PING).data("{}")),
    )
}

