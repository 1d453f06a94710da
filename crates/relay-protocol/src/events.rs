//! Run stream event envelope.
//!
//! An [`EventMessage`] is what a run producer pushes into a queue and what a
//! client receives as one SSE frame. Three event names are reserved to mark the
//! end of a stream; a queue accepts exactly one of them.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ============================================================================
// Reserved event names
// ============================================================================

/// The producer finished normally.
pub const STREAM_END: &str = "__stream_end__";

/// The producer failed; data is `{ "error": <name>, "message": <text> }`.
pub const STREAM_ERROR: &str = "__stream_error__";

/// The run was cancelled; data is the cancellation reason.
pub const STREAM_CANCEL: &str = "__stream_cancel__";

/// First event of every run stream: `{ run_id, attempt, graph_id }`.
pub const METADATA: &str = "metadata";

/// Heartbeat frame sent on idle SSE connections.
pub const PING: &str = "ping";

// ============================================================================
// Envelope
// ============================================================================

/// A named event with a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    /// Position marker used for stream resumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Event name (`values`, `messages/partial`, `__stream_end__`, ...).
    pub event: String,

    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Which reserved event terminated a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    End,
    Error,
    Cancel,
}

impl EventMessage {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            id: None,
            event: event.into(),
            data,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Normal end of stream.
    pub fn end() -> Self {
        Self::new(STREAM_END, Value::Null)
    }

    /// Failure marker carrying an error class name and a human readable message.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            STREAM_ERROR,
            json!({ "error": name.into(), "message": message.into() }),
        )
    }

    /// Cancellation marker carrying the reason.
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(STREAM_CANCEL, Value::String(reason.into()))
    }

    pub fn terminal_kind(&self) -> Option<TerminalKind> {
        match self.event.as_str() {
            STREAM_END => Some(TerminalKind::End),
            STREAM_ERROR => Some(TerminalKind::Error),
            STREAM_CANCEL => Some(TerminalKind::Cancel),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_kind().is_some()
    }

    /// Base event name with any `|namespace` suffix removed.
    pub fn base_event(&self) -> &str {
        self.event
            .split_once('|')
            .map(|(base, _)| base)
            .unwrap_or(&self.event)
    }
}
