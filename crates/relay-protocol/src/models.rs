//! Thread, run and assistant records plus request payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Free-form JSON object attached to threads and runs.
pub type Metadata = Map<String, Value>;

/// Largest page size accepted by thread search.
pub const MAX_SEARCH_LIMIT: u32 = 1000;

/// Declares a string-backed enum with `as_str`, `Display` and `FromStr`.
macro_rules! string_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)? }
    ) => {
        $(#[$meta])*
        pub enum $name { $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+ }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self { $( Self::$variant => $text ),+ }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok(Self::$variant), )+
                    other => Err(format!(concat!("invalid ", stringify!($name), ": {}"), other)),
                }
            }
        }
    };
}

// ============================================================================
// Status enums
// ============================================================================

string_enum! {
    /// Thread lifecycle status. Only the run orchestrator writes it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum ThreadStatus {
        #[default]
        Idle => "idle",
        Busy => "busy",
        Interrupted => "interrupted",
        Error => "error",
    }
}

string_enum! {
    /// Run lifecycle: `pending -> running -> {success | error | timeout | interrupted}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub enum RunStatus {
        #[default]
        Pending => "pending",
        Running => "running",
        Error => "error",
        Success => "success",
        Timeout => "timeout",
        Interrupted => "interrupted",
    }
}

impl RunStatus {
    /// Whether the run has reached a final state.
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

string_enum! {
    /// Policy for concurrent runs on one thread. Persisted, not enforced here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum MultitaskStrategy {
        #[default]
        Reject => "reject",
        Rollback => "rollback",
        Interrupt => "interrupt",
        Enqueue => "enqueue",
    }
}

string_enum! {
    /// Event families a client can ask a run to stream.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum StreamMode {
        Values => "values",
        Messages => "messages",
        MessagesTuple => "messages-tuple",
        Updates => "updates",
        Events => "events",
        Debug => "debug",
        Custom => "custom",
    }
}

string_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum IfExists {
        Raise => "raise",
        #[default]
        DoNothing => "do_nothing",
    }
}

string_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum ThreadSortBy {
        ThreadId => "thread_id",
        Status => "status",
        #[default]
        CreatedAt => "created_at",
        UpdatedAt => "updated_at",
    }
}

string_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum SortOrder {
        #[default]
        Asc => "asc",
        Desc => "desc",
    }
}

string_enum! {
    /// What happens to a run when its streaming client goes away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum OnDisconnect {
        Cancel => "cancel",
        #[default]
        Continue => "continue",
    }
}

string_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub enum CancelAction {
        #[default]
        Interrupt => "interrupt",
        Rollback => "rollback",
    }
}

// ============================================================================
// Records
// ============================================================================

/// Persistent conversation/state container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub status: ThreadStatus,
    /// Last materialized state snapshot.
    #[serde(default)]
    pub values: Option<Value>,
    #[serde(default)]
    pub interrupts: Metadata,
}

impl Thread {
    /// A fresh idle thread with no values.
    pub fn new(thread_id: impl Into<String>, metadata: Metadata, now: DateTime<Utc>) -> Self {
        Self {
            thread_id: thread_id.into(),
            created_at: now,
            updated_at: now,
            metadata,
            status: ThreadStatus::Idle,
            values: None,
            interrupts: Metadata::new(),
        }
    }

    /// Graph this thread is bound to, from `metadata.graph_id`.
    pub fn graph_id(&self) -> Option<&str> {
        self.metadata.get("graph_id").and_then(Value::as_str)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: ThreadPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
        if let Some(values) = patch.values {
            self.values = if values.is_null() { None } else { Some(values) };
        }
        if let Some(interrupts) = patch.interrupts {
            self.interrupts = interrupts;
        }
        self.updated_at = now;
    }
}

/// One execution attempt of a graph against a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub thread_id: String,
    pub assistant_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub multitask_strategy: MultitaskStrategy,
}

impl Run {
    pub fn apply(&mut self, patch: RunPatch, now: DateTime<Utc>) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(metadata) = patch.metadata {
            self.metadata = metadata;
        }
        self.updated_at = now;
    }
}

/// A registered graph exposed through the assistants API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub assistant_id: String,
    pub graph_id: String,
    pub name: String,
    pub version: u32,
    pub config: Value,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ============================================================================
// Store inputs
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadCreate {
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub if_exists: Option<IfExists>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadSearch {
    /// Equality filters over top-level metadata keys.
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub status: Option<ThreadStatus>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub sort_by: Option<ThreadSortBy>,
    #[serde(default)]
    pub sort_order: Option<SortOrder>,
}

/// Partial thread update. `values: Some(Value::Null)` clears the snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThreadPatch {
    pub status: Option<ThreadStatus>,
    pub metadata: Option<Metadata>,
    pub values: Option<Value>,
    pub interrupts: Option<Metadata>,
}

impl ThreadPatch {
    pub fn status(status: ThreadStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn values(values: Value) -> Self {
        Self {
            values: Some(values),
            ..Default::default()
        }
    }

    pub fn interrupts(interrupts: Metadata) -> Self {
        Self {
            interrupts: Some(interrupts),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunCreate {
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub multitask_strategy: Option<MultitaskStrategy>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub metadata: Option<Metadata>,
}

impl RunPatch {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunListQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
    #[serde(default)]
    pub status: Option<RunStatus>,
}

// ============================================================================
// Run request payload
// ============================================================================

/// Graph invocation configuration forwarded to the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recursion_limit: Option<u32>,
    #[serde(default)]
    pub configurable: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /threads/{thread_id}/runs/stream`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStreamPayload {
    pub assistant_id: String,
    #[serde(default)]
    pub input: Option<Value>,
    /// Resume/goto/update instruction passed to the engine as-is.
    #[serde(default)]
    pub command: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub config: Option<RunConfig>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub stream_mode: Vec<StreamMode>,
    #[serde(default)]
    pub stream_subgraphs: bool,
    #[serde(default)]
    pub on_disconnect: OnDisconnect,
    #[serde(default)]
    pub multitask_strategy: Option<MultitaskStrategy>,
    /// `"*"` or a list of node names.
    #[serde(default)]
    pub interrupt_before: Option<Value>,
    #[serde(default)]
    pub interrupt_after: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<StreamMode>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        match Option::<OneOrMany<StreamMode>>::deserialize(deserializer)? {
            None => Vec::new(),
            Some(OneOrMany::One(mode)) => vec![mode],
            Some(OneOrMany::Many(modes)) => modes,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Error,
            RunStatus::Success,
            RunStatus::Timeout,
            RunStatus::Interrupted,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("paused".parse::<ThreadStatus>().is_err());
    }

    #[test]
    fn test_stream_mode_accepts_single_value() {
        let payload: RunStreamPayload = serde_json::from_value(json!({
            "assistant_id": "agent",
            "stream_mode": "messages-tuple"
        }))
        .unwrap();
        assert_eq!(payload.stream_mode, vec![StreamMode::MessagesTuple]);
        assert_eq!(payload.on_disconnect, OnDisconnect::Continue);
    }

    #[test]
    fn test_stream_mode_rejects_unknown_mode() {
        let result = serde_json::from_value::<RunStreamPayload>(json!({
            "assistant_id": "agent",
            "stream_mode": ["values", "tokens"]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_thread_patch_clears_values_with_null() {
        let now = Utc::now();
        let mut thread = Thread::new("t1", Metadata::new(), now);
        thread.apply(ThreadPatch::values(json!({"n": 1})), now);
        assert_eq!(thread.values, Some(json!({"n": 1})));
        thread.apply(ThreadPatch::values(Value::Null), now);
        assert_eq!(thread.values, None);
    }

    #[test]
    fn test_run_config_keeps_unknown_keys() {
        let config: RunConfig = serde_json::from_value(json!({
            "configurable": {"model": "x"},
            "run_name": "demo"
        }))
        .unwrap();
        assert_eq!(config.configurable["model"], "x");
        assert_eq!(config.extra["run_name"], "demo");
    }
}
