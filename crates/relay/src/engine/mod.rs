//! Boundary to the graph execution engine.
//!
//! relay does not execute graphs itself. A [`Graph`] turns an input plus a
//! configuration into an ordered stream of [`GraphEvent`]s and exposes its
//! per-thread state. Graphs are registered by id in a [`GraphRegistry`] built
//! at startup; the id doubles as the assistant id on the HTTP surface.

mod echo;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use relay_protocol::models::Metadata;
use relay_protocol::{RunConfig, StreamMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use echo::EchoGraph;

/// Result type for engine calls.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by graphs or the registry.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("graph \"{0}\" not found")]
    GraphNotFound(String),

    #[error("invalid graph input: {0}")]
    InvalidInput(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("{message}")]
    Execution { name: String, message: String },
}

impl EngineError {
    pub fn execution(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Execution {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Error class name reported in `__stream_error__` events.
    pub fn name(&self) -> &str {
        match self {
            Self::GraphNotFound(_) => "GraphNotFoundError",
            Self::InvalidInput(_) => "InvalidInputError",
            Self::Cancelled => "CancelledError",
            Self::Execution { name, .. } => name,
        }
    }
}

// ============================================================================
// Events
// ============================================================================

/// One streamed message fragment. Fragments sharing an id belong to the same message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageChunk {
    pub const AI_CHUNK: &'static str = "AIMessageChunk";

    pub fn ai(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: Self::AI_CHUNK.to_string(),
            content: content.into(),
            extra: Map::new(),
        }
    }

    pub fn is_ai_chunk(&self) -> bool {
        self.kind == Self::AI_CHUNK
    }

    /// Append a later fragment: content concatenates, arrays extend, other keys take the newer value.
    pub fn concat(&mut self, next: &MessageChunk) {
        self.content.push_str(&next.content);
        for (key, value) in &next.extra {
            match (self.extra.get_mut(key), value) {
                (Some(Value::Array(existing)), Value::Array(more)) => {
                    existing.extend(more.iter().cloned())
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GraphEventKind {
    /// Full state after a step.
    Values(Value),
    /// Per-node state delta.
    Updates(Value),
    /// LLM token fragment plus its run metadata.
    Message { chunk: MessageChunk, metadata: Value },
    /// User-emitted payload.
    Custom(Value),
    Debug(Value),
}

/// Event emitted by a graph. `namespace` is empty for the root graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphEvent {
    pub namespace: Vec<String>,
    pub kind: GraphEventKind,
}

impl GraphEvent {
    pub fn root(kind: GraphEventKind) -> Self {
        Self {
            namespace: Vec::new(),
            kind,
        }
    }

    pub fn is_root(&self) -> bool {
        self.namespace.iter().all(String::is_empty)
    }
}

pub type GraphEventStream = BoxStream<'static, EngineResult<GraphEvent>>;

// ============================================================================
// Invocation
// ============================================================================

/// Everything a graph needs for one streamed invocation.
#[derive(Debug, Clone, Default)]
pub struct StreamOptions {
    pub run_id: String,
    pub input: Option<Value>,
    /// Resume/goto/update instruction; takes precedence over `input`.
    pub command: Option<Value>,
    pub config: RunConfig,
    /// Engine-level modes (never `events` or `messages-tuple`).
    pub stream_modes: Vec<StreamMode>,
    pub subgraphs: bool,
    pub interrupt_before: Option<Value>,
    pub interrupt_after: Option<Value>,
    pub metadata: Metadata,
    pub cancel: CancellationToken,
}

impl StreamOptions {
    pub fn wants(&self, mode: StreamMode) -> bool {
        self.stream_modes.contains(&mode)
    }
}

/// Current state of a thread as seen by a graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub values: Value,
    #[serde(default)]
    pub next: Vec<String>,
}

/// A compiled, runnable graph.
#[async_trait]
pub trait Graph: Send + Sync {
    async fn stream(&self, options: StreamOptions) -> EngineResult<GraphEventStream>;

    /// Write `values` into the thread state; returns the config pointing at the new state.
    async fn update_state(&self, config: &RunConfig, values: Value) -> EngineResult<RunConfig>;

    async fn get_state(&self, config: &RunConfig) -> EngineResult<StateSnapshot>;

    /// Drawable description (`nodes`/`edges`).
    async fn describe(&self, xray: bool) -> EngineResult<Value>;
}

/// Graphs by id.
#[derive(Default, Clone)]
pub struct GraphRegistry {
    graphs: BTreeMap<String, Arc<dyn Graph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, graph_id: impl Into<String>, graph: Arc<dyn Graph>) -> &mut Self {
        self.graphs.insert(graph_id.into(), graph);
        self
    }

    pub fn with(mut self, graph_id: impl Into<String>, graph: Arc<dyn Graph>) -> Self {
        self.register(graph_id, graph);
        self
    }

    pub fn get(&self, graph_id: &str) -> EngineResult<Arc<dyn Graph>> {
        self.graphs
            .get(graph_id)
            .cloned()
            .ok_or_else(|| EngineError::GraphNotFound(graph_id.to_string()))
    }

    pub fn contains(&self, graph_id: &str) -> bool {
        self.graphs.contains_key(graph_id)
    }

    /// Registered ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.graphs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }
}

/// `thread_id` from a config's `configurable` section.
pub fn configured_thread_id(config: &RunConfig) -> EngineResult<&str> {
    config
        .configurable
        .get("thread_id")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::InvalidInput("configurable.thread_id is required".into()))
}
