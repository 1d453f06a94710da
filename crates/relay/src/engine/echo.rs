//! Reference graph that answers every human message by echoing it back.
//!
//! It keeps a per-thread state object (`messages` accumulate, other keys are
//! overwritten) and exercises every event kind the orchestrator translates:
//! values, updates, streamed AI message fragments, custom payloads, subgraph
//! namespaces, interrupts and failures. Recognized input keys besides state:
//! - `fail`: abort with an execution error after the first values event
//! - `interrupt`: finish with an `__interrupt__` carrying this value

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use relay_protocol::{RunConfig, StreamMode};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::{
    EngineError, EngineResult, Graph, GraphEvent, GraphEventKind, GraphEventStream, MessageChunk,
    StateSnapshot, StreamOptions, configured_thread_id,
};

const NODE: &str = "echo";

/// Echoing graph with in-process state.
#[derive(Default)]
pub struct EchoGraph {
    states: Arc<DashMap<String, Map<String, Value>>>,
    chunk_delay: Duration,
}

impl EchoGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between streamed message fragments.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn state_of(&self, thread_id: &str) -> Map<String, Value> {
        self.states
            .get(thread_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }
}

/// Merge `patch` into `state`: `messages` arrays append, everything else overwrites.
fn merge_state(state: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, value) in patch {
        if key == "messages" {
            let incoming = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            let incoming = incoming.into_iter().map(normalize_message);
            match state.get_mut("messages") {
                Some(Value::Array(existing)) => existing.extend(incoming),
                _ => {
                    state.insert(key.clone(), Value::Array(incoming.collect()));
                }
            }
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}

/// Strings become human messages; every message gets an id.
fn normalize_message(message: Value) -> Value {
    let mut message = match message {
        Value::String(content) => json!({ "type": "human", "content": content }),
        other => other,
    };
    if let Value::Object(fields) = &mut message {
        fields
            .entry("id")
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
    }
    message
}

fn last_message_text(state: &Map<String, Value>) -> String {
    state
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
        .map(|content| match content {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

fn interrupts_at(nodes: &Option<Value>, node: &str) -> bool {
    match nodes {
        Some(Value::String(all)) => all == "*" || all == node,
        Some(Value::Array(names)) => names.iter().any(|n| n.as_str() == Some(node)),
        _ => false,
    }
}

/// Split into fragments of one word each, keeping the separating spaces.
fn fragments(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == ' ' {
            pieces.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

struct Emitter {
    tx: mpsc::Sender<EngineResult<GraphEvent>>,
}

impl Emitter {
    /// False once the consumer is gone.
    async fn send(&self, event: GraphEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    async fn root(&self, kind: GraphEventKind) -> bool {
        self.send(GraphEvent::root(kind)).await
    }
}

#[async_trait]
impl Graph for EchoGraph {
    async fn stream(&self, options: StreamOptions) -> EngineResult<GraphEventStream> {
        let thread_id = configured_thread_id(&options.config)?.to_string();
        let mut state = self.state_of(&thread_id);

        let mut fail = None;
        let mut interrupt = None;
        let reply = match &options.command {
            Some(command) => {
                let resume = command.get("resume").cloned().unwrap_or(Value::Null);
                if let Some(Value::Object(update)) = command.get("update") {
                    merge_state(&mut state, update);
                }
                match resume {
                    Value::String(text) => format!("resumed: {text}"),
                    Value::Null => "resumed".to_string(),
                    other => format!("resumed: {other}"),
                }
            }
            None => {
                let input = match &options.input {
                    None | Some(Value::Null) => Map::new(),
                    Some(Value::Object(input)) => input.clone(),
                    Some(other) => {
                        return Err(EngineError::InvalidInput(format!(
                            "expected an object, got {other}"
                        )));
                    }
                };
                let mut patch = input;
                fail = patch.remove("fail");
                interrupt = patch.remove("interrupt");
                merge_state(&mut state, &patch);
                last_message_text(&state)
            }
        };

        self.states.insert(thread_id.clone(), state.clone());

        let (tx, rx) = mpsc::channel(16);
        let emitter = Emitter { tx };
        let states = self.states.clone();
        let delay = self.chunk_delay;

        tokio::spawn(async move {
            let cancel = options.cancel.clone();
            if !emitter
                .root(GraphEventKind::Values(Value::Object(state.clone())))
                .await
            {
                return;
            }

            if let Some(reason) = fail {
                let message = reason
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| reason.to_string());
                let _ = emitter
                    .tx
                    .send(Err(EngineError::execution("ValueError", message)))
                    .await;
                return;
            }

            if interrupts_at(&options.interrupt_before, NODE) {
                let mut paused = state.clone();
                paused.insert(
                    "__interrupt__".into(),
                    json!([{ "value": null, "when": "before", "node": NODE }]),
                );
                emitter.root(GraphEventKind::Values(Value::Object(paused))).await;
                return;
            }

            let message_id = format!("run-{}", options.run_id);
            if options.wants(StreamMode::Messages) {
                let metadata = json!({
                    "langgraph_node": NODE,
                    "run_id": options.run_id,
                    "thread_id": thread_id,
                });
                for piece in fragments(&reply) {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    if cancel.is_cancelled() {
                        return;
                    }
                    let event = GraphEventKind::Message {
                        chunk: MessageChunk::ai(&message_id, piece),
                        metadata: metadata.clone(),
                    };
                    if !emitter.root(event).await {
                        return;
                    }
                }
            }
            if cancel.is_cancelled() {
                return;
            }

            let reply_message = json!({ "id": message_id, "type": "ai", "content": reply });
            let update = json!({ NODE: { "messages": [reply_message.clone()] } });
            if options.wants(StreamMode::Updates) {
                if options.subgraphs {
                    let nested = GraphEvent {
                        namespace: vec![format!("{NODE}:{}", options.run_id)],
                        kind: GraphEventKind::Updates(update.clone()),
                    };
                    if !emitter.send(nested).await {
                        return;
                    }
                }
                if !emitter.root(GraphEventKind::Updates(update)).await {
                    return;
                }
            }

            let mut next = state;
            let mut reply_patch = Map::new();
            reply_patch.insert("messages".into(), json!([reply_message]));
            merge_state(&mut next, &reply_patch);
            states.insert(thread_id, next.clone());

            if options.wants(StreamMode::Custom) {
                let echoed = json!({ "echoed_chars": reply.chars().count() });
                if !emitter.root(GraphEventKind::Custom(echoed)).await {
                    return;
                }
            }

            let mut values = next;
            if let Some(value) = interrupt {
                values.insert(
                    "__interrupt__".into(),
                    json!([{ "value": value, "when": "during", "node": NODE }]),
                );
            }
            emitter.root(GraphEventKind::Values(Value::Object(values))).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn update_state(&self, config: &RunConfig, values: Value) -> EngineResult<RunConfig> {
        let thread_id = configured_thread_id(config)?.to_string();
        let patch = match values {
            Value::Object(patch) => patch,
            Value::Null => Map::new(),
            other => {
                return Err(EngineError::InvalidInput(format!(
                    "state update must be an object, got {other}"
                )));
            }
        };

        let mut state = self.state_of(&thread_id);
        merge_state(&mut state, &patch);
        self.states.insert(thread_id, state);

        let mut next = config.clone();
        next.configurable.insert(
            "checkpoint_id".into(),
            Value::String(Uuid::new_v4().to_string()),
        );
        Ok(next)
    }

    async fn get_state(&self, config: &RunConfig) -> EngineResult<StateSnapshot> {
        let thread_id = configured_thread_id(config)?;
        Ok(StateSnapshot {
            values: Value::Object(self.state_of(thread_id)),
            next: Vec::new(),
        })
    }

    async fn describe(&self, xray: bool) -> EngineResult<Value> {
        let mut echo = json!({ "id": NODE, "type": "runnable", "data": { "name": NODE } });
        if xray {
            echo["data"]["xray"] = json!({ "streams": ["values", "updates", "messages", "custom"] });
        }
        Ok(json!({
            "nodes": [
                { "id": "__start__", "type": "schema", "data": "__start__" },
                echo,
                { "id": "__end__", "type": "schema", "data": "__end__" },
            ],
            "edges": [
                { "source": "__start__", "target": NODE },
                { "source": NODE, "target": "__end__" },
            ],
        }))
    }
}
