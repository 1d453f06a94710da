//! Graph events to wire events.

use std::collections::{HashMap, HashSet};

use relay_protocol::{EventMessage, StreamMode};
use serde_json::{Map, Value, json};

use crate::engine::{GraphEvent, GraphEventKind, MessageChunk};

/// Key a values snapshot carries while the graph waits on an interrupt.
pub const INTERRUPT_KEY: &str = "__interrupt__";

/// Modes the engine is asked for, given what the client requested.
///
/// `values` is always streamed because it drives persistence. `events` has no
/// engine counterpart and `messages-tuple` is served from `messages`.
pub fn engine_modes(requested: &[StreamMode]) -> Vec<StreamMode> {
    let mut modes = vec![StreamMode::Values];
    for mode in requested {
        let mode = match mode {
            StreamMode::Events => continue,
            StreamMode::MessagesTuple => StreamMode::Messages,
            other => *other,
        };
        if !modes.contains(&mode) {
            modes.push(mode);
        }
    }
    modes
}

/// `name|ns1|ns2`, or `name` for the root graph.
pub fn namespaced(name: &str, namespace: &[String]) -> String {
    if namespace.iter().all(String::is_empty) {
        return name.to_string();
    }
    let mut event = name.to_string();
    for part in namespace {
        event.push('|');
        event.push_str(part);
    }
    event
}

/// Where a root values snapshot should be persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum Persist {
    Values(Value),
    Interrupts(Value),
}

/// Output of translating one graph event.
#[derive(Debug, Default)]
pub struct Translated {
    pub messages: Vec<EventMessage>,
    pub persist: Option<Persist>,
}

/// Per-run translation state.
///
/// Remembers which message ids already had their metadata announced and
/// accumulates AI chunks so every `messages/partial` carries the whole
/// message so far.
#[derive(Debug)]
pub struct StreamTranslator {
    requested: Vec<StreamMode>,
    announced: HashSet<String>,
    chunks: HashMap<String, MessageChunk>,
}

impl StreamTranslator {
    pub fn new(requested: &[StreamMode]) -> Self {
        Self {
            requested: requested.to_vec(),
            announced: HashSet::new(),
            chunks: HashMap::new(),
        }
    }

    fn wants(&self, mode: StreamMode) -> bool {
        self.requested.contains(&mode)
    }

    pub fn translate(&mut self, event: GraphEvent) -> Translated {
        let mut out = Translated::default();
        let root = event.is_root();

        match event.kind {
            GraphEventKind::Values(value) => {
                if root {
                    out.persist = Some(match value.get(INTERRUPT_KEY) {
                        Some(_) => Persist::Interrupts(value.clone()),
                        None => Persist::Values(value.clone()),
                    });
                }
                out.messages.push(EventMessage::new(
                    namespaced(StreamMode::Values.as_str(), &event.namespace),
                    value,
                ));
            }
            GraphEventKind::Updates(value) => {
                out.messages.push(EventMessage::new(
                    namespaced(StreamMode::Updates.as_str(), &event.namespace),
                    value,
                ));
            }
            GraphEventKind::Message { chunk, metadata } => {
                self.translate_message(chunk, metadata, &mut out.messages);
            }
            GraphEventKind::Custom(value) => {
                if self.wants(StreamMode::Custom) {
                    out.messages.push(EventMessage::new(
                        namespaced(StreamMode::Custom.as_str(), &event.namespace),
                        value,
                    ));
                }
            }
            GraphEventKind::Debug(value) => {
                if self.wants(StreamMode::Debug) {
                    out.messages.push(EventMessage::new(
                        namespaced(StreamMode::Debug.as_str(), &event.namespace),
                        value,
                    ));
                }
            }
        }

        out
    }

    fn translate_message(
        &mut self,
        chunk: MessageChunk,
        metadata: Value,
        messages: &mut Vec<EventMessage>,
    ) {
        if let Some(id) = &chunk.id {
            if self.announced.insert(id.clone()) {
                let mut announce = Map::new();
                announce.insert(id.clone(), metadata);
                messages.push(EventMessage::new(
                    "messages/metadata",
                    Value::Object(announce),
                ));
            }
        }

        let partial = match (&chunk.id, chunk.is_ai_chunk()) {
            (Some(id), true) => {
                let accumulated = self
                    .chunks
                    .entry(id.clone())
                    .and_modify(|acc| acc.concat(&chunk))
                    .or_insert_with(|| chunk.clone());
                serde_json::to_value(&*accumulated)
            }
            _ => serde_json::to_value(&chunk),
        };

        match partial {
            Ok(partial) => messages.push(EventMessage::new("messages/partial", json!([partial]))),
            Err(e) => log::warn!("dropping unserializable message chunk: {e}"),
        }
    }
}
