//! Process-local queue backed by a mutex-guarded buffer.
//!
//! Readers keep an absolute cursor into the buffer and park on a `watch`
//! channel whose value is bumped on every push. Positions keep growing across
//! `clear`, so a message id never repeats within one queue.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use log::{debug, info};
use relay_protocol::{EventMessage, TerminalKind};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::{EventStream, QueueCodec, QueueError, QueueResult, ReadFrom, StreamQueue};

enum Slot {
    Plain(EventMessage),
    Encoded(Bytes),
}

#[derive(Default)]
struct Buffer {
    slots: Vec<Slot>,
    /// Absolute position of `slots[0]`.
    base: u64,
    /// Position and copy of the terminal event, kept across `clear`.
    terminal: Option<(u64, EventMessage)>,
}

impl Buffer {
    fn tail(&self) -> u64 {
        self.base + self.slots.len() as u64
    }
}

struct Shared {
    id: String,
    buffer: Mutex<Buffer>,
    version: watch::Sender<u64>,
    cancel: CancellationToken,
    codec: Option<Arc<dyn QueueCodec>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    fn decode(&self, slot: &Slot, position: u64) -> QueueResult<EventMessage> {
        let message = match (slot, &self.codec) {
            (Slot::Plain(message), _) => message.clone(),
            (Slot::Encoded(bytes), Some(codec)) => codec.decode(bytes)?,
            (Slot::Encoded(_), None) => {
                return Err(QueueError::Codec("encoded message without codec".into()));
            }
        };
        Ok(positioned(message, position))
    }

    /// Next message at or after `cursor`, advancing it. Once the buffer is
    /// exhausted a terminated queue keeps returning its terminal event.
    fn next(&self, cursor: &mut u64) -> Option<QueueResult<EventMessage>> {
        let buffer = self.lock();
        if *cursor < buffer.base {
            *cursor = buffer.base;
        }
        let index = (*cursor - buffer.base) as usize;
        if let Some(slot) = buffer.slots.get(index) {
            let position = *cursor;
            *cursor += 1;
            return Some(self.decode(slot, position));
        }
        buffer
            .terminal
            .as_ref()
            .map(|(position, message)| Ok(positioned(message.clone(), *position)))
    }
}

fn positioned(mut message: EventMessage, position: u64) -> EventMessage {
    if message.id.is_none() {
        message.id = Some(position.to_string());
    }
    message
}

/// In-memory [`StreamQueue`].
pub struct MemoryStreamQueue {
    shared: Arc<Shared>,
}

impl MemoryStreamQueue {
    /// Create a queue. With a codec, messages are stored encoded.
    pub fn new(id: impl Into<String>, codec: Option<Arc<dyn QueueCodec>>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                buffer: Mutex::new(Buffer::default()),
                version,
                cancel: CancellationToken::new(),
                codec,
            }),
        }
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.shared.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.lock().terminal.is_some()
    }
}

struct Reader {
    shared: Arc<Shared>,
    cursor: u64,
    changes: watch::Receiver<u64>,
    done: bool,
}

#[async_trait]
impl StreamQueue for MemoryStreamQueue {
    fn id(&self) -> &str {
        &self.shared.id
    }

    async fn push(&self, message: EventMessage) -> QueueResult<()> {
        let slot = match &self.shared.codec {
            Some(codec) => Slot::Encoded(codec.encode(&message)?),
            None => Slot::Plain(message.clone()),
        };

        {
            let mut buffer = self.shared.lock();
            if buffer.terminal.is_some() {
                debug!(
                    "queue {}: dropping '{}' pushed after terminal event",
                    self.shared.id, message.event
                );
                return Ok(());
            }
            if message.is_terminal() {
                let position = buffer.tail();
                buffer.terminal = Some((position, message));
            }
            buffer.slots.push(slot);
        }

        self.shared.wake();
        Ok(())
    }

    async fn subscribe(&self, from: ReadFrom) -> QueueResult<EventStream> {
        let changes = self.shared.version.subscribe();
        let cursor = match from {
            ReadFrom::Tail => self.shared.lock().tail(),
            ReadFrom::Start => 0,
            ReadFrom::After(id) => id.saturating_add(1),
        };

        let reader = Reader {
            shared: self.shared.clone(),
            cursor,
            changes,
            done: false,
        };

        let stream = futures::stream::unfold(reader, |mut reader| async move {
            if reader.done {
                return None;
            }
            loop {
                let _ = reader.changes.borrow_and_update();
                if let Some(item) = reader.shared.next(&mut reader.cursor) {
                    match &item {
                        Ok(message) => match message.terminal_kind() {
                            Some(TerminalKind::Cancel) => {
                                reader.shared.cancel.cancel();
                                reader.done = true;
                            }
                            Some(_) => reader.done = true,
                            None => {}
                        },
                        Err(_) => reader.done = true,
                    }
                    return Some((item, reader));
                }
                if reader.changes.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn get_all(&self) -> QueueResult<Vec<EventMessage>> {
        let buffer = self.shared.lock();
        buffer
            .slots
            .iter()
            .enumerate()
            .map(|(index, slot)| self.shared.decode(slot, buffer.base + index as u64))
            .collect()
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut buffer = self.shared.lock();
        buffer.base = buffer.tail();
        buffer.slots.clear();
        Ok(())
    }

    async fn cancel(&self, reason: &str) -> QueueResult<()> {
        if !self.shared.cancel.is_cancelled() {
            info!("queue {}: cancelled ({reason})", self.shared.id);
        }
        self.push(EventMessage::cancel(reason)).await?;
        self.shared.cancel.cancel();
        Ok(())
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }
}
