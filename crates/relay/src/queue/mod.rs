//! Per-run event queues.
//!
//! A queue decouples the single producer of a run (the graph invocation) from
//! any number of readers (HTTP streams). Implementations:
//! - [`MemoryStreamQueue`]: process-local buffer with a `watch` notifier
//! - [`RedisStreamQueue`]: Redis list plus pub/sub wake-ups, shared across nodes
//!
//! Every implementation accepts exactly one terminal event; pushes after it
//! are dropped.

mod codec;
mod error;
mod manager;
mod memory;
mod redis_queue;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use relay_protocol::EventMessage;
use tokio_util::sync::CancellationToken;

pub use codec::{JsonCodec, QueueCodec};
pub use error::{QueueError, QueueResult};
pub use manager::{DEFAULT_REMOVAL_DELAY, QueueManager, QueueSnapshot};
pub use memory::MemoryStreamQueue;
pub use redis_queue::{RedisQueueFactory, RedisStreamQueue};

/// Messages read from a queue, in push order.
pub type EventStream = BoxStream<'static, QueueResult<EventMessage>>;

/// Where a new reader starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Only messages pushed after subscribing (or the terminal, if already terminated).
    Tail,
    /// Everything still buffered.
    Start,
    /// Messages positioned after the given id.
    After(u64),
}

impl ReadFrom {
    /// Resume after a client-supplied `Last-Event-ID`; unparseable ids replay the buffer.
    pub fn resume(last_event_id: Option<&str>) -> Self {
        match last_event_id {
            None => Self::Tail,
            Some(id) => id.trim().parse().map(Self::After).unwrap_or(Self::Start),
        }
    }
}

/// Append-only, multi-reader event channel for one run.
#[async_trait]
pub trait StreamQueue: Send + Sync {
    /// Run id this queue belongs to.
    fn id(&self) -> &str;

    /// Append a message and wake readers. No-op once a terminal event was pushed.
    async fn push(&self, message: EventMessage) -> QueueResult<()>;

    /// Independent reader with its own cursor. Ends right after a terminal event.
    async fn subscribe(&self, from: ReadFrom) -> QueueResult<EventStream>;

    /// Snapshot of every buffered message.
    async fn get_all(&self) -> QueueResult<Vec<EventMessage>>;

    /// Drop buffered messages without terminating the queue.
    async fn clear(&self) -> QueueResult<()>;

    /// Push a cancel event and trip the cancellation token. Idempotent.
    async fn cancel(&self, reason: &str) -> QueueResult<()>;

    /// Token observed by the producer.
    fn cancellation_token(&self) -> CancellationToken;

    fn is_cancelled(&self) -> bool {
        self.cancellation_token().is_cancelled()
    }
}

/// Builds queues for the manager.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    async fn create(&self, id: &str) -> QueueResult<Arc<dyn StreamQueue>>;
}

/// Factory for process-local queues.
#[derive(Clone, Default)]
pub struct MemoryQueueFactory {
    codec: Option<Arc<dyn QueueCodec>>,
}

impl MemoryQueueFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store messages encoded instead of as values.
    pub fn encoded(codec: Arc<dyn QueueCodec>) -> Self {
        Self { codec: Some(codec) }
    }
}

#[async_trait]
impl QueueFactory for MemoryQueueFactory {
    async fn create(&self, id: &str) -> QueueResult<Arc<dyn StreamQueue>> {
        Ok(Arc::new(MemoryStreamQueue::new(id, self.codec.clone())))
    }
}
