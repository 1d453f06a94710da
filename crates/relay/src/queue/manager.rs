//! Registry of live run queues with deferred removal.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, info, warn};
use relay_protocol::EventMessage;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{QueueError, QueueFactory, QueueResult, StreamQueue};

/// Default grace period between `remove_queue` and the queue disappearing.
pub const DEFAULT_REMOVAL_DELAY: Duration = Duration::from_millis(500);

/// Buffered contents of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub id: String,
    pub cancelled: bool,
    pub messages: Vec<EventMessage>,
}

struct Expiry {
    deadline: Instant,
    queue: Arc<dyn StreamQueue>,
}

/// Creates, finds and reclaims queues by run id.
///
/// `remove_queue` only records a deadline; the queue is dropped by
/// [`QueueManager::reap_expired`], normally driven by [`QueueManager::spawn_reaper`].
/// An expiry entry removes only the queue instance it was scheduled for, so a
/// queue recreated under the same id survives the old deadline.
pub struct QueueManager {
    queues: DashMap<String, Arc<dyn StreamQueue>>,
    expiries: DashMap<String, Expiry>,
    factory: Arc<dyn QueueFactory>,
    removal_delay: Duration,
}

impl QueueManager {
    pub fn new(factory: Arc<dyn QueueFactory>) -> Self {
        Self::with_removal_delay(factory, DEFAULT_REMOVAL_DELAY)
    }

    pub fn with_removal_delay(factory: Arc<dyn QueueFactory>, removal_delay: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            expiries: DashMap::new(),
            factory,
            removal_delay,
        }
    }

    /// Create a queue for `id`, replacing any existing one.
    pub async fn create_queue(&self, id: &str) -> QueueResult<Arc<dyn StreamQueue>> {
        let queue = self.factory.create(id).await?;
        if self.queues.insert(id.to_string(), queue.clone()).is_some() {
            debug!("queue {id}: replaced existing queue");
        }
        Ok(queue)
    }

    pub fn get_queue(&self, id: &str) -> QueueResult<Arc<dyn StreamQueue>> {
        self.queues
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.queues.contains_key(id)
    }

    pub async fn push_to_queue(&self, id: &str, message: EventMessage) -> QueueResult<()> {
        self.get_queue(id)?.push(message).await
    }

    pub async fn get_queue_data(&self, id: &str) -> QueueResult<Vec<EventMessage>> {
        self.get_queue(id)?.get_all().await
    }

    /// Cancel and schedule removal. Unknown ids are ignored.
    pub async fn cancel_queue(&self, id: &str, reason: &str) -> QueueResult<()> {
        let Ok(queue) = self.get_queue(id) else {
            debug!("queue {id}: cancel requested for unknown queue");
            return Ok(());
        };
        queue.cancel(reason).await?;
        self.remove_queue(id);
        Ok(())
    }

    /// Schedule the current queue under `id` for removal after the grace period.
    pub fn remove_queue(&self, id: &str) {
        let Ok(queue) = self.get_queue(id) else {
            return;
        };
        if self.removal_delay.is_zero() {
            self.queues
                .remove_if(id, |_, current| Arc::ptr_eq(current, &queue));
            return;
        }
        self.expiries.insert(
            id.to_string(),
            Expiry {
                deadline: Instant::now() + self.removal_delay,
                queue,
            },
        );
    }

    pub async fn clear_queue(&self, id: &str) -> QueueResult<()> {
        match self.get_queue(id) {
            Ok(queue) => queue.clear().await,
            Err(_) => Ok(()),
        }
    }

    /// Clear the buffer of every queue. Queues stay registered.
    pub async fn clear_all_queues(&self) -> QueueResult<()> {
        for queue in self.all_queues() {
            queue.clear().await?;
        }
        Ok(())
    }

    pub fn queue_ids(&self) -> Vec<String> {
        self.queues.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Snapshot of every registered queue.
    pub async fn all_queues_data(&self) -> QueueResult<Vec<QueueSnapshot>> {
        let mut snapshots = Vec::new();
        for queue in self.all_queues() {
            snapshots.push(QueueSnapshot {
                id: queue.id().to_string(),
                cancelled: queue.is_cancelled(),
                messages: queue.get_all().await?,
            });
        }
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(snapshots)
    }

    /// Drop every queue whose removal deadline is at or before `now`.
    pub fn reap_expired(&self, now: Instant) -> usize {
        let due: Vec<String> = self
            .expiries
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in due {
            let Some((_, expiry)) = self
                .expiries
                .remove_if(&id, |_, expiry| expiry.deadline <= now)
            else {
                continue;
            };
            if self
                .queues
                .remove_if(&id, |_, current| Arc::ptr_eq(current, &expiry.queue))
                .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("reaped {removed} expired queue(s)");
        }
        removed
    }

    /// Run `reap_expired` every `interval` until `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        info!("queue reaper started (interval {interval:?})");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.reap_expired(Instant::now());
                    }
                }
            }
            if !manager.is_empty() {
                warn!("queue reaper stopped with {} live queue(s)", manager.len());
            }
        })
    }

    fn all_queues(&self) -> Vec<Arc<dyn StreamQueue>> {
        self.queues
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
