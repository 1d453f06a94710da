//! Redis-backed queue shared between relay nodes.
//!
//! Layout per run id:
//! - `relay:queue:{id}` list of encoded messages
//! - `relay:queue:{id}:base` absolute position of the list head (grows on clear)
//! - `relay:queue:{id}:done` hash `{pos, payload}` of the terminal event
//! - `relay:channel:{id}` pub/sub channel announcing new messages
//!
//! Push and terminal detection run in one Lua script so two nodes can never
//! both terminate a queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use log::{debug, info, warn};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use relay_protocol::{EventMessage, TerminalKind};
use tokio_util::sync::CancellationToken;

use super::{
    EventStream, JsonCodec, QueueCodec, QueueFactory, QueueResult, ReadFrom, StreamQueue,
};

const PUSH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[3]) == 1 then
    return -1
end
local len = redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('EXPIRE', KEYS[1], ARGV[3])
if ARGV[2] == '1' then
    local base = tonumber(redis.call('GET', KEYS[2]) or '0')
    redis.call('HSET', KEYS[3], 'pos', base + len - 1, 'payload', ARGV[1])
    redis.call('EXPIRE', KEYS[3], ARGV[3])
end
redis.call('PUBLISH', KEYS[4], len)
return len
"#;

const READ_SCRIPT: &str = r#"
local base = tonumber(redis.call('GET', KEYS[2]) or '0')
local start = tonumber(ARGV[1]) - base
if start < 0 then
    start = 0
end
local items = redis.call('LRANGE', KEYS[1], start, -1)
local done = redis.call('HMGET', KEYS[3], 'pos', 'payload')
return {base + start, items, done[1], done[2]}
"#;

const TAIL_SCRIPT: &str = r#"
return tonumber(redis.call('GET', KEYS[2]) or '0') + redis.call('LLEN', KEYS[1])
"#;

const CLEAR_SCRIPT: &str = r#"
local n = redis.call('LLEN', KEYS[1])
redis.call('DEL', KEYS[1])
redis.call('INCRBY', KEYS[2], n)
redis.call('EXPIRE', KEYS[2], ARGV[1])
return n
"#;

struct Keys {
    list: String,
    base: String,
    done: String,
    channel: String,
}

impl Keys {
    fn new(id: &str) -> Self {
        Self {
            list: format!("relay:queue:{id}"),
            base: format!("relay:queue:{id}:base"),
            done: format!("relay:queue:{id}:done"),
            channel: format!("relay:channel:{id}"),
        }
    }
}

/// One `READ_SCRIPT` reply: first position, items, terminal position and payload.
type ReadReply = (u64, Vec<Vec<u8>>, Option<u64>, Option<Vec<u8>>);

struct Inner {
    id: String,
    keys: Keys,
    client: Client,
    conn: MultiplexedConnection,
    codec: Arc<dyn QueueCodec>,
    cancel: CancellationToken,
    ttl_secs: u64,
}

impl Inner {
    async fn read(&self, cursor: u64) -> QueueResult<ReadReply> {
        let mut conn = self.conn.clone();
        let reply = Script::new(READ_SCRIPT)
            .key(&self.keys.list)
            .key(&self.keys.base)
            .key(&self.keys.done)
            .arg(cursor)
            .invoke_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn tail(&self) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let tail = Script::new(TAIL_SCRIPT)
            .key(&self.keys.list)
            .key(&self.keys.base)
            .invoke_async(&mut conn)
            .await?;
        Ok(tail)
    }

    /// Notifications announcing pushes to this queue.
    async fn wakeups(&self) -> QueueResult<BoxStream<'static, redis::Msg>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.keys.channel).await?;
        Ok(pubsub.into_on_message().boxed())
    }

    fn decode_at(&self, raw: &[u8], position: u64) -> QueueResult<EventMessage> {
        let mut message = self.codec.decode(raw)?;
        if message.id.is_none() {
            message.id = Some(position.to_string());
        }
        Ok(message)
    }
}

/// [`StreamQueue`] stored in Redis.
pub struct RedisStreamQueue {
    inner: Arc<Inner>,
}

impl RedisStreamQueue {
    /// Create a queue, discarding any keys left behind by an earlier queue with the same id.
    pub async fn create(
        id: &str,
        client: Client,
        conn: MultiplexedConnection,
        codec: Arc<dyn QueueCodec>,
        key_ttl: Duration,
    ) -> QueueResult<Self> {
        let keys = Keys::new(id);
        let mut reset = conn.clone();
        let _: () = redis::cmd("DEL")
            .arg(&keys.list)
            .arg(&keys.base)
            .arg(&keys.done)
            .query_async(&mut reset)
            .await?;

        Ok(Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                keys,
                client,
                conn,
                codec,
                cancel: CancellationToken::new(),
                ttl_secs: key_ttl.as_secs().max(1),
            }),
        })
    }
}

struct Reader {
    inner: Arc<Inner>,
    cursor: u64,
    pending: VecDeque<EventMessage>,
    wakeups: BoxStream<'static, redis::Msg>,
    done: bool,
}

impl Reader {
    /// Fetch everything after the cursor into `pending`.
    async fn fill(&mut self) -> QueueResult<()> {
        let (start, items, terminal_pos, terminal) = self.inner.read(self.cursor).await?;
        self.cursor = start + items.len() as u64;
        for (offset, raw) in items.iter().enumerate() {
            let message = self.inner.decode_at(raw, start + offset as u64)?;
            let terminal = message.is_terminal();
            self.pending.push_back(message);
            if terminal {
                return Ok(());
            }
        }
        if self.pending.is_empty() {
            if let (Some(position), Some(raw)) = (terminal_pos, terminal) {
                self.pending.push_back(self.inner.decode_at(&raw, position)?);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StreamQueue for RedisStreamQueue {
    fn id(&self) -> &str {
        &self.inner.id
    }

    async fn push(&self, message: EventMessage) -> QueueResult<()> {
        let payload = self.inner.codec.encode(&message)?;
        let mut conn = self.inner.conn.clone();
        let len: i64 = Script::new(PUSH_SCRIPT)
            .key(&self.inner.keys.list)
            .key(&self.inner.keys.base)
            .key(&self.inner.keys.done)
            .key(&self.inner.keys.channel)
            .arg(payload.as_ref())
            .arg(if message.is_terminal() { "1" } else { "0" })
            .arg(self.inner.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        if len < 0 {
            debug!(
                "queue {}: dropping '{}' pushed after terminal event",
                self.inner.id, message.event
            );
        }
        Ok(())
    }

    async fn subscribe(&self, from: ReadFrom) -> QueueResult<EventStream> {
        // Subscribe before computing the cursor so no notification falls in between.
        let wakeups = self.inner.wakeups().await?;

        let cursor = match from {
            ReadFrom::Tail => self.inner.tail().await?,
            ReadFrom::Start => 0,
            ReadFrom::After(id) => id.saturating_add(1),
        };

        let reader = Reader {
            inner: self.inner.clone(),
            cursor,
            pending: VecDeque::new(),
            wakeups,
            done: false,
        };

        let stream = futures::stream::unfold(reader, |mut reader| async move {
            loop {
                if let Some(message) = reader.pending.pop_front() {
                    match message.terminal_kind() {
                        Some(TerminalKind::Cancel) => {
                            reader.inner.cancel.cancel();
                            reader.done = true;
                            reader.pending.clear();
                        }
                        Some(_) => {
                            reader.done = true;
                            reader.pending.clear();
                        }
                        None => {}
                    }
                    return Some((Ok(message), reader));
                }
                if reader.done {
                    return None;
                }
                if let Err(err) = reader.fill().await {
                    reader.done = true;
                    return Some((Err(err), reader));
                }
                if !reader.pending.is_empty() {
                    continue;
                }
                // Pushes publish after writing, so a wakeup always follows
                // anything the last fill missed.
                if reader.wakeups.next().await.is_some() {
                    continue;
                }
                warn!(
                    "queue {}: pub/sub connection closed, resubscribing",
                    reader.inner.id
                );
                // The next fill picks up whatever was pushed while unsubscribed.
                match reader.inner.wakeups().await {
                    Ok(wakeups) => reader.wakeups = wakeups,
                    Err(err) => {
                        reader.done = true;
                        return Some((Err(err), reader));
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn get_all(&self) -> QueueResult<Vec<EventMessage>> {
        let (start, items, _, _) = self.inner.read(0).await?;
        items
            .iter()
            .enumerate()
            .map(|(offset, raw)| self.inner.decode_at(raw, start + offset as u64))
            .collect()
    }

    async fn clear(&self) -> QueueResult<()> {
        let mut conn = self.inner.conn.clone();
        let _: i64 = Script::new(CLEAR_SCRIPT)
            .key(&self.inner.keys.list)
            .key(&self.inner.keys.base)
            .arg(self.inner.ttl_secs)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn cancel(&self, reason: &str) -> QueueResult<()> {
        if !self.inner.cancel.is_cancelled() {
            info!("queue {}: cancelled ({reason})", self.inner.id);
        }
        self.push(EventMessage::cancel(reason)).await?;
        self.inner.cancel.cancel();
        Ok(())
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}

/// Creates [`RedisStreamQueue`]s over one shared connection.
pub struct RedisQueueFactory {
    client: Client,
    conn: MultiplexedConnection,
    codec: Arc<dyn QueueCodec>,
    key_ttl: Duration,
}

impl RedisQueueFactory {
    pub async fn connect(url: &str, key_ttl: Duration) -> QueueResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("connected to redis queue backend");
        Ok(Self {
            client,
            conn,
            codec: Arc::new(JsonCodec),
            key_ttl,
        })
    }
}

#[async_trait]
impl QueueFactory for RedisQueueFactory {
    async fn create(&self, id: &str) -> QueueResult<Arc<dyn StreamQueue>> {
        let queue = RedisStreamQueue::create(
            id,
            self.client.clone(),
            self.conn.clone(),
            self.codec.clone(),
            self.key_ttl,
        )
        .await?;
        Ok(Arc::new(queue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn factory() -> Option<RedisQueueFactory> {
        let url = std::env::var("RELAY_TEST_REDIS_URL").ok()?;
        Some(
            RedisQueueFactory::connect(&url, Duration::from_secs(60))
                .await
                .expect("connect to test redis"),
        )
    }

    #[tokio::test]
    async fn test_redis_queue_single_terminal_and_fan_out() {
        let Some(factory) = factory().await else {
            return;
        };
        let id = uuid::Uuid::new_v4().to_string();
        let queue = factory.create(&id).await.unwrap();

        let reader = queue.subscribe(ReadFrom::Tail).await.unwrap();
        queue
            .push(EventMessage::new("values", json!({"n": 1})))
            .await
            .unwrap();
        queue.push(EventMessage::end()).await.unwrap();
        queue
            .push(EventMessage::error("RuntimeError", "late"))
            .await
            .unwrap();

        let seen: Vec<_> = tokio::time::timeout(Duration::from_secs(5), reader.collect::<Vec<_>>())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.unwrap().event)
            .collect();
        assert_eq!(seen, vec!["values", "__stream_end__"]);

        let late: Vec<_> = queue
            .subscribe(ReadFrom::Tail)
            .await
            .unwrap()
            .collect::<Vec<_>>()
            .await;
        assert_eq!(late.len(), 1);
        assert!(late[0].as_ref().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_redis_reader_wakes_on_publish() {
        let Some(factory) = factory().await else {
            return;
        };
        let id = uuid::Uuid::new_v4().to_string();
        let queue = factory.create(&id).await.unwrap();

        let mut reader = queue.subscribe(ReadFrom::Start).await.unwrap();
        let writer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .push(EventMessage::new("values", json!({"n": 1})))
                .await
                .unwrap();
        });

        let first = tokio::time::timeout(Duration::from_millis(500), reader.next())
            .await
            .expect("reader was not woken by the push")
            .unwrap()
            .unwrap();
        assert_eq!(first.event, "values");
        assert_eq!(first.id.as_deref(), Some("0"));
    }
}
