use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use std::time::Duration;
use tokio::time::Instant;

/// Opaque token returned with a received message; required to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryReceipt(String);

impl DeliveryReceipt {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A job message taken off the queue but not yet acknowledged.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub receipt: DeliveryReceipt,
}

/// Source of pending jobs.
///
/// A received message stays owned by the source until it is acknowledged;
/// a message that is never acknowledged is eventually redelivered.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait` for the first one.
    /// An empty batch is a normal result.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Remove a received message from the source for good.
    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), QueueError>;
}

/// How long a received message stays invisible before it is redelivered.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(900);

/// Pause between claim attempts while long-polling an empty queue.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

// KEYS: pending, in_flight, payloads. ARGV: cutoff score.
const REQUEUE_EXPIRED_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1])
for _, id in ipairs(expired) do
    local body = redis.call('HGET', KEYS[3], id)
    redis.call('ZREM', KEYS[2], id)
    redis.call('HDEL', KEYS[3], id)
    if body then
        redis.call('RPUSH', KEYS[1], body)
    end
end
return #expired
"#;

// KEYS: pending, in_flight, payloads, sequence. ARGV: max messages, deadline.
// Returns a flat list of receipt id, body pairs.
const CLAIM_SCRIPT: &str = r#"
local claimed = {}
for _ = 1, tonumber(ARGV[1]) do
    local body = redis.call('RPOP', KEYS[1])
    if not body then
        break
    end
    local id = tostring(redis.call('INCR', KEYS[4]))
    redis.call('ZADD', KEYS[2], ARGV[2], id)
    redis.call('HSET', KEYS[3], id, body)
    claimed[#claimed + 1] = id
    claimed[#claimed + 1] = body
end
return claimed
"#;

/// Redis-backed queue with a visibility timeout.
///
/// Producers `LPUSH` onto the pending list. Receiving claims messages under a
/// fresh receipt id: the id goes into the in-flight sorted set scored by its
/// redelivery deadline and the body into the payload hash, in one script.
/// Acknowledging removes both. Every receive first moves messages whose
/// deadline has passed back to the pending list, so a failed acknowledge, a
/// lost job task or a crashed worker all lead to redelivery.
pub struct RedisQueue {
    client: redis::Client,
    pending_key: String,
    in_flight_key: String,
    payloads_key: String,
    sequence_key: String,
    visibility_timeout: Duration,
    claim_script: Script,
    requeue_script: Script,
}

impl RedisQueue {
    pub fn new(
        redis_url: &str,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            pending_key: queue_name.to_string(),
            in_flight_key: format!("{queue_name}:in_flight"),
            payloads_key: format!("{queue_name}:payloads"),
            sequence_key: format!("{queue_name}:seq"),
            visibility_timeout,
            claim_script: Script::new(CLAIM_SCRIPT),
            requeue_script: Script::new(REQUEUE_EXPIRED_SCRIPT),
        })
    }

    pub fn pending_key(&self) -> &str {
        &self.pending_key
    }

    pub fn in_flight_key(&self) -> &str {
        &self.in_flight_key
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Push a raw job body onto the pending list.
    pub async fn enqueue(&self, body: &str) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lpush::<_, _, ()>(&self.pending_key, body).await?;
        Ok(())
    }

    /// Move every in-flight message back to the pending list regardless of
    /// its deadline. An operator tool: messages still being worked on will be
    /// delivered twice. Returns how many messages were moved.
    pub async fn requeue_in_flight(&self) -> Result<usize, QueueError> {
        self.requeue_before("+inf").await
    }

    /// Move messages whose visibility deadline has passed back to pending.
    pub async fn requeue_expired(&self) -> Result<usize, QueueError> {
        self.requeue_before(now_millis()).await
    }

    async fn requeue_before<T: redis::ToRedisArgs + Send + Sync>(
        &self,
        cutoff: T,
    ) -> Result<usize, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let moved: usize = self
            .requeue_script
            .key(&self.pending_key)
            .key(&self.in_flight_key)
            .key(&self.payloads_key)
            .arg(cutoff)
            .invoke_async(&mut conn)
            .await?;
        if moved > 0 {
            tracing::warn!(queue = %self.pending_key, moved, "Requeued unacknowledged messages");
        }
        Ok(moved)
    }

    /// Claim up to `max_messages` without waiting.
    async fn claim(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let deadline = now_millis().saturating_add(duration_millis(self.visibility_timeout));
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let claimed: Vec<String> = self
            .claim_script
            .key(&self.pending_key)
            .key(&self.in_flight_key)
            .key(&self.payloads_key)
            .key(&self.sequence_key)
            .arg(max_messages)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;
        Ok(claimed_messages(claimed))
    }

    /// Check Redis connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    /// Number of messages waiting to be received.
    pub async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let depth: u64 = conn.llen(&self.pending_key).await?;
        Ok(depth)
    }

    /// Number of received messages not yet acknowledged.
    pub async fn in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let count: u64 = conn.zcard(&self.in_flight_key).await?;
        Ok(count)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Pair up the claim script's flat `[id, body, id, body, ...]` reply.
fn claimed_messages(reply: Vec<String>) -> Vec<ReceivedMessage> {
    let mut reply = reply.into_iter();
    let mut messages = Vec::with_capacity(reply.len() / 2);
    while let (Some(id), Some(body)) = (reply.next(), reply.next()) {
        messages.push(ReceivedMessage {
            body,
            receipt: DeliveryReceipt::new(id),
        });
    }
    messages
}

#[async_trait]
impl MessageSource for RedisQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let give_up = Instant::now() + wait;
        loop {
            self.requeue_expired().await?;

            let messages = self.claim(max_messages).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let remaining = give_up.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(messages);
            }
            tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    async fn acknowledge(&self, receipt: &DeliveryReceipt) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .zrem(&self.in_flight_key, receipt.as_str())
            .hdel(&self.payloads_key, receipt.as_str())
            .query_async(&mut conn)
            .await?;
        if removed == 0 {
            tracing::debug!(
                queue = %self.pending_key,
                receipt = receipt.as_str(),
                "Acknowledged message was no longer in flight"
            );
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
