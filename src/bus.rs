//! Redis-backed pub/sub bus and shared-state adapter.
//!
//! The bus is the only hub through which sessions on different server
//! instances see each other: per-room topics carry live frames, and a small
//! set of shared-state primitives carries presence, membership, the replay
//! buffer, and rate-limit stamps.
//!
//! Key layout (literal, stable):
//! ```text
//! room:{roomId}:clients        set of userId (historical index, TTL 24h)
//! room:{roomId}:members        set of userId (currently connected, TTL 24h)
//! room:{roomId}:history        sorted set, score = unix secs, member = frame
//! client:{userId}              hash {roomID, nickname, connectionID, lastSeen}
//! users:online                 set of userId
//! rate_limit:{userId}:last_msg kv, RFC 3339 Nano timestamp, TTL 2·delay
//! ```
//!
//! Commands multiplex over one managed connection; subscriptions each own a
//! dedicated connection because a subscribed Redis connection cannot issue
//! other commands.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Bus key layout.
pub mod keys {
    /// Set of all connected users, across rooms.
    pub const ONLINE_USERS: &str = "users:online";

    /// Presence hash for one user.
    pub fn presence(user_id: &str) -> String {
        format!("client:{user_id}")
    }

    /// Currently connected members of a room.
    pub fn room_members(room_id: &str) -> String {
        format!("room:{room_id}:members")
    }

    /// Historical index of users that ever connected to a room.
    pub fn room_clients(room_id: &str) -> String {
        format!("room:{room_id}:clients")
    }

    /// Replay buffer for a room.
    pub fn room_history(room_id: &str) -> String {
        format!("room:{room_id}:history")
    }

    /// Rate-limit stamp for a user.
    pub fn rate_limit(user_id: &str) -> String {
        format!("rate_limit:{user_id}:last_msg")
    }
}

/// Bus errors.
#[derive(Debug, Clone)]
pub enum BusError {
    /// The endpoint could not be reached or refused the connection
    Connection(String),
    /// A command failed after the connection was established
    Command(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Bus connection error: {e}"),
            Self::Command(e) => write!(f, "Bus command error: {e}"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<redis::RedisError> for BusError {
    fn from(e: redis::RedisError) -> Self {
        BusError::Command(e.to_string())
    }
}

/// The process-wide bus handle. Cheap to clone; commands serialize per
/// underlying connection.
#[derive(Clone)]
pub struct MessageBus {
    client: redis::Client,
    conn: ConnectionManager,
}

impl MessageBus {
    /// Connect to the bus and verify the endpoint responds.
    ///
    /// An unreachable bus is fatal for setup: callers are expected to abort.
    pub async fn connect(dsn: &str) -> Result<Self, BusError> {
        let client =
            redis::Client::open(dsn).map_err(|e| BusError::Connection(e.to_string()))?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let _: () = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        Ok(Self { client, conn })
    }

    /// Publish a payload on a topic. At-least-once, best-effort; durability
    /// is the replay buffer's job.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(topic, payload).await?;
        Ok(())
    }

    /// Subscribe to a topic on a dedicated connection.
    pub async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;
        pubsub.subscribe(topic).await?;
        Ok(Subscription { pubsub })
    }

    /// Add a member to a sorted set under the given score.
    pub async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    /// The `count` highest-scored members, highest first.
    pub async fn zrevrange_by_score(
        &self,
        key: &str,
        count: usize,
    ) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrevrangebyscore_limit(key, "+inf", "-inf", 0, count as isize)
            .await?;
        Ok(members)
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    pub async fn scard(&self, key: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(key).await?)
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    /// Set hash fields on a key.
    pub async fn hset(&self, key: &str, fields: &[(&str, String)]) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.hgetall(key).await?)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    pub async fn del(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// All keys matching a glob pattern, via cursor scan.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter: redis::AsyncIter<String> = conn.scan_match(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    /// SET with a millisecond TTL.
    pub async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Run a batched pipeline atomically on one connection.
    pub async fn exec_pipeline(&self, pipe: &redis::Pipeline) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

/// A live subscription to one topic. Dropping it closes the underlying
/// connection and ends the stream.
pub struct Subscription {
    pubsub: redis::aio::PubSub,
}

impl Subscription {
    /// The next published payload, or `None` once the connection is gone.
    pub async fn next_payload(&mut self) -> Option<String> {
        let mut stream = self.pubsub.on_message();
        let msg = stream.next().await?;
        msg.get_payload().ok()
    }
}
