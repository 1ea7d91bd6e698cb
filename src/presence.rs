//! Presence & membership registry, plus the reaper.
//!
//! Presence is the transient fact that a user has a live session. It lives
//! entirely in the bus: a per-user hash refreshed by the session heartbeat,
//! the per-room members set, the historical clients set, and the global
//! online set. All writes for one lifecycle step go through a single atomic
//! pipeline so that a crash never leaves the indexes half-updated relative
//! to each other for that step.
//!
//! The reaper is a singleton background task: once a minute it walks the
//! presence hashes, removes anything not heartbeat-refreshed within the
//! staleness threshold, and announces the timeout to the affected room.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::bus::{keys, BusError, MessageBus};
use crate::config::ServerConfig;
use crate::engine::RoomEngine;
use crate::protocol::ChatMessage;

/// A parsed presence hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub room_id: String,
    pub nickname: String,
    pub connection_id: String,
    /// Unix seconds of the last heartbeat
    pub last_seen: i64,
}

/// Whether a presence entry has outlived the staleness threshold.
pub(crate) fn is_stale(last_seen: i64, now: i64, stale_after: i64) -> bool {
    now - last_seen > stale_after
}

/// Parse a presence hash fetched under `key` (`client:{userId}`).
pub(crate) fn parse_entry(
    key: &str,
    fields: &HashMap<String, String>,
) -> Option<PresenceEntry> {
    let user_id = key.strip_prefix("client:")?;
    let last_seen = fields.get("lastSeen")?.parse().ok()?;
    Some(PresenceEntry {
        user_id: user_id.to_string(),
        room_id: fields.get("roomID")?.clone(),
        nickname: fields.get("nickname").cloned().unwrap_or_default(),
        connection_id: fields.get("connectionID").cloned().unwrap_or_default(),
        last_seen,
    })
}

/// Typed facade over the bus for session lifecycle bookkeeping.
#[derive(Clone)]
pub struct PresenceRegistry {
    bus: MessageBus,
    ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(bus: MessageBus, config: &ServerConfig) -> Self {
        Self {
            bus,
            ttl: config.presence_ttl(),
        }
    }

    /// Record a fresh session: presence hash, room membership, historical
    /// client index, global online set. One atomic pipeline.
    pub async fn register(
        &self,
        user_id: &str,
        room_id: &str,
        nickname: &str,
        connection_id: &str,
    ) -> Result<(), BusError> {
        let presence_key = keys::presence(user_id);
        let members_key = keys::room_members(room_id);
        let clients_key = keys::room_clients(room_id);
        let ttl = self.ttl.as_secs() as i64;

        let fields: [(&str, String); 4] = [
            ("roomID", room_id.to_string()),
            ("nickname", nickname.to_string()),
            ("connectionID", connection_id.to_string()),
            ("lastSeen", Utc::now().timestamp().to_string()),
        ];

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&presence_key, &fields)
            .ignore()
            .expire(&presence_key, ttl)
            .ignore()
            .sadd(&members_key, user_id)
            .ignore()
            .expire(&members_key, ttl)
            .ignore()
            .sadd(&clients_key, user_id)
            .ignore()
            .expire(&clients_key, ttl)
            .ignore()
            .sadd(keys::ONLINE_USERS, user_id)
            .ignore();
        self.bus.exec_pipeline(&pipe).await
    }

    /// Refresh the liveness stamp.
    pub async fn heartbeat(&self, user_id: &str) -> Result<(), BusError> {
        self.bus
            .hset(
                &keys::presence(user_id),
                &[("lastSeen", Utc::now().timestamp().to_string())],
            )
            .await
    }

    /// Remove a session's presence. The historical clients set is left
    /// alone; its TTL retires it.
    pub async fn unregister(&self, user_id: &str, room_id: &str) -> Result<(), BusError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(keys::presence(user_id))
            .ignore()
            .srem(keys::room_members(room_id), user_id)
            .ignore()
            .srem(keys::ONLINE_USERS, user_id)
            .ignore();
        self.bus.exec_pipeline(&pipe).await
    }

    /// Fetch a presence entry, `None` when absent or unparsable.
    pub async fn lookup(&self, user_id: &str) -> Result<Option<PresenceEntry>, BusError> {
        let key = keys::presence(user_id);
        let fields = self.bus.hgetall(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(parse_entry(&key, &fields))
    }
}

/// Spawn the reaper. One per process; deployments with several instances
/// should elect a single reaper or accept duplicate timeout notices.
pub fn spawn_reaper(
    bus: MessageBus,
    engine: RoomEngine,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(config.reaper_period_s);
    let stale_after = config.stale_after_s as i64;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first interval tick fires immediately; skip it so the initial
        // sweep happens one full period after startup.
        ticker.tick().await;
        log::info!("Reaper running, period {}s, staleness {}s", period.as_secs(), stale_after);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep(&bus, &engine, stale_after).await {
                        log::error!("Reaper sweep failed: {e}");
                    }
                }
            }
        }
        log::info!("Reaper stopped");
    })
}

/// One sweep over the presence hashes.
async fn sweep(bus: &MessageBus, engine: &RoomEngine, stale_after: i64) -> Result<(), BusError> {
    let now = Utc::now().timestamp();
    let presence_keys = bus.scan_keys("client:*").await?;

    for key in presence_keys {
        let fields = match bus.hgetall(&key).await {
            Ok(fields) => fields,
            Err(e) => {
                log::warn!("Reaper could not read {key}: {e}");
                continue;
            }
        };
        let Some(entry) = parse_entry(&key, &fields) else {
            continue;
        };
        if !is_stale(entry.last_seen, now, stale_after) {
            continue;
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(&key)
            .ignore()
            .srem(keys::room_members(&entry.room_id), &entry.user_id)
            .ignore()
            .srem(keys::ONLINE_USERS, &entry.user_id)
            .ignore();
        if let Err(e) = bus.exec_pipeline(&pipe).await {
            log::error!("Reaper could not expire {}: {e}", entry.user_id);
            continue;
        }

        log::info!(
            "Expired stale presence of {} in room {} ({}s old)",
            entry.user_id,
            entry.room_id,
            now - entry.last_seen
        );
        let notice = ChatMessage::disconnect_notice(&entry.room_id, &entry.nickname);
        if let Err(e) = engine.broadcast(&notice).await {
            log::error!("Failed to announce timeout of {}: {e}", entry.user_id);
        }
    }
    Ok(())
}
