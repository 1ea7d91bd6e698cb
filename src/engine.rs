//! Room state engine.
//!
//! Everything a session consults before and during fan-out lives here: the
//! broadcast pipeline (persist, replay-buffer append, publish), the room-lock
//! state machine, the per-user rate limiter, and the replay read. The lock
//! and rate decisions are pure functions; the engine wraps them with the
//! adapter calls.
//!
//! Broadcast is persist-then-publish so that a reader who queries history
//! right after receiving a live frame sees it. Neither half is transactional:
//! adapter failures on the durability side are logged and absorbed, and the
//! only result surfaced to callers is the publish result.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::bus::{keys, BusError, MessageBus};
use crate::config::ServerConfig;
use crate::protocol::ChatMessage;
use crate::store::{ChatStore, StoreError};

/// Outcome of a lock request, as reported to the moderation caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The requester now holds the lock
    Locked,
    /// The requester held the lock and released it
    Unlocked,
    /// Held by someone else, or the requester is not a member
    Forbidden,
    /// The room does not exist
    NotFound,
}

/// Whether a member may send into the room right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendGate {
    /// Unlocked, or just implicitly unlocked by the holder
    Open,
    /// Locked by another member; the frame must be refused privately
    LockedByOther,
}

/// Rate limiter verdict.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allowed,
    Refused { wait: Duration },
}

impl RateDecision {
    /// Seconds the sender still has to wait, zero when allowed.
    pub fn wait_seconds(&self) -> f64 {
        match self {
            RateDecision::Allowed => 0.0,
            RateDecision::Refused { wait } => wait.as_secs_f64(),
        }
    }
}

/// One step of the lock state machine, before membership is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStep {
    /// Unlocked → locked by the requester
    Acquire,
    /// Locked by the requester → unlocked
    Release,
    /// Locked by someone else → unchanged
    Refuse,
}

/// State-machine transition for a lock request from `user_id` against the
/// current `locked_by` field. Membership is the caller's guard.
pub(crate) fn lock_transition(locked_by: &str, user_id: &str) -> LockStep {
    if locked_by.is_empty() {
        LockStep::Acquire
    } else if locked_by == user_id {
        LockStep::Release
    } else {
        LockStep::Refuse
    }
}

/// Rate window decision: a missing or aged stamp admits the message, a
/// recent one refuses it with the remaining wait.
pub(crate) fn rate_window(
    last: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    delay: Duration,
) -> RateDecision {
    let Some(last) = last else {
        return RateDecision::Allowed;
    };
    let elapsed = (now - last).to_std().unwrap_or_default();
    if elapsed < delay {
        RateDecision::Refused {
            wait: delay - elapsed,
        }
    } else {
        RateDecision::Allowed
    }
}

/// The room state engine. Cheap to clone; shared by sessions and the reaper.
#[derive(Clone)]
pub struct RoomEngine {
    bus: MessageBus,
    store: ChatStore,
    replay_count: usize,
    message_delay: Duration,
    max_message_len: usize,
}

impl RoomEngine {
    pub fn new(bus: MessageBus, store: ChatStore, config: &ServerConfig) -> Self {
        Self {
            bus,
            store,
            replay_count: config.replay_count,
            message_delay: config.message_delay(),
            max_message_len: config.max_message_len,
        }
    }

    /// The message-size threshold, enforced by the session supervisor.
    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Default replay depth for new subscribers.
    pub fn replay_count(&self) -> usize {
        self.replay_count
    }

    /// Fan a frame out to the room: append to the message log (best effort),
    /// append to the replay buffer scored by timestamp (best effort), then
    /// publish on the room topic. Only the publish result reaches the caller.
    pub async fn broadcast(&self, msg: &ChatMessage) -> Result<(), BusError> {
        let payload = msg
            .encode()
            .map_err(|e| BusError::Command(e.to_string()))?;

        if let Err(e) = self.store.append_message(msg).await {
            log::error!("Failed to append message to the log for room {}: {e}", msg.room_id);
        }

        let history_key = keys::room_history(&msg.room_id);
        if let Err(e) = self
            .bus
            .zadd(&history_key, msg.timestamp.timestamp() as f64, &payload)
            .await
        {
            log::error!("Failed to append to replay buffer for room {}: {e}", msg.room_id);
        }

        self.bus.publish(&msg.room_id, &payload).await
    }

    /// Lock request from the moderation entry point.
    ///
    /// Unlocked rooms lock to the requester; a room locked by the requester
    /// unlocks; anything else is refused. Both transitions announce
    /// themselves with a system broadcast.
    pub async fn try_lock(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<LockOutcome, StoreError> {
        let Some(room) = self.store.get_room(room_id).await? else {
            return Ok(LockOutcome::NotFound);
        };
        if !room.is_member(user_id) {
            return Ok(LockOutcome::Forbidden);
        }
        let nickname = room.nickname_of(user_id).unwrap_or_default().to_string();

        match lock_transition(&room.locked_by, user_id) {
            LockStep::Acquire => {
                self.store.update_room_locked(room_id, user_id).await?;
                let notice = ChatMessage::lock_changed_notice(room_id, &nickname, true);
                if let Err(e) = self.broadcast(&notice).await {
                    log::error!("Failed to announce lock of room {room_id}: {e}");
                }
                Ok(LockOutcome::Locked)
            }
            LockStep::Release => {
                self.store.update_room_locked(room_id, "").await?;
                let notice = ChatMessage::lock_changed_notice(room_id, &nickname, false);
                if let Err(e) = self.broadcast(&notice).await {
                    log::error!("Failed to announce unlock of room {room_id}: {e}");
                }
                Ok(LockOutcome::Unlocked)
            }
            LockStep::Refuse => Ok(LockOutcome::Forbidden),
        }
    }

    /// Consult the lock on the inbound path. The holder sending anything
    /// implicitly unlocks the room (announced to everyone); other members
    /// get a private refusal while the lock stands.
    pub async fn send_gate(
        &self,
        room_id: &str,
        user_id: &str,
        nickname: &str,
    ) -> Result<SendGate, StoreError> {
        let Some(room) = self.store.get_room(room_id).await? else {
            // The room document vanished mid-session; nothing is locked.
            return Ok(SendGate::Open);
        };

        if !room.locked_by.is_empty() && room.locked_by == user_id {
            self.store.update_room_locked(room_id, "").await?;
            let notice = ChatMessage::lock_changed_notice(room_id, nickname, false);
            if let Err(e) = self.broadcast(&notice).await {
                log::error!("Failed to announce unlock of room {room_id}: {e}");
            }
            return Ok(SendGate::Open);
        }

        if !room.locked_by.is_empty() {
            return Ok(SendGate::LockedByOther);
        }
        Ok(SendGate::Open)
    }

    /// Check and refresh the sender's rate window. Bus trouble admits the
    /// message: the limiter is advisory and must not block the room.
    pub async fn check_rate_limit(&self, user_id: &str) -> RateDecision {
        let key = keys::rate_limit(user_id);
        let last = match self.bus.get(&key).await {
            Ok(value) => value,
            Err(e) => {
                log::error!("Failed to check rate limit for {user_id}: {e}");
                return RateDecision::Allowed;
            }
        };
        let last = last.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        });

        let now = Utc::now();
        let decision = rate_window(last, now, self.message_delay);
        if decision == RateDecision::Allowed {
            let stamp = now.to_rfc3339_opts(SecondsFormat::Nanos, true);
            if let Err(e) = self
                .bus
                .set_with_ttl(&key, &stamp, self.message_delay * 2)
                .await
            {
                log::error!("Failed to refresh rate limit stamp for {user_id}: {e}");
            }
        }
        decision
    }

    /// The `count` most recent frames of a room, oldest first. Undecodable
    /// buffer entries are skipped.
    pub async fn load_replay(&self, room_id: &str, count: usize) -> Vec<ChatMessage> {
        let history_key = keys::room_history(room_id);
        match self.bus.zrevrange_by_score(&history_key, count).await {
            Ok(raw) => raw
                .into_iter()
                .rev()
                .filter_map(|payload| ChatMessage::decode(&payload).ok())
                .collect(),
            Err(e) => {
                log::error!("Failed to load replay for room {room_id}: {e}");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    // ── lock state machine ───────────────────────────────────────

    #[test]
    fn test_lock_unlocked_room_acquires() {
        assert_eq!(lock_transition("", "u1"), LockStep::Acquire);
    }

    #[test]
    fn test_lock_holder_releases() {
        assert_eq!(lock_transition("u1", "u1"), LockStep::Release);
    }

    #[test]
    fn test_lock_other_holder_refuses() {
        assert_eq!(lock_transition("u1", "u2"), LockStep::Refuse);
    }

    #[test]
    fn test_lock_sequence_never_leaves_the_two_states() {
        // Drive the machine through an arbitrary event sequence and check it
        // only ever rests in "" or a requester's ID.
        let mut locked_by = String::new();
        for user in ["u1", "u2", "u1", "u1", "u3", "u2"] {
            match lock_transition(&locked_by, user) {
                LockStep::Acquire => locked_by = user.to_string(),
                LockStep::Release => locked_by.clear(),
                LockStep::Refuse => {}
            }
            assert!(locked_by.is_empty() || ["u1", "u2", "u3"].contains(&locked_by.as_str()));
        }
    }

    // ── rate window ──────────────────────────────────────────────

    #[test]
    fn test_rate_missing_stamp_allows() {
        let now = Utc::now();
        assert_eq!(
            rate_window(None, now, Duration::from_millis(1500)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn test_rate_recent_stamp_refuses_with_remaining_wait() {
        let now = Utc::now();
        let last = now - TimeDelta::milliseconds(500);
        match rate_window(Some(last), now, Duration::from_millis(1500)) {
            RateDecision::Refused { wait } => {
                let secs = wait.as_secs_f64();
                assert!((secs - 1.0).abs() < 0.05, "expected ~1.0s wait, got {secs}");
            }
            RateDecision::Allowed => panic!("expected refusal inside the window"),
        }
    }

    #[test]
    fn test_rate_aged_stamp_allows() {
        let now = Utc::now();
        let last = now - TimeDelta::milliseconds(1600);
        assert_eq!(
            rate_window(Some(last), now, Duration::from_millis(1500)),
            RateDecision::Allowed
        );
    }

    #[test]
    fn test_rate_clock_skew_allows() {
        // A stamp from the future must not wedge the sender forever.
        let now = Utc::now();
        let last = now + TimeDelta::milliseconds(500);
        match rate_window(Some(last), now, Duration::from_millis(1500)) {
            RateDecision::Refused { wait } => {
                assert!(wait <= Duration::from_millis(1500));
            }
            RateDecision::Allowed => {}
        }
    }

    #[test]
    fn test_wait_seconds_accessor() {
        assert_eq!(RateDecision::Allowed.wait_seconds(), 0.0);
        let refused = RateDecision::Refused {
            wait: Duration::from_millis(1250),
        };
        assert!((refused.wait_seconds() - 1.25).abs() < 1e-9);
    }
}
