//! MongoDB persistence adapter.
//!
//! Three collections back the message plane:
//! - `rooms` — room documents: member list plus the authoritative `lockedBy`
//!   field of the lock state machine
//! - `messages` — append-only message log, expired after 90 days by a TTL
//!   index on `createdAt`
//! - `users` — activity flag (`online`/`offline`) kept in sync with presence
//!
//! Appends on the broadcast path are best-effort: failures are logged by the
//! engine and never surfaced to the sender.

use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, to_bson};
use mongodb::options::IndexOptions;
use mongodb::{Client, Collection, Database, IndexModel};
use serde::{Deserialize, Serialize};

use crate::bus::MessageBus;
use crate::protocol::{ChatMessage, MessageKind};

const ROOMS: &str = "rooms";
const MESSAGES: &str = "messages";
const USERS: &str = "users";

/// Message log retention, enforced by a TTL index.
const MESSAGE_RETENTION: std::time::Duration =
    std::time::Duration::from_secs(90 * 24 * 60 * 60);

/// A user recorded in a room document. Membership is persistent and
/// orthogonal to current connectivity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Member {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub nickname: String,
    #[serde(
        rename = "joinedAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub joined_at: DateTime<Utc>,
}

impl Member {
    pub fn new(user_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: nickname.into(),
            joined_at: Utc::now(),
        }
    }
}

/// A room document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub users: Vec<Member>,
    #[serde(rename = "lockedBy", default)]
    pub locked_by: String,
    #[serde(
        rename = "createdAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "updatedAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub updated_at: DateTime<Utc>,
}

impl Room {
    /// Whether the user was accepted into this room by registration.
    pub fn is_member(&self, user_id: &str) -> bool {
        self.users.iter().any(|m| m.user_id == user_id)
    }

    /// Display name of a member, if present.
    pub fn nickname_of(&self, user_id: &str) -> Option<&str> {
        self.users
            .iter()
            .find(|m| m.user_id == user_id)
            .map(|m| m.nickname.as_str())
    }
}

/// One entry of the message log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub message: String,
    #[serde(rename = "fromUserId", default)]
    pub from_user_id: String,
    #[serde(default)]
    pub nickname: String,
    #[serde(
        rename = "createdAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub created_at: DateTime<Utc>,
    #[serde(
        rename = "updatedAt",
        with = "bson::serde_helpers::chrono_datetime_as_bson_datetime"
    )]
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    fn from_frame(msg: &ChatMessage) -> Self {
        Self {
            room_id: msg.room_id.clone(),
            message: msg.content.clone(),
            from_user_id: msg.sender_id.clone(),
            nickname: msg.nickname.clone(),
            created_at: msg.timestamp,
            updated_at: msg.timestamp,
        }
    }

    /// Rehydrate a wire frame. Log entries with no sender are system notices.
    pub fn into_frame(self) -> ChatMessage {
        let kind = if self.from_user_id.is_empty() {
            MessageKind::System
        } else {
            MessageKind::Text
        };
        ChatMessage {
            kind,
            content: self.message,
            room_id: self.room_id,
            sender_id: self.from_user_id,
            nickname: self.nickname,
            timestamp: self.created_at,
            metadata: None,
        }
    }
}

/// User activity flag mirrored from presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Online,
    Offline,
}

impl Activity {
    pub fn as_str(self) -> &'static str {
        match self {
            Activity::Online => "online",
            Activity::Offline => "offline",
        }
    }
}

/// Paged history order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOrder {
    NewestFirst,
    OldestFirst,
}

/// Persistence errors.
#[derive(Debug)]
pub enum StoreError {
    /// The endpoint could not be reached
    Connection(String),
    /// A query or write failed
    Database(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Store connection error: {e}"),
            Self::Database(e) => write!(f, "Store error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<mongodb::error::Error> for StoreError {
    fn from(e: mongodb::error::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// The process-wide persistence handle. Cheap to clone.
#[derive(Clone)]
pub struct ChatStore {
    db: Database,
}

impl ChatStore {
    /// Connect to the database.
    pub async fn connect(dsn: &str, db_name: &str) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(dsn)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            db: client.database(db_name),
        })
    }

    fn rooms(&self) -> Collection<Room> {
        self.db.collection(ROOMS)
    }

    fn messages(&self) -> Collection<StoredMessage> {
        self.db.collection(MESSAGES)
    }

    /// Create or verify the indexes the message plane relies on: the
    /// compound unique `(room, member)` index, the unique external user ID,
    /// and the 90-day TTL on the message log.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.rooms()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "_id": 1, "users.userId": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;

        self.db
            .collection::<mongodb::bson::Document>(USERS)
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "externalId": 1 })
                    .options(IndexOptions::builder().unique(true).build())
                    .build(),
            )
            .await?;

        self.messages()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "createdAt": 1 })
                    .options(
                        IndexOptions::builder()
                            .expire_after(MESSAGE_RETENTION)
                            .build(),
                    )
                    .build(),
            )
            .await?;

        Ok(())
    }

    /// Append one frame to the message log.
    pub async fn append_message(&self, msg: &ChatMessage) -> Result<(), StoreError> {
        self.messages()
            .insert_one(StoredMessage::from_frame(msg))
            .await?;
        Ok(())
    }

    /// Paged read of a room's log.
    pub async fn list_messages(
        &self,
        room_id: &str,
        limit: i64,
        skip: u64,
        order: ListOrder,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        // _id breaks ties between frames that share a millisecond
        let sort = match order {
            ListOrder::NewestFirst => doc! { "createdAt": -1, "_id": -1 },
            ListOrder::OldestFirst => doc! { "createdAt": 1, "_id": 1 },
        };
        let mut cursor = self
            .messages()
            .find(doc! { "roomId": room_id })
            .sort(sort)
            .skip(skip)
            .limit(limit)
            .await?;

        let mut out = Vec::new();
        while let Some(stored) = cursor.try_next().await? {
            out.push(stored.into_frame());
        }
        Ok(out)
    }

    /// Fetch a room document, `None` when absent.
    pub async fn get_room(&self, room_id: &str) -> Result<Option<Room>, StoreError> {
        Ok(self.rooms().find_one(doc! { "_id": room_id }).await?)
    }

    /// Single-field set of the authoritative lock holder; empty unlocks.
    pub async fn update_room_locked(
        &self,
        room_id: &str,
        locked_by: &str,
    ) -> Result<(), StoreError> {
        self.rooms()
            .update_one(
                doc! { "_id": room_id },
                doc! { "$set": {
                    "lockedBy": locked_by,
                    "updatedAt": bson::DateTime::from_chrono(Utc::now()),
                } },
            )
            .await?;
        Ok(())
    }

    /// Upsert the room and add a member to it, without duplicating an
    /// existing registration.
    pub async fn add_member(&self, room_id: &str, member: Member) -> Result<(), StoreError> {
        if let Some(room) = self.get_room(room_id).await? {
            if room.is_member(&member.user_id) {
                return Ok(());
            }
        }

        let member_doc =
            to_bson(&member).map_err(|e| StoreError::Database(e.to_string()))?;
        let now = bson::DateTime::from_chrono(Utc::now());
        self.rooms()
            .update_one(
                doc! { "_id": room_id },
                doc! {
                    "$setOnInsert": { "createdAt": now },
                    "$set": { "updatedAt": now },
                    "$addToSet": { "users": member_doc },
                },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    /// Flip a user's activity flag.
    pub async fn set_user_activity(
        &self,
        user_id: &str,
        activity: Activity,
    ) -> Result<(), StoreError> {
        self.db
            .collection::<mongodb::bson::Document>(USERS)
            .update_one(
                doc! { "_id": user_id },
                doc! { "$set": {
                    "activity": activity.as_str(),
                    "updatedAt": bson::DateTime::from_chrono(Utc::now()),
                } },
            )
            .await?;
        Ok(())
    }

    /// Mark every online user offline. Run at startup (before the presence
    /// bootstrap) and at shutdown.
    pub async fn mark_all_offline(&self) -> Result<(), StoreError> {
        self.db
            .collection::<mongodb::bson::Document>(USERS)
            .update_many(
                doc! { "activity": "online" },
                doc! { "$set": {
                    "activity": "offline",
                    "updatedAt": bson::DateTime::from_chrono(Utc::now()),
                } },
            )
            .await?;
        Ok(())
    }

    /// Reconcile the activity flags with the bus at process start: everyone
    /// goes offline, then every user present in a room members set comes
    /// back online. Returns how many users were recovered.
    pub async fn bootstrap_online_from_presence(
        &self,
        bus: &MessageBus,
    ) -> Result<usize, StoreError> {
        self.mark_all_offline().await?;

        let member_keys = bus
            .scan_keys("room:*:members")
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut online: Vec<String> = Vec::new();
        for key in member_keys {
            let members = bus
                .smembers(&key)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
            online.extend(members);
        }
        online.sort();
        online.dedup();

        if !online.is_empty() {
            self.db
                .collection::<mongodb::bson::Document>(USERS)
                .update_many(
                    doc! { "_id": { "$in": online.clone() } },
                    doc! { "$set": {
                        "activity": "online",
                        "updatedAt": bson::DateTime::from_chrono(Utc::now()),
                    } },
                )
                .await?;
        }

        log::info!("Presence bootstrap: {} users back online", online.len());
        Ok(online.len())
    }
}
