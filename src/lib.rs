//! # roomcast — multi-tenant real-time chat backend
//!
//! Clients hold a room-scoped WebSocket session, publish text messages, and
//! see other participants' messages in near real time, together with system
//! notices for moderation events (room lock/unlock, disconnect timeouts,
//! rate-limit refusals).
//!
//! ## Architecture
//!
//! ```text
//!  Client A ──ws── Session ──┐
//!                            ├─ RoomEngine ──► MongoDB   (message log,
//!  Client B ──ws── Session ──┘      │          room documents, lockedBy)
//!        ▲                          ▼
//!        │                    Redis topic "room:{id}"
//!        │                          │
//!        └───── outbound forwarder ◄┘   (fan-out across every server
//!                                        instance subscribed to the room)
//!
//!  Redis shared state: presence hashes, member sets, replay buffer
//!  (sorted set), rate-limit stamps. A singleton reaper expires stale
//!  presence and announces the timeout to the room.
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — framed-JSON wire protocol
//! - [`config`] — configuration with env overrides
//! - [`auth`] — collaborator-issued token validation
//! - [`bus`] — Redis pub/sub + shared-state adapter
//! - [`store`] — MongoDB persistence adapter
//! - [`presence`] — presence registry and the reaper
//! - [`engine`] — broadcast pipeline, lock state machine, rate limiter, replay
//! - [`session`] — per-connection supervisor
//! - [`server`] — accept loop and upgrade handshake

pub mod auth;
pub mod bus;
pub mod config;
pub mod engine;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod store;

// Re-exports for convenience
pub use auth::{AuthError, Claims};
pub use bus::{BusError, MessageBus, Subscription};
pub use config::ServerConfig;
pub use engine::{LockOutcome, RateDecision, RoomEngine, SendGate};
pub use presence::{spawn_reaper, PresenceEntry, PresenceRegistry};
pub use protocol::{ChatMessage, MessageKind, ProtocolError};
pub use server::{ChatServer, ServerError};
pub use session::{Session, SessionError, SessionRequest};
pub use store::{Activity, ChatStore, ListOrder, Member, Room, StoreError};
