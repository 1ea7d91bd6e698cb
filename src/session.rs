//! Session supervisor: owns one socket end-to-end.
//!
//! Task model per accepted connection:
//! ```text
//!             ┌──────────────────────────────┐
//!             │ supervisor (inbound loop)    │──┐
//!             └──────────────────────────────┘  │
//!             ┌──────────────────────────────┐  │  one CancellationToken;
//!             │ outbound forwarder           │──┼─ any task cancelling it
//!             │ (replay, then bus → socket)  │  │  stops all three
//!             └──────────────────────────────┘  │
//!             ┌──────────────────────────────┐  │
//!             │ heartbeat ticker (30 s)      │──┘
//!             └──────────────────────────────┘
//! ```
//!
//! No task holds a reference to another; the supervisor drives the cleanup
//! sequence after the inbound loop exits, and the cleanup guard makes a
//! second invocation a no-op. Replay is delivered before any live frame: the
//! forwarder subscribes first, writes the replay window, and only then starts
//! draining the subscription, so frames published during replay wait in the
//! subscription's own queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{MessageBus, Subscription};
use crate::engine::{RateDecision, RoomEngine, SendGate};
use crate::presence::PresenceRegistry;
use crate::protocol::{ChatMessage, MessageKind};
use crate::store::{Activity, ChatStore};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;
type SharedSink = Arc<Mutex<WsSink>>;

/// Identity of the participant behind one accepted handshake.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub room_id: String,
    pub user_id: String,
    pub nickname: String,
}

/// Everything a session needs from the rest of the process.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub engine: RoomEngine,
    pub presence: PresenceRegistry,
    pub store: ChatStore,
    pub bus: MessageBus,
    pub replay_count: usize,
    pub heartbeat_period: Duration,
}

/// Per-socket session state. The connection ID is fresh per accept and
/// unique across the cluster for the session's lifetime.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: String,
    pub nickname: String,
    pub room_id: String,
    pub connection_id: String,
}

impl Session {
    fn new(request: &SessionRequest) -> Self {
        Self {
            user_id: request.user_id.clone(),
            nickname: request.nickname.clone(),
            room_id: request.room_id.clone(),
            connection_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Session errors.
#[derive(Debug)]
pub enum SessionError {
    /// Socket read/write failure
    Transport(String),
    /// A frame could not be serialized for the socket
    Encoding(String),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {e}"),
            Self::Encoding(e) => write!(f, "Encoding error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

/// Echo suppression: a session never receives its own text frame back from
/// the bus. System frames always pass, as do frames from the same user's
/// other connections.
pub(crate) fn should_drop(frame: &ChatMessage, session: &Session) -> bool {
    frame.sender_id == session.user_id
        && frame.kind != MessageKind::System
        && frame.connection_id() == Some(session.connection_id.as_str())
}

/// Single-shot latch for the cleanup sequence.
pub(crate) struct CleanupGuard {
    done: AtomicBool,
}

impl CleanupGuard {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
        }
    }

    /// True exactly once.
    pub(crate) fn begin(&self) -> bool {
        !self.done.swap(true, Ordering::SeqCst)
    }
}

/// Drive one upgraded socket to completion. The request metadata has already
/// passed token validation; room authorization happens here, against the
/// room document.
pub(crate) async fn run_session(
    ctx: Arc<SessionContext>,
    ws: WebSocketStream<TcpStream>,
    request: SessionRequest,
) {
    let (sink, mut stream) = ws.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));

    // Authorization against the room document, after the upgrade: the
    // handshake layer cannot consult the store.
    let room = match ctx.store.get_room(&request.room_id).await {
        Ok(room) => room,
        Err(e) => {
            log::error!("Failed to get room {}: {e}", request.room_id);
            close_socket(&sink, CloseCode::Error, "Failed to get room").await;
            return;
        }
    };
    let Some(room) = room else {
        log::warn!("Rejected session for missing room {}", request.room_id);
        close_socket(&sink, CloseCode::Error, "Room not found").await;
        return;
    };
    if !room.is_member(&request.user_id) {
        log::warn!(
            "Rejected session: {} is not a member of room {}",
            request.user_id,
            request.room_id
        );
        close_socket(&sink, CloseCode::Error, "User not authorized to join room").await;
        return;
    }

    let session = Session::new(&request);
    log::info!(
        "Session {} opened: {} ({}) in room {}",
        session.connection_id,
        session.user_id,
        session.nickname,
        session.room_id
    );

    if let Err(e) = ctx
        .presence
        .register(
            &session.user_id,
            &session.room_id,
            &session.nickname,
            &session.connection_id,
        )
        .await
    {
        log::error!("Failed to register presence for {}: {e}", session.user_id);
        close_socket(&sink, CloseCode::Error, "Failed to initialize connection").await;
        return;
    }

    // Presence exists from here on: every exit path below must run cleanup.
    let guard = CleanupGuard::new();

    if let Err(e) = ctx
        .store
        .set_user_activity(&session.user_id, Activity::Online)
        .await
    {
        log::warn!("Failed to mark {} online: {e}", session.user_id);
    }

    let subscription = match ctx.bus.subscribe(&session.room_id).await {
        Ok(sub) => sub,
        Err(e) => {
            log::error!("Failed to subscribe to room {}: {e}", session.room_id);
            cleanup(&ctx, &session, &guard).await;
            close_socket(&sink, CloseCode::Error, "Failed to initialize connection").await;
            return;
        }
    };

    let shutdown = CancellationToken::new();

    let forwarder = tokio::spawn(forward_outbound(
        ctx.clone(),
        session.clone(),
        sink.clone(),
        subscription,
        shutdown.clone(),
    ));
    let heartbeat = tokio::spawn(run_heartbeat(
        ctx.clone(),
        session.clone(),
        shutdown.clone(),
    ));

    let close_code = inbound_loop(&ctx, &session, &sink, &mut stream, &shutdown).await;

    shutdown.cancel();
    cleanup(&ctx, &session, &guard).await;
    let _ = forwarder.await;
    let _ = heartbeat.await;
    close_socket(&sink, close_code, "").await;

    log::info!("Session {} closed", session.connection_id);
}

/// Replay, then live fan-in from the bus to the socket.
async fn forward_outbound(
    ctx: Arc<SessionContext>,
    session: Session,
    sink: SharedSink,
    mut subscription: Subscription,
    shutdown: CancellationToken,
) {
    let replay = ctx
        .engine
        .load_replay(&session.room_id, ctx.replay_count)
        .await;
    for frame in &replay {
        if let Err(e) = send_frame(&sink, frame).await {
            log::error!("Replay write to {} failed: {e}", session.connection_id);
            shutdown.cancel();
            return;
        }
    }
    if !replay.is_empty() {
        log::debug!(
            "Replayed {} frames to {}",
            replay.len(),
            session.connection_id
        );
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            payload = subscription.next_payload() => {
                let Some(payload) = payload else {
                    log::warn!("Bus subscription ended for {}", session.connection_id);
                    shutdown.cancel();
                    break;
                };
                let frame = match ChatMessage::decode(&payload) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Undecodable frame on room {}: {e}", session.room_id);
                        continue;
                    }
                };
                if should_drop(&frame, &session) {
                    continue;
                }
                if let Err(e) = send_frame(&sink, &frame).await {
                    log::error!("Write to {} failed: {e}", session.connection_id);
                    shutdown.cancel();
                    break;
                }
            }
        }
    }
}

/// Refresh the presence stamp until cancelled.
async fn run_heartbeat(ctx: Arc<SessionContext>, session: Session, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(ctx.heartbeat_period);
    // Registration just stamped lastSeen; skip the immediate first tick.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = ctx.presence.heartbeat(&session.user_id).await {
                    log::warn!("Heartbeat for {} failed: {e}", session.user_id);
                }
            }
        }
    }
}

/// Read frames from the socket until it closes or the session is cancelled.
/// Returns the close code to answer with.
async fn inbound_loop(
    ctx: &SessionContext,
    session: &Session,
    sink: &SharedSink,
    stream: &mut WsStream,
    shutdown: &CancellationToken,
) -> CloseCode {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return CloseCode::Normal,
            msg = stream.next() => {
                match msg {
                    None | Some(Ok(Message::Close(_))) => return CloseCode::Normal,
                    Some(Err(e)) => {
                        log::error!("Read error on {}: {e}", session.connection_id);
                        return CloseCode::Error;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let mut sink = sink.lock().await;
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return CloseCode::Error;
                        }
                    }
                    Some(Ok(Message::Text(raw))) => {
                        if handle_frame(ctx, session, sink, &raw).await.is_err() {
                            return CloseCode::Error;
                        }
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Validate, rate-limit, lock-check, stamp, and broadcast one inbound frame.
/// Validation and rate-limit refusals answer privately and keep the session
/// open; only write errors propagate.
async fn handle_frame(
    ctx: &SessionContext,
    session: &Session,
    sink: &SharedSink,
    raw: &str,
) -> Result<(), SessionError> {
    let frame = match ChatMessage::decode(raw) {
        Ok(frame) => frame,
        Err(e) => {
            log::warn!("Malformed frame from {}: {e}", session.connection_id);
            return send_frame(sink, &ChatMessage::malformed_notice(&session.room_id)).await;
        }
    };

    let max_len = ctx.engine.max_message_len();
    if frame.content.chars().count() > max_len {
        return send_frame(sink, &ChatMessage::oversize_notice(&session.room_id, max_len)).await;
    }

    let decision = ctx.engine.check_rate_limit(&session.user_id).await;
    if let RateDecision::Refused { .. } = decision {
        let notice =
            ChatMessage::rate_limited_notice(&session.room_id, decision.wait_seconds());
        return send_frame(sink, &notice).await;
    }

    match ctx
        .engine
        .send_gate(&session.room_id, &session.user_id, &session.nickname)
        .await
    {
        Ok(SendGate::Open) => {}
        Ok(SendGate::LockedByOther) => {
            return send_frame(sink, &ChatMessage::room_locked_notice(&session.room_id)).await;
        }
        Err(e) => {
            // Lock state unknown; drop the frame rather than bypass the lock.
            log::error!("Failed to check lock on room {}: {e}", session.room_id);
            return Ok(());
        }
    }

    // Stamp authoritatively. Client metadata rides along; the kind is forced
    // to text so a client cannot forge system notices.
    let mut stamped = frame;
    stamped.kind = MessageKind::Text;
    stamped.room_id = session.room_id.clone();
    stamped.sender_id = session.user_id.clone();
    stamped.nickname = session.nickname.clone();
    stamped.timestamp = Utc::now();
    let stamped = stamped.with_connection_id(&session.connection_id);

    if let Err(e) = ctx.engine.broadcast(&stamped).await {
        // The frame is lost at the bus; the session stays up.
        log::error!("Failed to publish frame from {}: {e}", session.user_id);
    }
    Ok(())
}

/// Serialize one frame to the socket under the per-session write lock.
async fn send_frame(sink: &SharedSink, frame: &ChatMessage) -> Result<(), SessionError> {
    let payload = frame
        .encode()
        .map_err(|e| SessionError::Encoding(e.to_string()))?;
    let mut sink = sink.lock().await;
    sink.send(Message::text(payload))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}

/// Unregister presence and flip the activity flag. Safe to call twice.
async fn cleanup(ctx: &SessionContext, session: &Session, guard: &CleanupGuard) {
    if !guard.begin() {
        return;
    }
    if let Err(e) = ctx
        .presence
        .unregister(&session.user_id, &session.room_id)
        .await
    {
        log::error!("Failed to unregister presence for {}: {e}", session.user_id);
    }
    if let Err(e) = ctx
        .store
        .set_user_activity(&session.user_id, Activity::Offline)
        .await
    {
        log::warn!("Failed to mark {} offline: {e}", session.user_id);
    }
}

/// Best-effort close frame with a well-defined status.
async fn close_socket(sink: &SharedSink, code: CloseCode, reason: &str) {
    let frame = CloseFrame {
        code,
        reason: reason.to_string().into(),
    };
    let mut sink = sink.lock().await;
    let _ = sink.send(Message::Close(Some(frame))).await;
}
