//! WebSocket server: accept loop and upgrade handshake.
//!
//! The handshake enforces everything that can be decided without touching
//! the store: the origin allow-list, the required query parameters
//! (`room_id`, `user_id`, `nickname`, `token`), and token validity. Failures
//! reject the upgrade with an HTTP status (400/401/403). Room existence and
//! membership need the store, so they are checked right after the upgrade by
//! the session supervisor, which answers with a 1011 close frame.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::bus::{BusError, MessageBus};
use crate::config::ServerConfig;
use crate::engine::RoomEngine;
use crate::presence::{spawn_reaper, PresenceRegistry};
use crate::session::{self, SessionContext, SessionRequest};
use crate::store::{ChatStore, StoreError};

/// Server errors.
#[derive(Debug)]
pub enum ServerError {
    Bind(String),
    Handshake(String),
    Bus(BusError),
    Store(StoreError),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "Bind error: {e}"),
            Self::Handshake(e) => write!(f, "Handshake error: {e}"),
            Self::Bus(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<BusError> for ServerError {
    fn from(e: BusError) -> Self {
        ServerError::Bus(e)
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Store(e)
    }
}

/// Why an upgrade was refused before the socket was accepted.
#[derive(Debug)]
pub(crate) enum HandshakeError {
    OriginNotAllowed,
    MissingParam(&'static str),
    Unauthenticated(String),
}

impl std::fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OriginNotAllowed => write!(f, "Origin not allowed"),
            Self::MissingParam(p) => write!(f, "Missing required parameter: {p}"),
            Self::Unauthenticated(e) => write!(f, "{e}"),
        }
    }
}

impl HandshakeError {
    fn status(&self) -> StatusCode {
        match self {
            Self::OriginNotAllowed => StatusCode::FORBIDDEN,
            Self::MissingParam(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

/// The parts of the upgrade request the authorization step looks at.
pub(crate) struct UpgradeRequest<'a> {
    pub query: Option<&'a str>,
    pub origin: Option<&'a str>,
    pub authorization: Option<&'a str>,
}

/// Validate an upgrade request: origin allow-list, required query
/// parameters, and the collaborator-issued token (header or query).
pub(crate) fn authorize_upgrade(
    request: UpgradeRequest<'_>,
    config: &ServerConfig,
) -> Result<SessionRequest, HandshakeError> {
    if let Some(origin) = request.origin {
        if !config.origin_allowed(origin) {
            return Err(HandshakeError::OriginNotAllowed);
        }
    }

    let query = request.query.unwrap_or("");
    let mut room_id = None;
    let mut user_id = None;
    let mut nickname = None;
    let mut query_token = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "room_id" => room_id = Some(value.into_owned()),
            "user_id" => user_id = Some(value.into_owned()),
            "nickname" => nickname = Some(value.into_owned()),
            "token" => query_token = Some(value.into_owned()),
            _ => {}
        }
    }

    let token = auth::extract_token(request.authorization, query_token.as_deref())
        .map_err(|e| HandshakeError::Unauthenticated(e.to_string()))?;
    auth::verify_token(&token, &config.jwt_secret)
        .map_err(|e| HandshakeError::Unauthenticated(e.to_string()))?;

    let room_id = room_id
        .filter(|v| !v.is_empty())
        .ok_or(HandshakeError::MissingParam("room_id"))?;
    let user_id = user_id
        .filter(|v| !v.is_empty())
        .ok_or(HandshakeError::MissingParam("user_id"))?;
    let nickname = nickname
        .filter(|v| !v.is_empty())
        .ok_or(HandshakeError::MissingParam("nickname"))?;

    Ok(SessionRequest {
        room_id,
        user_id,
        nickname,
    })
}

fn reject(error: &HandshakeError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(error.to_string()));
    *response.status_mut() = error.status();
    response
}

/// The chat server: one instance per process.
pub struct ChatServer {
    config: ServerConfig,
    bus: MessageBus,
    store: ChatStore,
    engine: RoomEngine,
    presence: PresenceRegistry,
    shutdown: CancellationToken,
}

impl ChatServer {
    /// Connect both adapters and assemble the server. An unreachable bus or
    /// store fails setup here, before any socket is accepted.
    pub async fn connect(config: ServerConfig) -> Result<Arc<Self>, ServerError> {
        let store = ChatStore::connect(&config.db_dsn, &config.db_name).await?;
        let bus = MessageBus::connect(&config.bus_dsn).await?;
        Ok(Self::new(config, bus, store))
    }

    /// Assemble a server from already-connected adapters.
    pub fn new(config: ServerConfig, bus: MessageBus, store: ChatStore) -> Arc<Self> {
        let engine = RoomEngine::new(bus.clone(), store.clone(), &config);
        let presence = PresenceRegistry::new(bus.clone(), &config);
        Arc::new(Self {
            config,
            bus,
            store,
            engine,
            presence,
            shutdown: CancellationToken::new(),
        })
    }

    /// The room state engine, for moderation collaborators (lock entry
    /// point, paged history).
    pub fn engine(&self) -> &RoomEngine {
        &self.engine
    }

    /// The persistence adapter, for registration collaborators.
    pub fn store(&self) -> &ChatStore {
        &self.store
    }

    /// The bus adapter.
    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stop accepting and cancel the reaper and all sessions.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept connections until shut down. Spawns the reaper singleton.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| ServerError::Bind(e.to_string()))?;
        log::info!("Listening on {}", self.config.bind_addr);

        spawn_reaper(
            self.bus.clone(),
            self.engine.clone(),
            &self.config,
            self.shutdown.child_token(),
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::error!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, addr).await {
                            log::debug!("Connection from {addr} ended: {e}");
                        }
                    });
                }
            }
        }
        log::info!("Server stopped");
        Ok(())
    }

    /// Upgrade one TCP connection and hand it to a session supervisor.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let mut session_request: Option<SessionRequest> = None;
        let callback = |req: &Request, response: Response| {
            let upgrade = UpgradeRequest {
                query: req.uri().query(),
                origin: header_str(req, "Origin"),
                authorization: header_str(req, "Authorization"),
            };
            match authorize_upgrade(upgrade, &self.config) {
                Ok(request) => {
                    session_request = Some(request);
                    Ok(response)
                }
                Err(e) => {
                    log::warn!("Rejected upgrade from {addr}: {e}");
                    Err(reject(&e))
                }
            }
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| ServerError::Handshake(e.to_string()))?;
        let request = session_request
            .ok_or_else(|| ServerError::Handshake("upgrade rejected".to_string()))?;

        let ctx = Arc::new(SessionContext {
            engine: self.engine.clone(),
            presence: self.presence.clone(),
            store: self.store.clone(),
            bus: self.bus.clone(),
            replay_count: self.config.replay_count,
            heartbeat_period: Duration::from_secs(self.config.heartbeat_period_s),
        });
        session::run_session(ctx, ws, request).await;
        Ok(())
    }
}

fn header_str<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}
