//! Server configuration.
//!
//! Every tunable has a compiled-in default and an environment override, so a
//! bare `roomcast` binary comes up against local Redis/MongoDB with the
//! documented timing constants.

use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket listener to
    pub bind_addr: String,
    /// Redis endpoint (pub/sub bus + shared state)
    pub bus_dsn: String,
    /// MongoDB endpoint (message log + room documents)
    pub db_dsn: String,
    /// MongoDB database name
    pub db_name: String,
    /// HMAC secret for verifying collaborator-issued tokens
    pub jwt_secret: String,
    /// Origins accepted at the upgrade handshake; empty allows all
    pub allowed_origins: Vec<String>,
    /// Messages replayed to a new subscriber
    pub replay_count: usize,
    /// Minimum gap between accepted messages per user, in milliseconds
    pub message_delay_ms: u64,
    /// Maximum characters per message
    pub max_message_len: usize,
    /// TTL on presence keys, in seconds
    pub presence_ttl_s: u64,
    /// Age after which a presence entry is considered dead, in seconds
    pub stale_after_s: u64,
    /// Reaper sweep period, in seconds
    pub reaper_period_s: u64,
    /// Heartbeat refresh period, in seconds
    pub heartbeat_period_s: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            bus_dsn: "redis://127.0.0.1/".to_string(),
            db_dsn: "mongodb://127.0.0.1:27017".to_string(),
            db_name: "db_chat".to_string(),
            jwt_secret: "secret-key".to_string(),
            allowed_origins: Vec::new(),
            replay_count: 50,
            message_delay_ms: 1500,
            max_message_len: 5000,
            presence_ttl_s: 86_400,
            stale_after_s: 120,
            reaper_period_s: 60,
            heartbeat_period_s: 30,
        }
    }
}

impl ServerConfig {
    /// Build a configuration from the process environment, falling back to
    /// the defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("BIND_ADDR", defaults.bind_addr),
            bus_dsn: env_string("REDIS_URL", defaults.bus_dsn),
            db_dsn: env_string("DATABASE_URL", defaults.db_dsn),
            db_name: env_string("DATABASE_NAME", defaults.db_name),
            jwt_secret: env_string("JWT_SECRET", defaults.jwt_secret),
            allowed_origins: parse_origins(&env_string("ALLOWED_ORIGINS", String::new())),
            replay_count: env_parsed("REPLAY_COUNT", defaults.replay_count),
            message_delay_ms: env_parsed("MESSAGE_DELAY_MS", defaults.message_delay_ms),
            max_message_len: env_parsed("MAX_MESSAGE_LEN", defaults.max_message_len),
            presence_ttl_s: env_parsed("PRESENCE_TTL_S", defaults.presence_ttl_s),
            stale_after_s: env_parsed("STALE_AFTER_S", defaults.stale_after_s),
            reaper_period_s: env_parsed("REAPER_PERIOD_S", defaults.reaper_period_s),
            heartbeat_period_s: env_parsed("HEARTBEAT_PERIOD_S", defaults.heartbeat_period_s),
        }
    }

    /// Minimum gap between accepted messages per user.
    pub fn message_delay(&self) -> Duration {
        Duration::from_millis(self.message_delay_ms)
    }

    /// TTL applied to presence keys.
    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_s)
    }

    /// Whether the given `Origin` header value passes the allow-list.
    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self.allowed_origins.iter().any(|o| o == origin)
    }
}

/// Split a CSV of origins, dropping empty entries.
pub(crate) fn parse_origins(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
