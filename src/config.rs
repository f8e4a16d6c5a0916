//! Server configuration from the environment.
//!
//! Loaded once at startup (after `dotenvy` has populated the process
//! environment from a `.env` file, if present) and shared read-only.

use std::env;

/// All tunables the server reads from the environment. CLI flags override
/// the bind address.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared database every node points at.
    pub database_url: String,
    /// HS256 secret for validating bearer access tokens. Token issuance
    /// belongs to the identity service.
    pub jwt_access_secret: String,
    pub bind_host: String,
    pub bind_port: u16,
    /// Allowed CORS origin; unset means any origin.
    pub cors_origin: Option<String>,
    /// Base URL used to build share links.
    pub frontend_url: String,
    /// Cap on the per-game position-key history.
    pub max_position_history: usize,
    /// Matchmaker pairing period, seconds.
    pub matchmaker_tick_secs: u64,
    /// Cleanup-sweeper scan period, seconds.
    pub sweeper_tick_secs: u64,
    /// Event-log tail period, milliseconds.
    pub bus_poll_ms: u64,
    /// Envelopes older than this are purged from the event log, seconds.
    pub event_retention_secs: i64,
    /// Queue entries expire this long after joining, seconds.
    pub queue_expiry_secs: i64,
    /// How long a lone AI-permitting queue entry waits before the builtin
    /// agent is injected, seconds.
    pub bot_wait_secs: i64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Reads the configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            database_url: var_or("DATABASE_URL", "sqlite:matchroom.db"),
            jwt_access_secret: var_or("JWT_ACCESS_SECRET", "dev-access-secret"),
            bind_host: var_or("BIND_HOST", "0.0.0.0"),
            bind_port: parse_or("BIND_PORT", 8080),
            cors_origin: env::var("CORS_ORIGIN").ok().filter(|s| !s.is_empty()),
            frontend_url: var_or("FRONTEND_URL", "http://localhost:8080"),
            max_position_history: parse_or("MAX_POSITION_HISTORY", 512),
            matchmaker_tick_secs: parse_or("MATCHMAKER_TICK_SECS", 3),
            sweeper_tick_secs: parse_or("SWEEPER_TICK_SECS", 10),
            bus_poll_ms: parse_or("BUS_POLL_MS", 500),
            event_retention_secs: parse_or("EVENT_RETENTION_SECS", 3600),
            queue_expiry_secs: parse_or("QUEUE_EXPIRY_SECS", 120),
            bot_wait_secs: parse_or("BOT_WAIT_SECS", 15),
        }
    }
}

impl Default for Config {
    /// Defaults suitable for tests: in-memory database, short timers.
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            jwt_access_secret: "test-secret".to_string(),
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            cors_origin: None,
            frontend_url: "http://localhost:8080".to_string(),
            max_position_history: 512,
            matchmaker_tick_secs: 1,
            sweeper_tick_secs: 1,
            bus_poll_ms: 100,
            event_retention_secs: 3600,
            queue_expiry_secs: 120,
            bot_wait_secs: 15,
        }
    }
}
