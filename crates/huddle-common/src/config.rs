//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for production.
//! Config precedence: `HUDDLE__*` env vars > config.toml > legacy env vars > defaults
//!
//! The legacy variables `DATABASE_URL` and `NEXTAUTH_SECRET` are the ones the
//! web app that owns the meetings table already exports, so a shared `.env`
//! works without renaming anything.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Load the application configuration from the process environment.
///
/// Should be called once at startup; the result is handed to whatever needs it.
pub fn load() -> Result<AppConfig, ConfigError> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let legacy = LegacyEnv {
        database_url: std::env::var("DATABASE_URL").ok(),
        session_secret: std::env::var("NEXTAUTH_SECRET").ok(),
    };

    with_defaults(Config::builder(), legacy)?
        // Optional config file
        .add_source(File::with_name("config").required(false))
        // Environment variables (HUDDLE__SERVER__PORT, HUDDLE__DATABASE__URL, etc.)
        .add_source(
            Environment::with_prefix("HUDDLE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// Values picked up from the variable names the web app already exports.
#[derive(Debug, Default)]
struct LegacyEnv {
    database_url: Option<String>,
    session_secret: Option<String>,
}

fn with_defaults(
    builder: ConfigBuilder<DefaultState>,
    legacy: LegacyEnv,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    let mut builder = builder
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("database.max_connections", 10)?
        .set_default("database.min_connections", 1)?
        .set_default("signaling.outbound_queue_capacity", 64)?
        .set_default("signaling.close_flush_timeout_ms", 2000)?
        .set_default("logging.json", false)?;

    if let Some(url) = legacy.database_url {
        builder = builder.set_default("database.url", url)?;
    }
    if let Some(secret) = legacy.session_secret {
        builder = builder.set_default("auth.session_secret", secret)?;
    }

    Ok(builder)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub signaling: SignalingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// NextAuth.js secret used to derive the session-token encryption key.
    /// Without it every participant connects unauthenticated.
    pub session_secret: Option<String>,
}

impl AuthConfig {
    /// The configured secret, treating an empty string as unset.
    pub fn secret(&self) -> Option<&str> {
        self.session_secret.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    /// Messages buffered per participant before the participant is evicted.
    pub outbound_queue_capacity: usize,
    /// Grace period for a closing connection to flush its queued frames.
    pub close_flush_timeout_ms: u64,
}

impl SignalingConfig {
    pub fn close_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.close_flush_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Emit JSON log lines instead of the human-readable format.
    pub json: bool,
}
