//! Listener configuration.

use std::fmt;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use tablewatch_client::{ClientConfig, ReconnectPolicy};

/// Environment variable consulted when `SUPABASE_ANON_KEY` is unset.
pub const FALLBACK_KEY_ENV: &str = "SUPABASE_KEY";

/// Default schema of the watched table.
pub const DEFAULT_SCHEMA: &str = "public";

/// Default watched table.
pub const DEFAULT_TABLE: &str = "user_messages";

/// tablewatch command line arguments.
#[derive(Debug, Parser)]
#[command(name = "tablewatch")]
#[command(about = "Print rows inserted into a Supabase table as they arrive")]
pub struct Args {
    /// Project URL (e.g. https://abc.supabase.co).
    #[arg(long, env = "SUPABASE_URL")]
    pub url: Option<String>,

    /// Anonymous API key. Falls back to SUPABASE_KEY.
    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    pub anon_key: Option<String>,

    /// Schema of the watched table.
    #[arg(long, default_value = DEFAULT_SCHEMA)]
    pub schema: String,

    /// Watched table.
    #[arg(long, default_value = DEFAULT_TABLE)]
    pub table: String,

    /// Parse the message column as JSON with a "text" or "voice" key.
    #[arg(long)]
    pub decode_payload: bool,

    /// Heartbeat interval (ms). Zero disables heartbeats.
    #[arg(long, default_value_t = 25_000)]
    pub heartbeat_interval_ms: u64,

    /// Timeout (ms) for opening the socket.
    #[arg(long, default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Initial delay (ms) before reconnecting.
    #[arg(long, default_value_t = 1_000)]
    pub reconnect_delay_ms: u64,

    /// Upper bound (ms) for the reconnect delay.
    #[arg(long, default_value_t = 30_000)]
    pub max_reconnect_delay_ms: u64,

    /// Consecutive reconnect attempts before giving up. Zero retries forever.
    #[arg(long, default_value_t = 10)]
    pub max_reconnect_attempts: u32,

    /// Never reconnect after the socket is lost.
    #[arg(long)]
    pub no_reconnect: bool,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No project URL given.
    #[error("missing project URL: set SUPABASE_URL or pass --url")]
    MissingUrl,

    /// No API key given.
    #[error("missing API key: set SUPABASE_ANON_KEY (or SUPABASE_KEY) or pass --anon-key")]
    MissingKey,

    /// Empty schema or table name.
    #[error("{0} must not be empty")]
    EmptyName(&'static str),

    /// The client rejected the configuration.
    #[error(transparent)]
    Client(#[from] tablewatch_client::Error),
}

/// Validated listener configuration.
#[derive(Clone)]
pub struct ListenerConfig {
    /// Project URL.
    pub url: String,
    /// API key.
    pub anon_key: String,
    /// Schema of the watched table.
    pub schema: String,
    /// Watched table.
    pub table: String,
    /// Print decoded text/voice lines instead of the raw message.
    pub decode_payload: bool,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Socket dial timeout.
    pub connect_timeout: Duration,
    /// Reconnect behavior.
    pub reconnect: ReconnectPolicy,
}

impl ListenerConfig {
    /// Build from parsed arguments; `fallback_key` is used when no key was given.
    pub fn from_args(args: &Args, fallback_key: Option<String>) -> Result<Self, ConfigError> {
        let url = non_empty(args.url.clone()).ok_or(ConfigError::MissingUrl)?;
        let anon_key = non_empty(args.anon_key.clone())
            .or_else(|| non_empty(fallback_key))
            .ok_or(ConfigError::MissingKey)?;

        if args.schema.trim().is_empty() {
            return Err(ConfigError::EmptyName("schema"));
        }
        if args.table.trim().is_empty() {
            return Err(ConfigError::EmptyName("table"));
        }

        let reconnect = if args.no_reconnect {
            ReconnectPolicy::disabled()
        } else {
            ReconnectPolicy::default()
                .with_initial_delay(Duration::from_millis(args.reconnect_delay_ms))
                .with_max_delay(Duration::from_millis(args.max_reconnect_delay_ms))
                .with_max_attempts(match args.max_reconnect_attempts {
                    0 => None,
                    n => Some(n),
                })
        };

        let config = Self {
            url,
            anon_key,
            schema: args.schema.trim().to_string(),
            table: args.table.trim().to_string(),
            decode_payload: args.decode_payload,
            heartbeat_interval: Duration::from_millis(args.heartbeat_interval_ms),
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            reconnect,
        };
        config.client_config().validate()?;
        Ok(config)
    }

    /// Client configuration for this listener.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(&self.url, &self.anon_key)
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_connect_timeout(self.connect_timeout)
            .with_reconnect(self.reconnect.clone())
    }

    /// Name of the channel watching the configured table.
    pub fn table_channel(&self) -> String {
        format!("{}:{}", self.schema, self.table)
    }
}

impl fmt::Debug for ListenerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerConfig")
            .field("url", &self.url)
            .field("anon_key", &"<redacted>")
            .field("schema", &self.schema)
            .field("table", &self.table)
            .field("decode_payload", &self.decode_payload)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
