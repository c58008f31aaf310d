//! Client configuration.

use std::fmt;
use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Path of the realtime socket relative to the project endpoint.
pub const REALTIME_PATH: &str = "realtime/v1/websocket";

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Default timeout for dialing the socket.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-channel event queue capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// Default initial reconnect delay.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default cap on the reconnect delay.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Default number of consecutive reconnect attempts before giving up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Reconnection behavior after the socket is lost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether to reconnect at all.
    pub enabled: bool,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts allowed; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Set the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the attempt limit.
    pub fn with_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether retry number `attempt` (zero-based) may run.
    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: DEFAULT_RECONNECT_DELAY,
            max_delay: DEFAULT_MAX_RECONNECT_DELAY,
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
        }
    }
}

/// Client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Project endpoint (e.g., "https://example.supabase.co").
    pub endpoint: String,

    /// Project API key, sent as `apikey` and bearer token.
    pub api_key: String,

    /// Token used to authorize channel joins; defaults to the API key.
    pub access_token: Option<String>,

    /// Interval between heartbeats. Zero disables heartbeats.
    pub heartbeat_interval: Duration,

    /// Timeout for dialing the socket.
    pub connect_timeout: Duration,

    /// Capacity of each channel's event queue.
    pub event_buffer: usize,

    /// Reconnection behavior.
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    /// Create a configuration for the given endpoint and API key.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            access_token: None,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            reconnect: ReconnectPolicy::default(),
        }
    }

    /// Set the access token used for channel joins.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-channel event queue capacity.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Set the reconnect policy.
    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Token sent with channel joins.
    pub fn join_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    /// Check that the endpoint, key and queue capacity are usable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::Configuration("endpoint URL is empty".to_string()));
        }
        if self.api_key.trim().is_empty() {
            return Err(Error::Configuration("API key is empty".to_string()));
        }
        if self.event_buffer == 0 {
            return Err(Error::Configuration("event buffer must hold at least one event".to_string()));
        }
        self.websocket_url().map(|_| ())
    }

    /// Derive the realtime socket URL from the endpoint.
    ///
    /// `http` becomes `ws` and `https` becomes `wss`; the API key and
    /// serializer version travel as query parameters.
    pub fn websocket_url(&self) -> Result<Url, Error> {
        let mut url = Url::parse(self.endpoint.trim()).map_err(|e| {
            Error::Configuration(format!("invalid endpoint URL '{}': {}", self.endpoint, e))
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported endpoint scheme '{}'; expected http(s) or ws(s)",
                    other
                )))
            }
        };
        url.set_scheme(scheme).map_err(|_| {
            Error::Configuration(format!("cannot use scheme {} for {}", scheme, self.endpoint))
        })?;

        if !url.path().ends_with("/websocket") {
            let path = format!("{}/{}", url.path().trim_end_matches('/'), REALTIME_PATH);
            url.set_path(&path);
        }

        url.query_pairs_mut()
            .clear()
            .append_pair("apikey", self.api_key.trim())
            .append_pair("vsn", tablewatch_proto::PROTOCOL_VSN);

        Ok(url)
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("event_buffer", &self.event_buffer)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::new("https://example.supabase.co", "test-key");
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.event_buffer, DEFAULT_EVENT_BUFFER);
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.join_token(), "test-key");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::new("http://localhost:54321", "anon")
            .with_access_token("user-jwt")
            .with_heartbeat_interval(Duration::from_secs(5))
            .with_connect_timeout(Duration::from_secs(2))
            .with_event_buffer(0)
            .with_reconnect(ReconnectPolicy::disabled());

        assert_eq!(config.join_token(), "user-jwt");
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.event_buffer, 1);
        assert!(!config.reconnect.enabled);
    }

    #[test]
    fn test_empty_values_rejected() {
        assert!(matches!(
            ClientConfig::new("", "key").validate(),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            ClientConfig::new("https://example.supabase.co", "  ").validate(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_event_buffer_rejected() {
        let config = ClientConfig {
            event_buffer: 0,
            ..ClientConfig::new("https://example.supabase.co", "key")
        };
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        assert!(ClientConfig::new("not a url", "key").validate().is_err());
        assert!(ClientConfig::new("ftp://example.com", "key").validate().is_err());
    }

    #[test]
    fn test_websocket_url() {
        let config = ClientConfig::new("https://example.supabase.co", "test-key");
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://example.supabase.co/realtime/v1/websocket?apikey=test-key&vsn=1.0.0"
        );

        let config = ClientConfig::new("http://127.0.0.1:54321/", "k");
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn test_websocket_url_keeps_explicit_socket_path() {
        let config = ClientConfig::new("wss://rt.example.com/custom/websocket", "k");
        assert_eq!(
            config.websocket_url().unwrap().as_str(),
            "wss://rt.example.com/custom/websocket?apikey=k&vsn=1.0.0"
        );
    }

    #[test]
    fn test_reconnect_backoff() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), DEFAULT_MAX_RECONNECT_DELAY);
        assert_eq!(policy.delay_for(u32::MAX), DEFAULT_MAX_RECONNECT_DELAY);
    }

    #[test]
    fn test_reconnect_attempt_limit() {
        let policy = ReconnectPolicy::default().with_max_attempts(Some(2));
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));

        assert!(ReconnectPolicy::default().with_max_attempts(None).allows(1_000));
        assert!(!ReconnectPolicy::disabled().allows(0));
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = ClientConfig::new("https://example.supabase.co", "secret-key");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-key"));
        assert!(debug.contains("<redacted>"));
    }
}
