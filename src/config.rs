//! Environment-driven configuration for the relay server and the client core.
//!
//! Values are read from the process environment after `dotenvy` has loaded any
//! `.env` file. Unset variables fall back to the defaults below; set but
//! unparsable variables are reported as [`ConfigError::Invalid`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Quiet period before an autosave fires
pub const DEFAULT_AUTOSAVE_DELAY: Duration = Duration::from_millis(2000);

/// How long a fresh connection waits for a peer's state before syncing alone
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(1000);

/// Reconnect backoff starts here and doubles per failed attempt
pub const DEFAULT_RECONNECT_BASE: Duration = Duration::from_millis(100);

/// Upper bound for the reconnect backoff
pub const DEFAULT_RECONNECT_MAX: Duration = Duration::from_millis(2500);

/// Presence states are re-broadcast this often
pub const DEFAULT_AWARENESS_RENEW: Duration = Duration::from_secs(15);

/// Presence states not renewed within this window are dropped
pub const DEFAULT_AWARENESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors raised while reading configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Configuration for the relay server binary
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interface to bind
    pub host: IpAddr,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 5000,
        }
    }
}

impl ServerConfig {
    /// Read `HOST` and `PORT`
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: env_parse("HOST")?.unwrap_or(defaults.host),
            port: env_parse("PORT")?.unwrap_or(defaults.port),
        })
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Configuration for a collaborating client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base WebSocket URL of the relay, e.g. `ws://127.0.0.1:5000`
    pub server_url: String,
    /// Base HTTP URL of the forms API
    pub api_base_url: String,
    /// Autosave debounce window
    pub autosave_delay: Duration,
    /// Wait for a peer's document state before declaring the room synced
    pub sync_timeout: Duration,
    /// First reconnect delay
    pub reconnect_base: Duration,
    /// Reconnect delay ceiling
    pub reconnect_max: Duration,
    /// Presence renewal interval
    pub awareness_renew_interval: Duration,
    /// Presence expiry
    pub awareness_timeout: Duration,
    /// Where the local user identity is cached
    pub identity_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:5000".to_string(),
            api_base_url: "http://127.0.0.1:5000".to_string(),
            autosave_delay: DEFAULT_AUTOSAVE_DELAY,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            reconnect_base: DEFAULT_RECONNECT_BASE,
            reconnect_max: DEFAULT_RECONNECT_MAX,
            awareness_renew_interval: DEFAULT_AWARENESS_RENEW,
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            identity_path: PathBuf::from("./data/user.json"),
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    /// Read the `COLLAB_*` family of variables on top of the defaults
    pub fn from_env() -> ConfigResult<Self> {
        let defaults = Self::default();
        Ok(Self {
            server_url: std::env::var("COLLAB_SERVER_URL").unwrap_or(defaults.server_url),
            api_base_url: std::env::var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            autosave_delay: env_millis("AUTOSAVE_DELAY_MS")?.unwrap_or(defaults.autosave_delay),
            sync_timeout: env_millis("SYNC_TIMEOUT_MS")?.unwrap_or(defaults.sync_timeout),
            reconnect_base: env_millis("RECONNECT_BASE_MS")?.unwrap_or(defaults.reconnect_base),
            reconnect_max: env_millis("RECONNECT_MAX_MS")?.unwrap_or(defaults.reconnect_max),
            awareness_renew_interval: env_millis("AWARENESS_RENEW_MS")?
                .unwrap_or(defaults.awareness_renew_interval),
            awareness_timeout: env_millis("AWARENESS_TIMEOUT_MS")?
                .unwrap_or(defaults.awareness_timeout),
            identity_path: std::env::var("USER_IDENTITY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.identity_path),
        })
    }

    pub fn with_api_base_url(mut self, url: impl Into<String>) -> Self {
        self.api_base_url = url.into();
        self
    }

    pub fn with_autosave_delay(mut self, delay: Duration) -> Self {
        self.autosave_delay = delay;
        self
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base = base;
        self.reconnect_max = max;
        self
    }

    pub fn with_awareness_timing(mut self, renew: Duration, timeout: Duration) -> Self {
        self.awareness_renew_interval = renew;
        self.awareness_timeout = timeout;
        self
    }

    pub fn with_identity_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_path = path.into();
        self
    }

    /// WebSocket URL for one room
    pub fn room_url(&self, room: &str) -> String {
        format!("{}/ws/{}", self.server_url.trim_end_matches('/'), room)
    }

    /// Backoff before reconnect attempt `attempt` (0-based)
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.reconnect_base
            .saturating_mul(factor)
            .min(self.reconnect_max)
    }
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> ConfigResult<Option<T>> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

fn env_millis(key: &'static str) -> ConfigResult<Option<Duration>> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.autosave_delay, Duration::from_millis(2000));
        assert_eq!(config.room_url("form-abc"), "ws://127.0.0.1:5000/ws/form-abc");
    }

    #[test]
    fn test_room_url_trims_trailing_slash() {
        let config = ClientConfig::new("ws://example.test:9000/");
        assert_eq!(config.room_url("default"), "ws://example.test:9000/ws/default");
    }

    #[test]
    fn test_reconnect_backoff_is_capped() {
        let config = ClientConfig::default();
        assert_eq!(config.reconnect_delay(0), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(200));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(800));
        assert_eq!(config.reconnect_delay(10), Duration::from_millis(2500));
        assert_eq!(config.reconnect_delay(u32::MAX), Duration::from_millis(2500));
    }

    #[test]
    fn test_server_config_builder() {
        let config = ServerConfig::default().with_port(8080);
        assert_eq!(config.socket_addr().port(), 8080);
    }
}
