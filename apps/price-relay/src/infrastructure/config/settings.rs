//! Relay Configuration Settings
//!
//! Configuration types for the relay, loaded from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use url::Url;

/// Default Redis list key holding pending price events.
pub const DEFAULT_QUEUE_KEY: &str = "queueKey";

/// Redis connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// Address as given: `host:port` or a full `redis://` URL.
    pub uri: String,
    /// ACL user, if any.
    pub username: Option<String>,
    password: Option<String>,
    /// Database index.
    pub db: i64,
    /// List key popped for price events.
    pub queue_key: String,
}

impl RedisSettings {
    /// Settings for `uri` with no credentials, database 0 and the default key.
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            password: None,
            db: 0,
            queue_key: DEFAULT_QUEUE_KEY.to_string(),
        }
    }

    /// Attach credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Redis password, if any.
    #[must_use]
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Full connection URL with credentials and database applied.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if `uri` is not a valid address.
    pub fn connection_url(&self) -> Result<Url, ConfigError> {
        let raw = if self.uri.contains("://") {
            self.uri.clone()
        } else {
            format!("redis://{}", self.uri)
        };
        let invalid = |reason: String| ConfigError::InvalidValue {
            key: "REDIS_URI".to_string(),
            reason,
        };

        let mut url = Url::parse(&raw).map_err(|e| invalid(e.to_string()))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("missing host".to_string()));
        }

        if let Some(username) = self.username.as_deref() {
            url.set_username(username)
                .map_err(|()| invalid("cannot carry a username".to_string()))?;
        }
        if let Some(password) = self.password.as_deref() {
            url.set_password(Some(password))
                .map_err(|()| invalid("cannot carry a password".to_string()))?;
        }
        url.set_path(&format!("/{}", self.db));

        Ok(url)
    }
}

impl std::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("uri", &self.uri)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("db", &self.db)
            .field("queue_key", &self.queue_key)
            .finish()
    }
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// gRPC bind host.
    pub grpc_host: IpAddr,
    /// gRPC bind port.
    pub grpc_port: u16,
    /// Health check HTTP port (0 = disabled).
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            grpc_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grpc_port: 8081,
            health_port: 8082,
        }
    }
}

impl ServerSettings {
    /// gRPC listen address.
    #[must_use]
    pub const fn grpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.grpc_host, self.grpc_port)
    }
}

/// Queue polling cadence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    /// Sleep after the first empty or failed pop.
    pub backoff_initial: Duration,
    /// Longest sleep between pops.
    pub backoff_max: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(5),
            backoff_max: Duration::from_millis(250),
        }
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Bound on one send to one subscriber.
    pub send_timeout: Duration,
    /// Outbound buffer per subscriber stream.
    pub subscriber_buffer: usize,
    /// Broadcast subscriber cap (0 = unlimited).
    pub max_broadcast_subscribers: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(500),
            subscriber_buffer: 1024,
            max_broadcast_subscribers: 0,
        }
    }
}

/// Complete relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Redis queue connection.
    pub redis: RedisSettings,
    /// Listeners.
    pub server: ServerSettings,
    /// Polling cadence.
    pub poll: PollSettings,
    /// Fan-out.
    pub engine: EngineSettings,
}

impl RelayConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `REDIS_URI` is missing or empty, or a value cannot
    /// be used.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`RelayConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let uri = lookup("REDIS_URI").ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URI".to_string()))?;
        if uri.trim().is_empty() {
            return Err(ConfigError::EmptyValue("REDIS_URI".to_string()));
        }

        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let mut redis = RedisSettings::new(uri.trim())
            .with_credentials(non_empty("REDIS_USERNAME"), non_empty("REDIS_PASS"));
        redis.db = parse_or(&lookup, "REDIS_DB", 0)?;
        if let Some(key) = non_empty("PRICE_QUEUE_KEY") {
            redis.queue_key = key;
        }

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            grpc_host: parse_or(&lookup, "PRICE_RELAY_GRPC_HOST", server_defaults.grpc_host)?,
            grpc_port: parse_or(&lookup, "PRICE_RELAY_GRPC_PORT", server_defaults.grpc_port)?,
            health_port: parse_or(&lookup, "PRICE_RELAY_HEALTH_PORT", server_defaults.health_port)?,
        };

        let poll_defaults = PollSettings::default();
        let poll = PollSettings {
            backoff_initial: parse_millis_or(
                &lookup,
                "PRICE_RELAY_POLL_BACKOFF_INITIAL_MS",
                poll_defaults.backoff_initial,
            )?,
            backoff_max: parse_millis_or(
                &lookup,
                "PRICE_RELAY_POLL_BACKOFF_MAX_MS",
                poll_defaults.backoff_max,
            )?,
        };
        if poll.backoff_initial > poll.backoff_max {
            return Err(ConfigError::InvalidValue {
                key: "PRICE_RELAY_POLL_BACKOFF_INITIAL_MS".to_string(),
                reason: "must not exceed PRICE_RELAY_POLL_BACKOFF_MAX_MS".to_string(),
            });
        }

        let engine_defaults = EngineSettings::default();
        let engine = EngineSettings {
            send_timeout: parse_millis_or(
                &lookup,
                "PRICE_RELAY_SEND_TIMEOUT_MS",
                engine_defaults.send_timeout,
            )?,
            subscriber_buffer: parse_or(
                &lookup,
                "PRICE_RELAY_SUBSCRIBER_BUFFER",
                engine_defaults.subscriber_buffer,
            )?,
            max_broadcast_subscribers: parse_or(
                &lookup,
                "PRICE_RELAY_MAX_BROADCAST_SUBSCRIBERS",
                engine_defaults.max_broadcast_subscribers,
            )?,
        };
        if engine.subscriber_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PRICE_RELAY_SUBSCRIBER_BUFFER".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }

        redis.connection_url()?;

        Ok(Self {
            redis,
            server,
            poll,
            engine,
        })
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable is set but unusable.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn parse_millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}
