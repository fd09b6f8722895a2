//! Redis Queue Source
//!
//! Pops price payloads from a Redis list with `RPOP`. Producers push with
//! `LPUSH`, so the list drains oldest first. `RPOP` never blocks; an empty
//! list yields `nil`, which maps to `Ok(None)`.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::application::ports::{QueueError, QueueSource};
use crate::infrastructure::config::{ConfigError, RedisSettings};

/// Failure to set up the Redis connection.
#[derive(Debug, thiserror::Error)]
pub enum RedisQueueError {
    /// The connection URL could not be built.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The URL was rejected by the client.
    #[error("invalid redis address: {0}")]
    InvalidAddress(#[source] redis::RedisError),
    /// The server could not be reached or refused the handshake.
    #[error("failed to connect to redis: {0}")]
    Connect(#[source] redis::RedisError),
}

/// [`QueueSource`] backed by a Redis list.
///
/// The underlying [`ConnectionManager`] reconnects on its own after a
/// dropped connection; pops in the meantime surface as
/// [`QueueError::Unavailable`].
#[derive(Clone)]
pub struct RedisQueueSource {
    connection: ConnectionManager,
    key: String,
}

impl std::fmt::Debug for RedisQueueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueSource")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl RedisQueueSource {
    /// Connect and verify the server answers `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`RedisQueueError`] if the address is unusable or the server
    /// cannot be reached.
    pub async fn connect(settings: &RedisSettings) -> Result<Self, RedisQueueError> {
        let url = settings.connection_url()?;
        let client = redis::Client::open(url.as_str()).map_err(RedisQueueError::InvalidAddress)?;
        let mut connection = client
            .get_connection_manager()
            .await
            .map_err(RedisQueueError::Connect)?;

        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(RedisQueueError::Connect)?;

        tracing::info!(
            host = url.host_str().unwrap_or_default(),
            db = settings.db,
            key = %settings.queue_key,
            "Connected to redis price queue"
        );

        Ok(Self {
            connection,
            key: settings.queue_key.clone(),
        })
    }

    /// List key being popped.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl QueueSource for RedisQueueSource {
    async fn pop(&self) -> Result<Option<Vec<u8>>, QueueError> {
        let mut connection = self.connection.clone();
        connection
            .rpop::<_, Option<Vec<u8>>>(&self.key, None)
            .await
            .map_err(classify)
    }
}

fn classify(error: redis::RedisError) -> QueueError {
    if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
        QueueError::Unavailable(error.to_string())
    } else {
        QueueError::Protocol(error.to_string())
    }
}
