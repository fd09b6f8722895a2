//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`QueueSource`]: pop raw payloads from the upstream durable queue
//! - [`PriceDecoder`]: turn a raw payload into a [`PriceEvent`]
//! - [`PriceSink`]: push one event into a subscriber's output stream

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::price::PriceEvent;

// =============================================================================
// Queue Source
// =============================================================================

/// Failure to pop from the upstream queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue could not be reached.
    #[error("queue unavailable: {0}")]
    Unavailable(String),
    /// The queue answered with something other than a payload or nil.
    #[error("unexpected queue response: {0}")]
    Protocol(String),
}

/// Pop side of the external durable queue.
///
/// `Ok(None)` means nothing was available. Implementations must return
/// promptly instead of blocking until data arrives; the caller owns the
/// retry cadence.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Pop the next raw payload, if any.
    async fn pop(&self) -> Result<Option<Vec<u8>>, QueueError>;
}

// =============================================================================
// Codec
// =============================================================================

/// A payload that does not describe a price event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed price payload: {0}")]
pub struct DecodeError(pub String);

/// Decodes raw queue payloads.
pub trait PriceDecoder: Send + Sync {
    /// Decode one payload.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the payload is not a valid price event.
    fn decode(&self, payload: &[u8]) -> Result<PriceEvent, DecodeError>;
}

// =============================================================================
// Subscriber Streams
// =============================================================================

/// Failure to deliver to a subscriber. Always treated as "subscriber gone".
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// The receiving side has closed.
    #[error("subscriber stream closed")]
    Closed,
    /// The send did not complete within the allowed time.
    #[error("subscriber send timed out")]
    Timeout,
}

/// Output stream of one subscriber.
///
/// Handles are cloned into fan-out snapshots and moved into per-send tasks,
/// so they should be cheap to clone.
#[async_trait]
pub trait PriceSink: Clone + Send + Sync + 'static {
    /// Deliver one event.
    async fn send(&self, event: &PriceEvent) -> Result<(), SinkError>;
}

#[async_trait]
impl PriceSink for mpsc::Sender<PriceEvent> {
    async fn send(&self, event: &PriceEvent) -> Result<(), SinkError> {
        Self::send(self, event.clone())
            .await
            .map_err(|_| SinkError::Closed)
    }
}
