//! Query Service
//!
//! Entry points used by the network layer: open a broadcast or position
//! stream, close one, and check a client-held price against the cache.

use std::sync::Arc;

use crate::application::ports::{PriceSink, SinkError};
use crate::domain::price::{InvalidPositionKey, PositionKey, PriceEvent};
use crate::domain::subscription::{SubscriberId, SubscriberKind};

use super::engine::PriceEngine;

/// Failure to open a subscriber stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Position key without a client and symbol part.
    #[error(transparent)]
    InvalidKey(#[from] InvalidPositionKey),
    /// Broadcast subscriber cap reached.
    #[error("broadcast subscriber limit of {limit} reached")]
    TooManySubscribers {
        /// Configured cap.
        limit: usize,
    },
    /// A cached price could not be delivered during replay.
    #[error("cache replay failed: {0}")]
    ReplayFailed(#[source] SinkError),
}

/// A successful stream registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Registry id, needed to close the stream.
    pub id: SubscriberId,
    /// Stream kind.
    pub kind: SubscriberKind,
    /// Cached prices delivered before live events.
    pub replayed: usize,
}

/// Registration and validation entry points over a shared [`PriceEngine`].
pub struct QueryService<S> {
    engine: Arc<PriceEngine<S>>,
    max_broadcast_subscribers: Option<usize>,
}

impl<S> Clone for QueryService<S> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            max_broadcast_subscribers: self.max_broadcast_subscribers,
        }
    }
}

impl<S> std::fmt::Debug for QueryService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService")
            .field("max_broadcast_subscribers", &self.max_broadcast_subscribers)
            .finish_non_exhaustive()
    }
}

impl<S: PriceSink> QueryService<S> {
    /// Create a service with no broadcast subscriber cap.
    #[must_use]
    pub const fn new(engine: Arc<PriceEngine<S>>) -> Self {
        Self {
            engine,
            max_broadcast_subscribers: None,
        }
    }

    /// Cap concurrent broadcast subscribers. Zero means unlimited.
    #[must_use]
    pub const fn with_max_broadcast_subscribers(mut self, limit: usize) -> Self {
        self.max_broadcast_subscribers = if limit == 0 { None } else { Some(limit) };
        self
    }

    /// The underlying engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<PriceEngine<S>> {
        &self.engine
    }

    /// Check the broadcast subscriber cap without registering anything.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TooManySubscribers`] when the cap is reached.
    pub fn ensure_broadcast_capacity(&self) -> Result<(), QueryError> {
        match self.max_broadcast_subscribers {
            Some(limit) if self.engine.registry().stats().broadcast >= limit => {
                Err(QueryError::TooManySubscribers { limit })
            }
            _ => Ok(()),
        }
    }

    /// Whether `registration` is still live. False once the stream was
    /// closed, pruned, or replaced under the same position key.
    #[must_use]
    pub fn is_registered(&self, registration: &Registration, key: &str) -> bool {
        match registration.kind {
            SubscriberKind::Broadcast => self.engine.registry().contains_broadcast(registration.id),
            SubscriberKind::Position => {
                self.engine.registry().position_id(key) == Some(registration.id)
            }
        }
    }

    /// Replay every cached price into `sink`, then register it for live
    /// events.
    ///
    /// Runs under the tick gate, so no live event is processed between the
    /// snapshot and the registration.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::TooManySubscribers`] when the cap is reached and
    /// [`QueryError::ReplayFailed`] when a replay send fails, in which case
    /// nothing is registered.
    pub async fn open_broadcast(&self, sink: S) -> Result<Registration, QueryError> {
        self.ensure_broadcast_capacity()?;

        let _gate = self.engine.lock_ticks().await;
        // Registrations only happen under the gate, so this count cannot move
        // until the insert below.
        self.ensure_broadcast_capacity()?;

        let snapshot = self.engine.cache().snapshot();
        for event in &snapshot {
            self.engine
                .send_bounded(&sink, event)
                .await
                .map_err(QueryError::ReplayFailed)?;
        }

        let id = self.engine.registry().add_broadcast(sink);
        self.engine.publish_registry_gauges();

        tracing::info!(subscriber = %id, replayed = snapshot.len(), "Broadcast subscriber registered");

        Ok(Registration {
            id,
            kind: SubscriberKind::Broadcast,
            replayed: snapshot.len(),
        })
    }

    /// Register `sink` for live events on the symbol named by `key`. An
    /// existing registration under the same key is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidKey`] if `key` is not `<client>-<symbol>`.
    pub fn open_position(&self, key: &str, sink: S) -> Result<Registration, QueryError> {
        let parsed = PositionKey::parse(key)?;
        let replaced = self.engine.registry().contains_position(key);
        let id = self.engine.registry().add_position(key, sink)?;
        self.engine.publish_registry_gauges();

        tracing::info!(
            key,
            symbol = parsed.symbol(),
            subscriber = %id,
            replaced,
            "Position subscriber registered"
        );

        Ok(Registration {
            id,
            kind: SubscriberKind::Position,
            replayed: 0,
        })
    }

    /// Remove a broadcast stream whose connection ended.
    pub fn close_broadcast(&self, id: SubscriberId) -> bool {
        let removed = self.engine.registry().remove_broadcast(id);
        if removed {
            self.engine.publish_registry_gauges();
            tracing::debug!(subscriber = %id, "Broadcast subscriber closed");
        }
        removed
    }

    /// Remove a position stream whose connection ended. A newer stream
    /// registered under the same key is left in place.
    pub fn close_position(&self, key: &str, id: SubscriberId) -> bool {
        let removed = self.engine.registry().remove_position_if(key, id);
        if removed {
            self.engine.publish_registry_gauges();
            tracing::debug!(key, subscriber = %id, "Position subscriber closed");
        }
        removed
    }

    /// Whether `candidate` matches the cached price for its symbol.
    #[must_use]
    pub fn validate_price(&self, candidate: &PriceEvent) -> bool {
        self.engine
            .cache()
            .get(&candidate.symbol)
            .is_some_and(|cached| cached.same_quote(candidate))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use test_case::test_case;
    use tokio::sync::mpsc;

    use super::*;

    type Sink = mpsc::Sender<PriceEvent>;

    fn service() -> QueryService<Sink> {
        QueryService::new(Arc::new(PriceEngine::with_defaults()))
    }

    #[tokio::test]
    async fn replay_delivers_each_cached_symbol_once_before_live_events() {
        let service = service();
        let engine = Arc::clone(service.engine());
        engine.publish(PriceEvent::new(1, "AAPL", 100.0, 101.0)).await;
        engine.publish(PriceEvent::new(2, "MSFT", 300.0, 301.0)).await;
        engine.publish(PriceEvent::new(3, "AAPL", 102.0, 103.0)).await;

        let (tx, mut rx) = mpsc::channel(16);
        let registration = service.open_broadcast(tx).await.unwrap();
        assert_eq!(registration.replayed, 2);

        engine.publish(PriceEvent::new(4, "GOOG", 150.0, 151.0)).await;

        let mut replayed = HashSet::new();
        for _ in 0..2 {
            replayed.insert(rx.recv().await.unwrap().id);
        }
        assert_eq!(replayed, HashSet::from([2, 3]));
        assert_eq!(rx.recv().await.unwrap().id, 4);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_replay_does_not_register() {
        let service = service();
        service
            .engine()
            .publish(PriceEvent::new(1, "AAPL", 100.0, 101.0))
            .await;

        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let err = service.open_broadcast(tx).await.unwrap_err();
        assert_eq!(err, QueryError::ReplayFailed(SinkError::Closed));
        assert_eq!(service.engine().registry().stats().broadcast, 0);
    }

    #[tokio::test]
    async fn broadcast_cap_is_enforced() {
        let service = service().with_max_broadcast_subscribers(1);

        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);
        service.open_broadcast(tx1).await.unwrap();

        assert_eq!(
            service.open_broadcast(tx2).await.unwrap_err(),
            QueryError::TooManySubscribers { limit: 1 }
        );
    }

    #[tokio::test]
    async fn broadcast_cap_holds_for_opens_queued_behind_a_tick() {
        let service = service().with_max_broadcast_subscribers(1);
        let engine = Arc::clone(service.engine());
        engine.publish(PriceEvent::new(1, "AAPL", 100.0, 101.0)).await;

        let gate = engine.lock_ticks().await;

        let mut receivers = Vec::new();
        let mut opens = Vec::new();
        for _ in 0..8 {
            let (tx, rx) = mpsc::channel(4);
            receivers.push(rx);
            let service = service.clone();
            opens.push(tokio::spawn(async move { service.open_broadcast(tx).await }));
        }
        // Let every open pass the early capacity check and queue on the gate.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        drop(gate);

        let mut accepted = 0;
        for open in opens {
            match open.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert_eq!(e, QueryError::TooManySubscribers { limit: 1 }),
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(engine.registry().stats().broadcast, 1);
    }

    #[tokio::test]
    async fn position_stream_has_no_replay_and_filters_by_symbol() {
        let service = service();
        let engine = Arc::clone(service.engine());
        engine.publish(PriceEvent::new(1, "EURUSD", 1.08, 1.09)).await;

        let (tx, mut rx) = mpsc::channel(16);
        let registration = service.open_position("client9-EURUSD", tx).unwrap();
        assert_eq!(registration.replayed, 0);
        assert!(rx.try_recv().is_err());

        engine.publish(PriceEvent::new(2, "GBPUSD", 1.25, 1.26)).await;
        engine.publish(PriceEvent::new(3, "EURUSD", 1.07, 1.08)).await;
        assert_eq!(rx.recv().await.unwrap().id, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn malformed_position_key_is_rejected() {
        let (tx, _rx) = mpsc::channel(4);
        let err = service().open_position("EURUSD", tx).unwrap_err();
        assert!(matches!(err, QueryError::InvalidKey(_)));
    }

    #[test]
    fn closing_a_replaced_position_keeps_the_replacement() {
        let service = service();
        let (old, _old_rx) = mpsc::channel(4);
        let (new, _new_rx) = mpsc::channel(4);

        let first = service.open_position("c1-AAPL", old).unwrap();
        let second = service.open_position("c1-AAPL", new).unwrap();

        assert!(!service.close_position("c1-AAPL", first.id));
        assert!(service.engine().registry().contains_position("c1-AAPL"));
        assert!(service.close_position("c1-AAPL", second.id));
        assert!(!service.close_position("c1-AAPL", second.id));
    }

    #[test]
    fn replaced_position_is_no_longer_registered() {
        let service = service();
        let (old, _old_rx) = mpsc::channel(4);
        let (new, _new_rx) = mpsc::channel(4);

        let first = service.open_position("c1-AAPL", old).unwrap();
        assert!(service.is_registered(&first, "c1-AAPL"));

        let second = service.open_position("c1-AAPL", new).unwrap();
        assert!(!service.is_registered(&first, "c1-AAPL"));
        assert!(service.is_registered(&second, "c1-AAPL"));
    }

    #[test]
    fn close_broadcast_is_idempotent() {
        let service = service();
        let (tx, _rx) = mpsc::channel(4);
        let id = service.engine().registry().add_broadcast(tx);

        assert!(service.close_broadcast(id));
        assert!(!service.close_broadcast(id));
    }

    #[tokio::test]
    async fn validation_matches_exact_cached_quote() {
        let service = service();
        let cached = PriceEvent::new(7, "EURUSD", 1.0825, 1.0827);
        service.engine().publish(cached.clone()).await;

        assert!(service.validate_price(&cached));
    }

    #[test_case(PriceEvent::new(8, "EURUSD", 1.0825, 1.0827) ; "different id")]
    #[test_case(PriceEvent::new(7, "EURUSD", 1.0826, 1.0827) ; "different bid")]
    #[test_case(PriceEvent::new(7, "EURUSD", 1.0825, 1.0828) ; "different ask")]
    #[test_case(PriceEvent::new(7, "GBPUSD", 1.0825, 1.0827) ; "uncached symbol")]
    #[tokio::test]
    async fn validation_rejects_any_field_change(candidate: PriceEvent) {
        let service = service();
        service
            .engine()
            .publish(PriceEvent::new(7, "EURUSD", 1.0825, 1.0827))
            .await;

        assert!(!service.validate_price(&candidate));
    }
}
