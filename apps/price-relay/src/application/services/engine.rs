//! Fan-Out Engine
//!
//! Owns the price cache and the subscriber registry, and applies one price
//! event at a time: cache update, then concurrent delivery to every matching
//! subscriber with failed subscribers pruned.
//!
//! # Ordering
//!
//! Every tick holds the tick gate from cache update until all of its sends
//! have settled, so a subscriber sees events in the order the engine
//! processed them. Broadcast registration takes the same gate while it
//! replays the cache, so a new subscriber sees the full snapshot before any
//! live event and misses nothing in between.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;

use crate::application::ports::{PriceSink, SinkError};
use crate::domain::cache::PriceCache;
use crate::domain::price::PriceEvent;
use crate::domain::subscription::{RegistryStats, SubscriberId, SubscriberKind, SubscriberRegistry};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration
// =============================================================================

/// Engine tuning.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Upper bound on one send to one subscriber. A slower subscriber is
    /// treated as gone.
    pub send_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(500),
        }
    }
}

// =============================================================================
// Engine Statistics
// =============================================================================

/// Running counters for the engine, read by the health endpoint.
#[derive(Debug)]
pub struct EngineStats {
    events_published: AtomicU64,
    events_delivered: AtomicU64,
    decode_failures: AtomicU64,
    sentinels_dropped: AtomicU64,
    pop_errors: AtomicU64,
    subscribers_pruned: AtomicU64,
    queue_healthy: AtomicBool,
    last_event_at: parking_lot::RwLock<Option<DateTime<Utc>>>,
    last_error: parking_lot::RwLock<Option<String>>,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            events_published: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            sentinels_dropped: AtomicU64::new(0),
            pop_errors: AtomicU64::new(0),
            subscribers_pruned: AtomicU64::new(0),
            queue_healthy: AtomicBool::new(true),
            last_event_at: parking_lot::RwLock::new(None),
            last_error: parking_lot::RwLock::new(None),
        }
    }
}

impl EngineStats {
    pub(crate) fn record_published(&self) {
        self.events_published.fetch_add(1, Ordering::Relaxed);
        *self.last_event_at.write() = Some(Utc::now());
    }

    pub(crate) fn record_delivered(&self, count: u64) {
        self.events_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sentinel(&self) {
        self.sentinels_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_pruned(&self) {
        self.subscribers_pruned.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a pop against the queue.
    pub(crate) fn record_pop(&self, result: Result<(), String>) {
        match result {
            Ok(()) => {
                self.queue_healthy.store(true, Ordering::Relaxed);
            }
            Err(message) => {
                self.pop_errors.fetch_add(1, Ordering::Relaxed);
                self.queue_healthy.store(false, Ordering::Relaxed);
                *self.last_error.write() = Some(message);
            }
        }
    }

    /// Whether the most recent pop reached the queue.
    #[must_use]
    pub fn queue_healthy(&self) -> bool {
        self.queue_healthy.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            events_published: self.events_published.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            sentinels_dropped: self.sentinels_dropped.load(Ordering::Relaxed),
            pop_errors: self.pop_errors.load(Ordering::Relaxed),
            subscribers_pruned: self.subscribers_pruned.load(Ordering::Relaxed),
            queue_healthy: self.queue_healthy(),
            last_event_at: *self.last_event_at.read(),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Serializable copy of [`EngineStats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineStatsSnapshot {
    /// Events applied to the cache and fanned out.
    pub events_published: u64,
    /// Successful sends across all subscribers.
    pub events_delivered: u64,
    /// Payloads that failed to decode.
    pub decode_failures: u64,
    /// Sentinel events dropped.
    pub sentinels_dropped: u64,
    /// Failed pops.
    pub pop_errors: u64,
    /// Subscribers removed after a failed send.
    pub subscribers_pruned: u64,
    /// Whether the most recent pop reached the queue.
    pub queue_healthy: bool,
    /// When the last event was published.
    pub last_event_at: Option<DateTime<Utc>>,
    /// Most recent pop error.
    pub last_error: Option<String>,
}

// =============================================================================
// Fan-Out Report
// =============================================================================

/// Outcome of fanning one event out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Successful sends to broadcast subscribers.
    pub broadcast_delivered: usize,
    /// Successful sends to position subscribers.
    pub position_delivered: usize,
    /// Subscribers removed because their send failed.
    pub pruned: usize,
}

impl FanOutReport {
    /// Total successful sends.
    #[must_use]
    pub const fn delivered(&self) -> usize {
        self.broadcast_delivered + self.position_delivered
    }
}

#[derive(Debug)]
enum SendTarget {
    Broadcast(SubscriberId),
    Position { key: String, id: SubscriberId },
}

// =============================================================================
// Engine
// =============================================================================

/// Single owner of the price cache and subscriber registry.
///
/// Constructed once at startup and shared by `Arc` between the broadcaster
/// loop and the query service.
pub struct PriceEngine<S> {
    config: EngineConfig,
    cache: PriceCache,
    registry: SubscriberRegistry<S>,
    stats: EngineStats,
    tick_gate: Mutex<()>,
    started_at: Instant,
}

impl<S> std::fmt::Debug for PriceEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriceEngine")
            .field("config", &self.config)
            .field("cached_symbols", &self.cache.len())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Shared engine reference.
pub type SharedPriceEngine<S> = Arc<PriceEngine<S>>;

impl<S: PriceSink> PriceEngine<S> {
    /// Create an engine with an empty cache and registry.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            cache: PriceCache::new(),
            registry: SubscriberRegistry::new(),
            stats: EngineStats::default(),
            tick_gate: Mutex::new(()),
            started_at: Instant::now(),
        }
    }

    /// Create an engine with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EngineConfig::default())
    }

    /// Engine configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The latest-price cache.
    #[must_use]
    pub const fn cache(&self) -> &PriceCache {
        &self.cache
    }

    /// The subscriber registry.
    #[must_use]
    pub const fn registry(&self) -> &SubscriberRegistry<S> {
        &self.registry
    }

    /// Running counters.
    #[must_use]
    pub const fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Time since the engine was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Serialize against ticks. Held by registrations that replay the cache.
    pub(crate) async fn lock_ticks(&self) -> MutexGuard<'_, ()> {
        self.tick_gate.lock().await
    }

    /// Send to one subscriber, bounded by the configured send timeout.
    pub(crate) async fn send_bounded(&self, sink: &S, event: &PriceEvent) -> Result<(), SinkError> {
        send_with_timeout(sink, event, self.config.send_timeout).await
    }

    /// Apply one event: update the cache, then fan out to every matching
    /// subscriber. Sentinel events are ignored.
    pub async fn publish(&self, event: PriceEvent) -> FanOutReport {
        if event.is_sentinel() {
            self.stats.record_sentinel();
            metrics::record_sentinel_dropped();
            return FanOutReport::default();
        }

        let _gate = self.tick_gate.lock().await;
        let started = Instant::now();

        self.cache.set(event.clone());
        self.stats.record_published();
        metrics::set_cached_symbols(self.cache.len());

        let report = self.fan_out(Arc::new(event)).await;

        self.stats.record_delivered(report.delivered() as u64);
        metrics::record_events_delivered(SubscriberKind::Broadcast, report.broadcast_delivered);
        metrics::record_events_delivered(SubscriberKind::Position, report.position_delivered);
        metrics::record_fan_out_duration(started.elapsed());
        self.publish_registry_gauges();

        report
    }

    async fn fan_out(&self, event: Arc<PriceEvent>) -> FanOutReport {
        let timeout = self.config.send_timeout;
        let mut sends = JoinSet::new();

        for member in self.registry.position_snapshot(&event.symbol) {
            let event = Arc::clone(&event);
            sends.spawn(async move {
                let result = send_with_timeout(&member.sink, &event, timeout).await;
                let target = SendTarget::Position {
                    key: member.key.as_str().to_string(),
                    id: member.id,
                };
                (target, result)
            });
        }

        for (id, sink) in self.registry.broadcast_snapshot() {
            let event = Arc::clone(&event);
            sends.spawn(async move {
                let result = send_with_timeout(&sink, &event, timeout).await;
                (SendTarget::Broadcast(id), result)
            });
        }

        let mut report = FanOutReport::default();
        while let Some(joined) = sends.join_next().await {
            let (target, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Fan-out send task failed");
                    continue;
                }
            };

            match (target, result) {
                (SendTarget::Broadcast(_), Ok(())) => report.broadcast_delivered += 1,
                (SendTarget::Position { .. }, Ok(())) => report.position_delivered += 1,
                (SendTarget::Broadcast(id), Err(e)) => {
                    if self.registry.remove_broadcast(id) {
                        report.pruned += 1;
                        self.record_prune(SubscriberKind::Broadcast, &id.to_string(), &e);
                    }
                }
                (SendTarget::Position { key, id }, Err(e)) => {
                    if self.registry.remove_position_if(&key, id) {
                        report.pruned += 1;
                        self.record_prune(SubscriberKind::Position, &key, &e);
                    }
                }
            }
        }

        report
    }

    fn record_prune(&self, kind: SubscriberKind, subscriber: &str, error: &SinkError) {
        self.stats.record_pruned();
        metrics::record_subscriber_pruned(kind);
        tracing::info!(
            kind = kind.as_str(),
            subscriber,
            error = %error,
            "Pruned subscriber after failed send"
        );
    }

    /// Push current subscriber counts to the metric gauges.
    pub(crate) fn publish_registry_gauges(&self) {
        let RegistryStats {
            broadcast,
            position,
        } = self.registry.stats();
        metrics::set_subscribers(SubscriberKind::Broadcast, broadcast);
        metrics::set_subscribers(SubscriberKind::Position, position);
    }
}

async fn send_with_timeout<S: PriceSink>(
    sink: &S,
    event: &PriceEvent,
    timeout: Duration,
) -> Result<(), SinkError> {
    match tokio::time::timeout(timeout, sink.send(event)).await {
        Ok(result) => result,
        Err(_) => Err(SinkError::Timeout),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;

    /// Sink that always fails, counting attempts.
    #[derive(Clone, Default)]
    struct BrokenSink {
        attempts: Arc<AtomicU64>,
    }

    /// Sink that never completes.
    #[derive(Clone)]
    struct StalledSink;

    #[derive(Clone)]
    enum TestSink {
        Channel(mpsc::Sender<PriceEvent>),
        Broken(BrokenSink),
        Stalled(StalledSink),
    }

    #[async_trait]
    impl PriceSink for TestSink {
        async fn send(&self, event: &PriceEvent) -> Result<(), SinkError> {
            match self {
                Self::Channel(tx) => PriceSink::send(tx, event).await,
                Self::Broken(sink) => {
                    sink.attempts.fetch_add(1, Ordering::Relaxed);
                    Err(SinkError::Closed)
                }
                Self::Stalled(_) => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }

    fn channel() -> (TestSink, mpsc::Receiver<PriceEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (TestSink::Channel(tx), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<PriceEvent>) -> Vec<PriceEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn publish_updates_cache_and_broadcasts() {
        let engine = PriceEngine::with_defaults();
        let (sink, mut rx) = channel();
        engine.registry().add_broadcast(sink);

        let event = PriceEvent::new(1, "AAPL", 100.0, 101.0);
        let report = engine.publish(event.clone()).await;

        assert_eq!(report.broadcast_delivered, 1);
        assert_eq!(engine.cache().get("AAPL"), Some(event.clone()));
        assert_eq!(drain(&mut rx), vec![event]);
    }

    #[tokio::test]
    async fn sentinel_never_reaches_cache_or_subscribers() {
        let engine = PriceEngine::with_defaults();
        let (sink, mut rx) = channel();
        engine.registry().add_broadcast(sink);
        let (pos_sink, mut pos_rx) = channel();
        engine.registry().add_position("c1-AAPL", pos_sink).unwrap();

        let report = engine.publish(PriceEvent::new(0, "AAPL", 1.0, 2.0)).await;

        assert_eq!(report, FanOutReport::default());
        assert!(engine.cache().is_empty());
        assert!(drain(&mut rx).is_empty());
        assert!(drain(&mut pos_rx).is_empty());
        assert_eq!(engine.stats().snapshot().sentinels_dropped, 1);
    }

    #[tokio::test]
    async fn position_subscribers_only_see_their_symbol() {
        let engine = PriceEngine::with_defaults();
        let (eur, mut eur_rx) = channel();
        let (gbp, mut gbp_rx) = channel();
        engine.registry().add_position("c1-EURUSD", eur).unwrap();
        engine.registry().add_position("c2-GBPUSD", gbp).unwrap();

        let e1 = PriceEvent::new(1, "EURUSD", 1.08, 1.09);
        let g1 = PriceEvent::new(2, "GBPUSD", 1.25, 1.26);
        let e2 = PriceEvent::new(3, "EURUSD", 1.07, 1.08);
        engine.publish(e1.clone()).await;
        engine.publish(g1.clone()).await;
        engine.publish(e2.clone()).await;

        assert_eq!(drain(&mut eur_rx), vec![e1, e2]);
        assert_eq!(drain(&mut gbp_rx), vec![g1]);
    }

    #[tokio::test]
    async fn failed_subscriber_is_pruned_and_others_still_receive() {
        let engine = PriceEngine::with_defaults();
        let broken = BrokenSink::default();
        let broken_id = engine.registry().add_broadcast(TestSink::Broken(broken.clone()));
        let (healthy, mut rx) = channel();
        let healthy_id = engine.registry().add_broadcast(healthy);

        let event = PriceEvent::new(1, "AAPL", 100.0, 101.0);
        let report = engine.publish(event.clone()).await;

        assert_eq!(report.pruned, 1);
        assert_eq!(report.broadcast_delivered, 1);
        assert!(!engine.registry().contains_broadcast(broken_id));
        assert!(engine.registry().contains_broadcast(healthy_id));
        assert_eq!(drain(&mut rx), vec![event]);

        // A pruned subscriber is not attempted again.
        engine.publish(PriceEvent::new(2, "AAPL", 101.0, 102.0)).await;
        assert_eq!(broken.attempts.load(Ordering::Relaxed), 1);
        assert_eq!(engine.stats().snapshot().subscribers_pruned, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_subscriber_times_out_without_stalling_others() {
        let engine = PriceEngine::new(EngineConfig {
            send_timeout: Duration::from_millis(50),
        });
        let stalled_id = engine.registry().add_broadcast(TestSink::Stalled(StalledSink));
        let (healthy, mut rx) = channel();
        engine.registry().add_broadcast(healthy);

        let report = engine.publish(PriceEvent::new(1, "AAPL", 100.0, 101.0)).await;

        assert_eq!(report.pruned, 1);
        assert!(!engine.registry().contains_broadcast(stalled_id));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn failed_position_subscriber_is_pruned() {
        let engine = PriceEngine::with_defaults();
        engine
            .registry()
            .add_position("c1-AAPL", TestSink::Broken(BrokenSink::default()))
            .unwrap();

        let report = engine.publish(PriceEvent::new(1, "AAPL", 100.0, 101.0)).await;

        assert_eq!(report.pruned, 1);
        assert!(!engine.registry().contains_position("c1-AAPL"));
    }

    #[tokio::test]
    async fn concurrent_registration_while_pruning() {
        let engine = Arc::new(PriceEngine::with_defaults());
        let failing: Vec<_> = (0..20)
            .map(|_| {
                engine
                    .registry()
                    .add_broadcast(TestSink::Broken(BrokenSink::default()))
            })
            .collect();

        let mut receivers = Vec::new();
        let mut registrations = JoinSet::new();
        for _ in 0..100 {
            let (sink, rx) = channel();
            receivers.push(rx);
            let engine = Arc::clone(&engine);
            registrations.spawn(async move { engine.registry().add_broadcast(sink) });
        }

        let publisher = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                for id in 1..=5 {
                    engine.publish(PriceEvent::new(id, "AAPL", 1.0, 2.0)).await;
                }
            })
        };

        let mut healthy = Vec::new();
        while let Some(id) = registrations.join_next().await {
            healthy.push(id.unwrap());
        }
        publisher.await.unwrap();

        let stats = engine.registry().stats();
        assert_eq!(stats.broadcast, 100);
        for id in failing {
            assert!(!engine.registry().contains_broadcast(id));
        }
        for id in healthy {
            assert!(engine.registry().contains_broadcast(id));
        }
    }
}
