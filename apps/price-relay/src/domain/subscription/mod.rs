//! Subscriber Registry
//!
//! Tracks the live output streams the broadcaster fans out to.
//!
//! # Design
//!
//! Two independent collections, each behind its own lock:
//! - **Broadcast** subscribers receive every symbol. They are keyed by a
//!   generated [`SubscriberId`], so the same underlying stream registered
//!   twice yields two independent entries and removal is O(1).
//! - **Position** subscribers receive one symbol, embedded in their
//!   [`PositionKey`]. Keys are unique and the last registration wins.
//!
//! Iteration always runs over a copied snapshot, so a removal from the
//! send-failure path can never corrupt a fan-out in progress. Locks are
//! never held across an `.await`.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use uuid::Uuid;

use super::price::{InvalidPositionKey, PositionKey};

// =============================================================================
// Types
// =============================================================================

/// Unique identifier of one subscriber registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Kind of subscriber, used for logging and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    /// Receives every symbol plus an initial cache replay.
    Broadcast,
    /// Receives only the symbol embedded in its key, no replay.
    Position,
}

impl SubscriberKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Broadcast => "broadcast",
            Self::Position => "position",
        }
    }
}

/// A position subscriber as seen by a fan-out snapshot.
#[derive(Debug, Clone)]
pub struct PositionMember<S> {
    /// Registration key.
    pub key: PositionKey,
    /// Registration id, used to avoid evicting a newer stream under the same key.
    pub id: SubscriberId,
    /// Output stream handle.
    pub sink: S,
}

/// Counts of live subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live broadcast subscribers.
    pub broadcast: usize,
    /// Live position subscribers.
    pub position: usize,
}

impl RegistryStats {
    /// Total live subscribers of both kinds.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.broadcast + self.position
    }
}

// =============================================================================
// Subscriber Registry
// =============================================================================

/// Lock-guarded registry of broadcast and position subscribers.
///
/// `S` is the stream handle type; it is cloned into snapshots, so it should
/// be a cheap handle such as a channel sender.
///
/// # Example
///
/// ```rust
/// use price_relay::domain::subscription::SubscriberRegistry;
///
/// let registry: SubscriberRegistry<&'static str> = SubscriberRegistry::new();
///
/// let all = registry.add_broadcast("stream-a");
/// registry.add_position("client1-EURUSD", "stream-b").unwrap();
///
/// assert_eq!(registry.position_snapshot("EURUSD").len(), 1);
/// assert!(registry.position_snapshot("GBPUSD").is_empty());
///
/// assert!(registry.remove_broadcast(all));
/// assert!(!registry.remove_broadcast(all));
/// ```
pub struct SubscriberRegistry<S> {
    broadcast: RwLock<HashMap<SubscriberId, S>>,
    positions: RwLock<HashMap<String, PositionMember<S>>>,
}

impl<S> Default for SubscriberRegistry<S> {
    fn default() -> Self {
        Self {
            broadcast: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S> fmt::Debug for SubscriberRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("SubscriberRegistry")
            .field("broadcast", &stats.broadcast)
            .field("position", &stats.position)
            .finish()
    }
}

impl<S> SubscriberRegistry<S> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an unfiltered subscriber.
    pub fn add_broadcast(&self, sink: S) -> SubscriberId {
        let id = SubscriberId::generate();
        self.broadcast.write().insert(id, sink);
        id
    }

    /// Register a position subscriber, replacing any stream under the same key.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPositionKey`] if the key does not embed a symbol.
    pub fn add_position(
        &self,
        key: impl Into<String>,
        sink: S,
    ) -> Result<SubscriberId, InvalidPositionKey> {
        let key = PositionKey::parse(key)?;
        let id = SubscriberId::generate();
        let replaced = self.positions.write().insert(
            key.as_str().to_string(),
            PositionMember {
                key: key.clone(),
                id,
                sink,
            },
        );
        if let Some(previous) = replaced {
            tracing::debug!(key = %key, previous = %previous.id, "Position stream replaced");
        }
        Ok(id)
    }

    /// Remove a broadcast subscriber. Returns `false` if it was already gone.
    pub fn remove_broadcast(&self, id: SubscriberId) -> bool {
        self.broadcast.write().remove(&id).is_some()
    }

    /// Remove whatever stream is registered under `key`.
    /// Returns `false` if the key was not registered.
    pub fn remove_position(&self, key: &str) -> bool {
        self.positions.write().remove(key).is_some()
    }

    /// Remove the stream under `key` only if it is still registration `id`.
    ///
    /// A failed send on a stream that has since been replaced must not evict
    /// its replacement.
    pub fn remove_position_if(&self, key: &str, id: SubscriberId) -> bool {
        let mut positions = self.positions.write();
        if positions.get(key).is_some_and(|member| member.id == id) {
            positions.remove(key);
            true
        } else {
            false
        }
    }

    /// Whether broadcast subscriber `id` is registered.
    #[must_use]
    pub fn contains_broadcast(&self, id: SubscriberId) -> bool {
        self.broadcast.read().contains_key(&id)
    }

    /// Whether any stream is registered under `key`.
    #[must_use]
    pub fn contains_position(&self, key: &str) -> bool {
        self.positions.read().contains_key(key)
    }

    /// Registration id of the stream under `key`, if any.
    #[must_use]
    pub fn position_id(&self, key: &str) -> Option<SubscriberId> {
        self.positions.read().get(key).map(|member| member.id)
    }

    /// Live subscriber counts.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            broadcast: self.broadcast.read().len(),
            position: self.positions.read().len(),
        }
    }
}

impl<S: Clone> SubscriberRegistry<S> {
    /// Copy of the current broadcast members.
    #[must_use]
    pub fn broadcast_snapshot(&self) -> Vec<(SubscriberId, S)> {
        self.broadcast
            .read()
            .iter()
            .map(|(id, sink)| (*id, sink.clone()))
            .collect()
    }

    /// Copy of the current position members whose key embeds `symbol`.
    #[must_use]
    pub fn position_snapshot(&self, symbol: &str) -> Vec<PositionMember<S>> {
        self.positions
            .read()
            .values()
            .filter(|member| member.key.symbol() == symbol)
            .cloned()
            .collect()
    }

    /// Visit every broadcast member of a snapshot taken at call time.
    pub fn for_each_broadcast(&self, mut f: impl FnMut(SubscriberId, &S)) {
        for (id, sink) in self.broadcast_snapshot() {
            f(id, &sink);
        }
    }

    /// Visit every position member of a snapshot taken at call time.
    pub fn for_each_position(&self, mut f: impl FnMut(&PositionMember<S>)) {
        let members: Vec<_> = self.positions.read().values().cloned().collect();
        for member in &members {
            f(member);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn duplicate_broadcast_streams_are_independent() {
        let registry = SubscriberRegistry::new();
        let a = registry.add_broadcast("same");
        let b = registry.add_broadcast("same");
        assert_ne!(a, b);
        assert_eq!(registry.stats().broadcast, 2);

        assert!(registry.remove_broadcast(a));
        assert!(registry.contains_broadcast(b));
        assert_eq!(registry.stats().broadcast, 1);
    }

    #[test]
    fn removal_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let id = registry.add_broadcast(1u8);
        assert!(registry.remove_broadcast(id));
        assert!(!registry.remove_broadcast(id));
        assert!(!registry.remove_position("nobody-AAPL"));
    }

    #[test]
    fn last_position_registration_wins() {
        let registry = SubscriberRegistry::new();
        let first = registry.add_position("c1-EURUSD", "old").unwrap();
        let second = registry.add_position("c1-EURUSD", "new").unwrap();
        assert_ne!(first, second);

        let members = registry.position_snapshot("EURUSD");
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].sink, "new");
        assert_eq!(members[0].id, second);
    }

    #[test]
    fn stale_removal_keeps_replacement() {
        let registry = SubscriberRegistry::new();
        let stale = registry.add_position("c1-EURUSD", "old").unwrap();
        let fresh = registry.add_position("c1-EURUSD", "new").unwrap();

        assert!(!registry.remove_position_if("c1-EURUSD", stale));
        assert!(registry.contains_position("c1-EURUSD"));
        assert!(registry.remove_position_if("c1-EURUSD", fresh));
        assert!(!registry.contains_position("c1-EURUSD"));
    }

    #[test]
    fn position_snapshot_filters_by_symbol() {
        let registry = SubscriberRegistry::new();
        registry.add_position("c1-EURUSD", 1).unwrap();
        registry.add_position("c2-EURUSD", 2).unwrap();
        registry.add_position("c3-GBPUSD", 3).unwrap();

        let mut sinks: Vec<_> = registry
            .position_snapshot("EURUSD")
            .into_iter()
            .map(|m| m.sink)
            .collect();
        sinks.sort_unstable();
        assert_eq!(sinks, vec![1, 2]);
        assert!(registry.position_snapshot("USDJPY").is_empty());
    }

    #[test]
    fn invalid_position_key_is_rejected() {
        let registry = SubscriberRegistry::new();
        assert!(registry.add_position("no_symbol", ()).is_err());
        assert_eq!(registry.stats().position, 0);
    }

    #[test]
    fn removal_during_iteration_is_safe() {
        let registry = SubscriberRegistry::new();
        let ids: Vec<_> = (0..10).map(|i| registry.add_broadcast(i)).collect();

        let mut visited = 0;
        registry.for_each_broadcast(|id, _| {
            visited += 1;
            // Removing every member mid-iteration must not skip or repeat any.
            for other in &ids {
                registry.remove_broadcast(*other);
            }
            assert!(!registry.contains_broadcast(id));
        });

        assert_eq!(visited, 10);
        assert_eq!(registry.stats().broadcast, 0);
    }

    #[test]
    fn for_each_position_visits_all_symbols() {
        let registry = SubscriberRegistry::new();
        registry.add_position("c1-EURUSD", 1).unwrap();
        registry.add_position("c2-GBPUSD", 2).unwrap();

        let mut symbols = Vec::new();
        registry.for_each_position(|member| symbols.push(member.key.symbol().to_string()));
        symbols.sort();
        assert_eq!(symbols, vec!["EURUSD", "GBPUSD"]);
    }

    #[test]
    fn concurrent_add_and_remove() {
        let registry = Arc::new(SubscriberRegistry::new());
        let doomed: Vec<_> = (0..50).map(|i| registry.add_broadcast(i)).collect();

        let adders: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        registry.add_broadcast(1_000 + i);
                    }
                })
            })
            .collect();

        let remover = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for id in doomed {
                    assert!(registry.remove_broadcast(id));
                }
            })
        };

        for handle in adders {
            handle.join().unwrap();
        }
        remover.join().unwrap();

        assert_eq!(registry.stats().broadcast, 100);
    }
}
