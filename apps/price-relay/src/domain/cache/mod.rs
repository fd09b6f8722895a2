//! Latest Price Cache
//!
//! Holds the most recent [`PriceEvent`] per symbol. The broadcaster is the
//! only writer; validation queries and broadcast replay read from it.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::price::PriceEvent;

/// Latest known price per symbol.
///
/// # Example
///
/// ```rust
/// use price_relay::domain::cache::PriceCache;
/// use price_relay::domain::price::PriceEvent;
///
/// let cache = PriceCache::new();
/// cache.set(PriceEvent::new(1, "AAPL", 100.0, 101.0));
/// cache.set(PriceEvent::new(2, "AAPL", 102.0, 103.0));
///
/// assert_eq!(cache.get("AAPL").map(|p| p.id), Some(2));
/// assert_eq!(cache.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct PriceCache {
    prices: RwLock<HashMap<String, PriceEvent>>,
}

impl PriceCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest price for `symbol`, if any.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<PriceEvent> {
        self.prices.read().get(symbol).cloned()
    }

    /// Store `event` as the latest price for its symbol, replacing any prior value.
    pub fn set(&self, event: PriceEvent) {
        self.prices.write().insert(event.symbol.clone(), event);
    }

    /// Current value of every cached symbol, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PriceEvent> {
        self.prices.read().values().cloned().collect()
    }

    /// Number of cached symbols.
    #[must_use]
    pub fn len(&self) -> usize {
        self.prices.read().len()
    }

    /// Whether no symbol has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prices.read().is_empty()
    }
}
