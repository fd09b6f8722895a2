//! Price Types
//!
//! The quote that flows from the upstream queue to every subscriber, and the
//! position key format that binds a filtered subscriber to one symbol.

use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Price Event
// =============================================================================

/// One priced quote for a symbol.
///
/// An `id` of zero is the "no data" sentinel: such an event is never cached
/// and never reaches a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceEvent {
    /// Opaque quote identifier. Zero marks the sentinel.
    #[serde(rename = "uuid", alias = "Uuid", alias = "id", default)]
    pub id: u64,
    /// Instrument symbol, e.g. `EURUSD`.
    #[serde(alias = "Symbol", default)]
    pub symbol: String,
    /// Bid price.
    #[serde(alias = "Bid", default)]
    pub bid: f64,
    /// Ask price.
    #[serde(alias = "Ask", default)]
    pub ask: f64,
}

impl PriceEvent {
    /// Create a new price event.
    #[must_use]
    pub fn new(id: u64, symbol: impl Into<String>, bid: f64, ask: f64) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            bid,
            ask,
        }
    }

    /// Whether this is the id-zero "no data" marker.
    #[must_use]
    pub const fn is_sentinel(&self) -> bool {
        self.id == 0
    }

    /// Whether `other` quotes exactly the same price.
    ///
    /// Compares id, bid and ask; the symbol is the lookup key and is not
    /// compared here.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn same_quote(&self, other: &Self) -> bool {
        self.id == other.id && self.bid == other.bid && self.ask == other.ask
    }
}

impl fmt::Display for PriceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} bid={} ask={}",
            self.symbol, self.id, self.bid, self.ask
        )
    }
}

// =============================================================================
// Position Key
// =============================================================================

/// Separator between the client id and the symbol in a position key.
pub const POSITION_KEY_SEPARATOR: char = '-';

/// Registration key of a position subscriber: `<clientId>-<symbol>`.
///
/// The symbol is the component after the last separator, so client ids may
/// themselves contain dashes (UUIDs are common).
///
/// Producers that split on every `-` and take the second component disagree
/// with this for keys with trailing components: `c1-EURUSD-x` routes to
/// `x` here, not `EURUSD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    raw: String,
    symbol_start: usize,
}

impl PositionKey {
    /// Parse a position key.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPositionKey`] if the key has no separator or either
    /// side of the last separator is empty.
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidPositionKey> {
        let raw = raw.into();
        let Some((client, symbol)) = raw.rsplit_once(POSITION_KEY_SEPARATOR) else {
            return Err(InvalidPositionKey(raw));
        };
        if client.is_empty() || symbol.is_empty() {
            return Err(InvalidPositionKey(raw));
        }
        let symbol_start = raw.len() - symbol.len();
        Ok(Self { raw, symbol_start })
    }

    /// The symbol embedded in the key.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.raw[self.symbol_start..]
    }

    /// The client id part of the key.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.raw[..self.symbol_start - POSITION_KEY_SEPARATOR.len_utf8()]
    }

    /// The full key as registered.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A position key that does not embed a symbol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid position key {0:?}: expected \"<clientId>-<symbol>\"")]
pub struct InvalidPositionKey(pub String);

// =============================================================================
// Tests
// =============================================================================
