//! Price Payload Codec
//!
//! Queue payloads are JSON objects written by the upstream producer:
//!
//! ```json
//! {"uuid": 42, "symbol": "EURUSD", "bid": 1.0825, "ask": 1.0827}
//! ```
//!
//! Producers vary in field casing (`Uuid`, `Symbol`, ...); both spellings
//! are accepted. Absent fields decode to zero values, so `{}` decodes to the
//! sentinel.

use crate::application::ports::{DecodeError, PriceDecoder};
use crate::domain::price::PriceEvent;

/// JSON [`PriceDecoder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPriceCodec;

impl JsonPriceCodec {
    /// Encode an event as producers write it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the event cannot be serialized, which only
    /// happens for non-finite prices.
    pub fn encode(event: &PriceEvent) -> Result<Vec<u8>, DecodeError> {
        serde_json::to_vec(event).map_err(|e| DecodeError(e.to_string()))
    }
}

impl PriceDecoder for JsonPriceCodec {
    fn decode(&self, payload: &[u8]) -> Result<PriceEvent, DecodeError> {
        serde_json::from_slice(payload).map_err(|e| DecodeError(e.to_string()))
    }
}
