//! Domain Layer - Core price types and state.
//!
//! This layer contains the price event model, the latest-price cache, and
//! the subscriber registry. Nothing here performs I/O.

/// Price events and position keys.
pub mod price;

/// Latest price per symbol.
pub mod cache;

/// Broadcast and position subscriber tracking.
pub mod subscription;
