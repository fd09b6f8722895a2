//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the fan-out engine, the queue-draining broadcaster,
//! the query service, and the port interfaces they are written against.

/// Port interfaces for external systems (queue, codec, subscriber streams).
pub mod ports;

/// Application services: engine, broadcaster, queries.
pub mod services;
