#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements
    )
)]

//! Price Relay - Latest-Price Fan-Out Service
//!
//! Drains price events from a Redis list, keeps the latest price per symbol,
//! and streams updates to downstream gRPC clients. Clients can open an
//! unfiltered stream (with a replay of every cached price), a per-position
//! stream for one symbol, or check a quote they hold against the cache.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: price events, the latest-price cache, the subscriber registry
//! - **Application**: ports, the fan-out engine, the broadcaster loop, queries
//! - **Infrastructure**: Redis queue, JSON codec, gRPC server, config,
//!   health, metrics, telemetry
//!
//! # Data Flow
//!
//! ```text
//!                  ┌─────────────┐     ┌─────────────┐
//! Redis RPOP ─────►│ Broadcaster │────►│ PriceEngine │──► broadcast streams
//!                  └─────────────┘     │  cache +    │──► position streams
//!                                      │  registry   │
//! ValidateSymbolPrice ────────────────►└─────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core price types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::cache::PriceCache;
pub use domain::price::{InvalidPositionKey, PositionKey, PriceEvent};
pub use domain::subscription::{RegistryStats, SubscriberId, SubscriberKind, SubscriberRegistry};

// Ports and services
pub use application::ports::{
    DecodeError, PriceDecoder, PriceSink, QueueError, QueueSource, SinkError,
};
pub use application::services::{
    BackoffConfig, Broadcaster, EngineConfig, FanOutReport, PriceEngine, QueryError, QueryService,
    Registration, TickOutcome,
};

// Infrastructure config
pub use infrastructure::config::{
    ConfigError, EngineSettings, PollSettings, RedisSettings, RelayConfig, ServerSettings,
};

// Queue and codec adapters
pub use infrastructure::codec::JsonPriceCodec;
pub use infrastructure::queue::{InMemoryQueue, RedisQueueError, RedisQueueSource};

// Health server
pub use infrastructure::health::{
    HealthServer, HealthServerError, HealthServerState, RelayStatus,
};

// gRPC server (for integration tests)
pub use infrastructure::grpc::{
    GrpcSink, PriceServer, PriceServerConfig, proto::pricefeed::v1 as proto,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
