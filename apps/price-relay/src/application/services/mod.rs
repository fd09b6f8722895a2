//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - [`PriceEngine`]: cache owner and fan-out to subscribers
//! - [`Broadcaster`]: queue polling loop feeding the engine
//! - [`QueryService`]: subscriber registration and price validation
//! - [`BackoffPolicy`]: idle/error delay for the polling loop

pub mod backoff;
pub mod broadcaster;
pub mod engine;
pub mod query;

pub use backoff::{BackoffConfig, BackoffPolicy};
pub use broadcaster::{Broadcaster, TickOutcome};
pub use engine::{
    EngineConfig, EngineStats, EngineStatsSnapshot, FanOutReport, PriceEngine, SharedPriceEngine,
};
pub use query::{QueryError, QueryService, Registration};
