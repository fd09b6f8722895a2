//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Queue sources: Redis list and in-memory FIFO.
pub mod queue;

/// JSON price payload codec.
pub mod codec;

/// gRPC price service.
pub mod grpc;

/// Configuration from environment variables.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing.
pub mod telemetry;
