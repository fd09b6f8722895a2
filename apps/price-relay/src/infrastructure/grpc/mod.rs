//! gRPC Price Service
//!
//! Exposes the relay to downstream clients. Each streaming RPC:
//!
//! 1. Opens a bounded outbound channel for the client
//! 2. Registers it with the [`QueryService`](crate::application::services::QueryService)
//!    (broadcast streams get a cache replay first)
//! 3. Returns the receiving end as the response stream
//! 4. Watches for client disconnect, shutdown, or pruning and deregisters

pub mod server;

// Allow clippy warnings and missing docs in generated code
#[allow(
    missing_docs,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::unwrap_used,
    clippy::expect_used
)]
pub mod proto {
    pub mod pricefeed {
        pub mod v1 {
            include!("../../../../../packages/schema-gen/rust/pricefeed/v1/pricefeed.v1.rs");
        }
    }
}

pub use server::{GrpcSink, PriceServer, PriceServerConfig};
