//! Queue Source Adapters
//!
//! - [`RedisQueueSource`]: `RPOP` against a Redis list (production)
//! - [`InMemoryQueue`]: process-local FIFO for tests and local runs

mod memory;
mod redis_list;

pub use memory::InMemoryQueue;
pub use redis_list::{RedisQueueError, RedisQueueSource};
