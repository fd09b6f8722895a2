use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::application::ports::{QueueError, QueueSource};
use crate::domain::price::PriceEvent;

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Vec<u8>>,
    failures: usize,
}

/// Process-local FIFO implementing [`QueueSource`].
///
/// Clones share the same queue, so a test can keep pushing after handing a
/// clone to the broadcaster.
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw payload.
    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        self.inner.lock().items.push_back(payload.into());
    }

    /// Append an event encoded the way producers write it.
    pub fn push_event(&self, event: &PriceEvent) {
        match serde_json::to_vec(event) {
            Ok(payload) => self.push(payload),
            Err(e) => tracing::error!(error = %e, "Failed to encode price event"),
        }
    }

    /// Make the next `count` pops fail as if the queue were unreachable.
    pub fn fail_next(&self, count: usize) {
        self.inner.lock().failures += count;
    }

    /// Payloads not yet popped.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether every payload has been popped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }
}

#[async_trait]
impl QueueSource for InMemoryQueue {
    async fn pop(&self) -> Result<Option<Vec<u8>>, QueueError> {
        let mut inner = self.inner.lock();
        if inner.failures > 0 {
            inner.failures -= 1;
            return Err(QueueError::Unavailable("injected failure".to_string()));
        }
        Ok(inner.items.pop_front())
    }
}
