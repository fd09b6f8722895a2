//! Broadcaster Loop
//!
//! Repeatedly pops one payload from the upstream queue, decodes it and hands
//! it to the [`PriceEngine`]. Empty polls and queue errors sleep for a
//! backed-off delay; decode failures and sentinels are dropped and the loop
//! moves straight on to the next pop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::backoff::{BackoffConfig, BackoffPolicy};
use super::engine::{FanOutReport, PriceEngine};
use crate::application::ports::{PriceDecoder, PriceSink, QueueSource};
use crate::infrastructure::metrics;

/// What one iteration of the loop did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// An event was cached and fanned out.
    Published(FanOutReport),
    /// The queue had nothing.
    Empty,
    /// The queue could not be read.
    PopFailed,
    /// The payload was not a price event.
    DecodeFailed,
    /// The payload decoded to the id-zero sentinel.
    Sentinel,
}

impl TickOutcome {
    /// Whether the loop should back off before the next pop.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        matches!(self, Self::Empty | Self::PopFailed)
    }
}

/// Single long-running consumer of the upstream queue.
pub struct Broadcaster<Q, S> {
    queue: Q,
    decoder: Arc<dyn PriceDecoder>,
    engine: Arc<PriceEngine<S>>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
}

impl<Q, S> std::fmt::Debug for Broadcaster<Q, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("backoff", &self.backoff)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<Q: QueueSource, S: PriceSink> Broadcaster<Q, S> {
    /// Create a broadcaster. It does nothing until [`run`](Self::run) or
    /// [`tick`](Self::tick) is called.
    pub fn new(
        queue: Q,
        decoder: Arc<dyn PriceDecoder>,
        engine: Arc<PriceEngine<S>>,
        backoff: BackoffConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            decoder,
            engine,
            backoff: BackoffPolicy::new(backoff),
            cancel,
        }
    }

    /// Perform one pop / decode / publish cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        let stats = self.engine.stats();

        let payload = match self.queue.pop().await {
            Ok(Some(payload)) => {
                stats.record_pop(Ok(()));
                payload
            }
            Ok(None) => {
                stats.record_pop(Ok(()));
                return TickOutcome::Empty;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to pop from price queue");
                stats.record_pop(Err(e.to_string()));
                metrics::record_pop_error();
                return TickOutcome::PopFailed;
            }
        };

        metrics::record_event_received();

        let event = match self.decoder.decode(&payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, bytes = payload.len(), "Dropping undecodable payload");
                stats.record_decode_failure();
                metrics::record_decode_failure();
                return TickOutcome::DecodeFailed;
            }
        };

        if event.is_sentinel() {
            tracing::debug!(symbol = %event.symbol, "Dropping sentinel price event");
            stats.record_sentinel();
            metrics::record_sentinel_dropped();
            return TickOutcome::Sentinel;
        }

        tracing::trace!(%event, "Publishing price event");
        TickOutcome::Published(self.engine.publish(event).await)
    }

    /// Run until cancelled.
    pub async fn run(mut self) {
        tracing::info!("Price broadcaster started");
        let cancel = self.cancel.clone();

        loop {
            let outcome = tokio::select! {
                () = cancel.cancelled() => break,
                outcome = self.tick() => outcome,
            };

            if !outcome.is_idle() {
                self.backoff.reset();
                continue;
            }

            let delay = self.backoff.next_delay();
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!("Price broadcaster stopped");
    }
}
