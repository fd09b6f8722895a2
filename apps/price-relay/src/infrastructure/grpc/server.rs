//! gRPC Price Service Implementation
//!
//! Implements the `PriceService` gRPC service on top of the
//! [`QueryService`].

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_stream::Stream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use super::proto::pricefeed::v1::{
    self as proto, Conn, ValidResponse, price_service_server::PriceService,
};
use crate::application::ports::{PriceSink, SinkError};
use crate::application::services::{QueryError, QueryService, Registration};
use crate::domain::price::PriceEvent;
use crate::domain::subscription::SubscriberKind;

// =============================================================================
// Type Aliases
// =============================================================================

type StreamResult<T> = Result<Response<T>, Status>;
type BoxedStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;
type PriceSender = mpsc::Sender<Result<proto::Price, Status>>;

/// How often an open stream checks that it has not been pruned.
const REGISTRATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Conversions
// =============================================================================

fn price_to_proto(event: &PriceEvent) -> proto::Price {
    proto::Price {
        uuid: event.id,
        symbol: event.symbol.clone(),
        bid: event.bid,
        ask: event.ask,
    }
}

fn price_from_proto(price: proto::Price) -> PriceEvent {
    PriceEvent::new(price.uuid, price.symbol, price.bid, price.ask)
}

fn query_error_to_status(error: &QueryError) -> Status {
    match error {
        QueryError::InvalidKey(e) => Status::invalid_argument(e.to_string()),
        QueryError::TooManySubscribers { .. } => Status::resource_exhausted(error.to_string()),
        QueryError::ReplayFailed(_) => Status::unavailable(error.to_string()),
    }
}

// =============================================================================
// Subscriber Sink
// =============================================================================

/// [`PriceSink`] writing into a gRPC response stream.
#[derive(Debug, Clone)]
pub struct GrpcSink {
    tx: PriceSender,
}

impl GrpcSink {
    /// Wrap the sending half of a response stream.
    #[must_use]
    pub const fn new(tx: PriceSender) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl PriceSink for GrpcSink {
    async fn send(&self, event: &PriceEvent) -> Result<(), SinkError> {
        self.tx
            .send(Ok(price_to_proto(event)))
            .await
            .map_err(|_| SinkError::Closed)
    }
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the gRPC price server.
#[derive(Debug, Clone)]
pub struct PriceServerConfig {
    /// Outbound buffer per subscriber stream.
    pub subscriber_buffer: usize,
}

impl Default for PriceServerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 1024,
        }
    }
}

// =============================================================================
// Server Implementation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEnd {
    ClientClosed,
    Shutdown,
    Pruned,
}

impl StreamEnd {
    const fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::Shutdown => "shutdown",
            Self::Pruned => "pruned",
        }
    }
}

/// gRPC price service.
#[derive(Debug, Clone)]
pub struct PriceServer {
    config: PriceServerConfig,
    query: QueryService<GrpcSink>,
    shutdown: CancellationToken,
}

impl PriceServer {
    /// Create a new price server. Open streams end when `shutdown` is
    /// cancelled.
    #[must_use]
    pub const fn new(
        config: PriceServerConfig,
        query: QueryService<GrpcSink>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            query,
            shutdown,
        }
    }

    fn channel(&self) -> (PriceSender, mpsc::Receiver<Result<proto::Price, Status>>) {
        mpsc::channel(self.config.subscriber_buffer.max(1))
    }

    /// Keep a registered stream alive until it ends, then deregister it.
    fn spawn_watcher(&self, tx: PriceSender, registration: Registration, key: String) {
        let query = self.query.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let end = hold_open(&tx, &shutdown, || query.is_registered(&registration, &key)).await;

            match registration.kind {
                SubscriberKind::Broadcast => {
                    query.close_broadcast(registration.id);
                }
                SubscriberKind::Position => {
                    query.close_position(&key, registration.id);
                }
            }

            if end == StreamEnd::Pruned {
                notify_dropped(&tx);
            }

            tracing::debug!(
                kind = registration.kind.as_str(),
                subscriber = %registration.id,
                reason = end.as_str(),
                "Subscriber stream ended"
            );
        });
    }
}

/// Best-effort `UNAVAILABLE` on a pruned stream. A stream pruned for being
/// slow usually has a full buffer, in which case the client only sees the
/// stream end.
fn notify_dropped(tx: &PriceSender) -> bool {
    match tx.try_send(Err(Status::unavailable(
        "stream dropped after a failed delivery",
    ))) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "Could not deliver stream drop status");
            false
        }
    }
}

async fn hold_open(
    tx: &PriceSender,
    shutdown: &CancellationToken,
    still_registered: impl Fn() -> bool,
) -> StreamEnd {
    let mut check = tokio::time::interval(REGISTRATION_CHECK_INTERVAL);
    check.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = tx.closed() => return StreamEnd::ClientClosed,
            () = shutdown.cancelled() => return StreamEnd::Shutdown,
            _ = check.tick() => {
                if !still_registered() {
                    return StreamEnd::Pruned;
                }
            }
        }
    }
}

#[tonic::async_trait]
impl PriceService for PriceServer {
    type SendPriceStream = BoxedStream<proto::Price>;
    type SendPosNewPriceStream = BoxedStream<proto::Price>;

    async fn send_price(&self, _request: Request<Conn>) -> StreamResult<Self::SendPriceStream> {
        self.query
            .ensure_broadcast_capacity()
            .map_err(|e| query_error_to_status(&e))?;

        let (tx, rx) = self.channel();
        let query = self.query.clone();
        let server = self.clone();

        // Replay may fill the buffer before the client starts reading, so the
        // response stream is returned before registration completes.
        tokio::spawn(async move {
            match query.open_broadcast(GrpcSink::new(tx.clone())).await {
                Ok(registration) => server.spawn_watcher(tx, registration, String::new()),
                Err(e) => {
                    tracing::warn!(error = %e, "Broadcast stream rejected");
                    let _ = tx.send(Err(query_error_to_status(&e))).await;
                }
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::SendPriceStream
        ))
    }

    async fn send_pos_new_price(
        &self,
        request: Request<Conn>,
    ) -> StreamResult<Self::SendPosNewPriceStream> {
        let key = request.into_inner().message;
        let (tx, rx) = self.channel();

        let registration = self
            .query
            .open_position(&key, GrpcSink::new(tx.clone()))
            .map_err(|e| {
                tracing::warn!(key = %key, error = %e, "Position stream rejected");
                query_error_to_status(&e)
            })?;
        self.spawn_watcher(tx, registration, key);

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::SendPosNewPriceStream
        ))
    }

    async fn validate_symbol_price(
        &self,
        request: Request<proto::Price>,
    ) -> Result<Response<ValidResponse>, Status> {
        let candidate = price_from_proto(request.into_inner());
        let is_valid = self.query.validate_price(&candidate);

        tracing::debug!(symbol = %candidate.symbol, id = candidate.id, is_valid, "Validated price");

        Ok(Response::new(ValidResponse { is_valid }))
    }
}

// =============================================================================
// Tests
// =============================================================================
