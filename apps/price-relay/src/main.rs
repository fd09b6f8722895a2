//! Price Relay Binary
//!
//! Starts the price fan-out service.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin price-relay
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `REDIS_URI`: Redis address (`host:port` or `redis://` URL)
//!
//! ## Optional
//! - `REDIS_USERNAME`, `REDIS_PASS`: Redis ACL credentials
//! - `REDIS_DB`: Redis database index (default: 0)
//! - `PRICE_QUEUE_KEY`: list popped for price events (default: queueKey)
//! - `PRICE_RELAY_GRPC_HOST`: gRPC bind host (default: 127.0.0.1)
//! - `PRICE_RELAY_GRPC_PORT`: gRPC port (default: 8081)
//! - `PRICE_RELAY_HEALTH_PORT`: health and metrics HTTP port, 0 disables (default: 8082)
//! - `PRICE_RELAY_POLL_BACKOFF_INITIAL_MS` / `PRICE_RELAY_POLL_BACKOFF_MAX_MS`:
//!   idle poll backoff (default: 5 / 250)
//! - `PRICE_RELAY_SEND_TIMEOUT_MS`: per-subscriber send bound (default: 500)
//! - `PRICE_RELAY_SUBSCRIBER_BUFFER`: per-stream buffer (default: 1024)
//! - `PRICE_RELAY_MAX_BROADCAST_SUBSCRIBERS`: 0 = unlimited (default: 0)
//! - `OTEL_ENABLED`, `OTEL_EXPORTER_OTLP_ENDPOINT`, `OTEL_SERVICE_NAME`: tracing export
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use price_relay::infrastructure::grpc::proto::pricefeed::v1::price_service_server::PriceServiceServer;
use price_relay::infrastructure::telemetry;
use price_relay::{
    BackoffConfig, Broadcaster, EngineConfig, GrpcSink, HealthServer, HealthServerState,
    JsonPriceCodec, PriceEngine, PriceServer, PriceServerConfig, QueryService, RedisQueueSource,
    RelayConfig, init_metrics,
};
use tokio::net::TcpListener;
use tokio::signal;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

/// Upper bound on waiting for tasks after shutdown is signalled.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting price relay");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable, metrics disabled");
    }

    let config = RelayConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    // Fail fast: an unreachable queue or an occupied port stops startup.
    let queue = RedisQueueSource::connect(&config.redis).await?;
    let grpc_addr = config.server.grpc_addr();
    let grpc_listener = TcpListener::bind(grpc_addr).await?;

    let engine = Arc::new(PriceEngine::<GrpcSink>::new(EngineConfig {
        send_timeout: config.engine.send_timeout,
    }));
    let query = QueryService::new(Arc::clone(&engine))
        .with_max_broadcast_subscribers(config.engine.max_broadcast_subscribers);

    let broadcaster = Broadcaster::new(
        queue,
        Arc::new(JsonPriceCodec),
        Arc::clone(&engine),
        BackoffConfig::new(config.poll.backoff_initial, config.poll.backoff_max),
        shutdown_token.clone(),
    );
    let broadcaster_handle = tokio::spawn(broadcaster.run());

    let health_handle = (config.server.health_port != 0).then(|| {
        let state = Arc::new(HealthServerState::new(
            env!("CARGO_PKG_VERSION").to_string(),
            Arc::clone(&engine) as Arc<dyn price_relay::RelayStatus>,
        ));
        let server = HealthServer::new(config.server.health_port, state, shutdown_token.clone());
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "Health server error");
            }
        })
    });

    let price_server = PriceServer::new(
        PriceServerConfig {
            subscriber_buffer: config.engine.subscriber_buffer,
        },
        query,
        shutdown_token.clone(),
    );
    let grpc_shutdown = shutdown_token.clone();
    let grpc_handle = tokio::spawn(async move {
        tracing::info!(addr = %grpc_addr, "gRPC server listening");
        if let Err(e) = Server::builder()
            .add_service(PriceServiceServer::new(price_server))
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(grpc_listener),
                grpc_shutdown.cancelled_owned(),
            )
            .await
        {
            tracing::error!(error = %e, "gRPC server error");
        }
        tracing::info!("gRPC server stopped");
    });

    tracing::info!("Price relay ready");

    await_shutdown(shutdown_token).await;

    let drain = async {
        let _ = broadcaster_handle.await;
        let _ = grpc_handle.await;
        if let Some(handle) = health_handle {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Shutdown timed out, exiting"
        );
    }

    tracing::info!("Price relay stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &RelayConfig) {
    tracing::info!(
        db = config.redis.db,
        queue_key = %config.redis.queue_key,
        grpc_addr = %config.server.grpc_addr(),
        health_port = config.server.health_port,
        "Configuration loaded"
    );
    tracing::debug!(
        backoff_initial_ms = config.poll.backoff_initial.as_millis(),
        backoff_max_ms = config.poll.backoff_max.as_millis(),
        send_timeout_ms = config.engine.send_timeout.as_millis(),
        subscriber_buffer = config.engine.subscriber_buffer,
        max_broadcast_subscribers = config.engine.max_broadcast_subscribers,
        "Engine settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
