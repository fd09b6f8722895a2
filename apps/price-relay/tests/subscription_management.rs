//! Subscription Management Integration Tests
//!
//! Tests registration, cleanup on disconnect, replacement, and limits.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tonic::Request;
use tonic::transport::{Channel, Server};

use price_relay::{
    BackoffConfig, Broadcaster, GrpcSink, InMemoryQueue, JsonPriceCodec, PriceEngine, PriceEvent,
    PriceServer, PriceServerConfig, QueryService,
    proto::{
        Conn, price_service_client::PriceServiceClient, price_service_server::PriceServiceServer,
    },
};

struct TestRelay {
    client: PriceServiceClient<Channel>,
    queue: InMemoryQueue,
    engine: Arc<PriceEngine<GrpcSink>>,
    shutdown: CancellationToken,
    server_handle: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    fn stop(self) {
        self.shutdown.cancel();
        self.server_handle.abort();
    }
}

async fn setup_test_relay(max_broadcast_subscribers: usize) -> TestRelay {
    let queue = InMemoryQueue::new();
    let engine = Arc::new(PriceEngine::<GrpcSink>::with_defaults());
    let shutdown = CancellationToken::new();

    tokio::spawn(
        Broadcaster::new(
            queue.clone(),
            Arc::new(JsonPriceCodec),
            Arc::clone(&engine),
            BackoffConfig::new(Duration::from_millis(1), Duration::from_millis(5)),
            shutdown.clone(),
        )
        .run(),
    );

    let query = QueryService::new(Arc::clone(&engine))
        .with_max_broadcast_subscribers(max_broadcast_subscribers);
    let server = PriceServer::new(PriceServerConfig::default(), query, shutdown.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server_handle = tokio::spawn(async move {
        Server::builder()
            .add_service(PriceServiceServer::new(server))
            .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let client = PriceServiceClient::connect(format!("http://{addr}"))
        .await
        .unwrap();

    TestRelay {
        client,
        queue,
        engine,
        shutdown,
        server_handle,
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(3), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn position(key: &str) -> Request<Conn> {
    Request::new(Conn {
        message: key.to_string(),
    })
}

#[tokio::test]
async fn test_client_connection_registers_subscriber() {
    let mut relay = setup_test_relay(0).await;
    let engine = Arc::clone(&relay.engine);

    let _broadcast = relay
        .client
        .send_price(Request::new(Conn::default()))
        .await
        .unwrap();
    let _position = relay.client.send_pos_new_price(position("c1-AAPL")).await.unwrap();

    wait_until(|| {
        let stats = engine.registry().stats();
        stats.broadcast == 1 && stats.position == 1
    })
    .await;

    relay.stop();
}

#[tokio::test]
async fn test_client_disconnect_removes_subscriber() {
    let mut relay = setup_test_relay(0).await;
    let engine = Arc::clone(&relay.engine);

    let broadcast = relay
        .client
        .send_price(Request::new(Conn::default()))
        .await
        .unwrap()
        .into_inner();
    let position_stream = relay
        .client
        .send_pos_new_price(position("c1-AAPL"))
        .await
        .unwrap()
        .into_inner();
    wait_until(|| engine.registry().stats().total() == 2).await;

    drop(broadcast);
    drop(position_stream);

    wait_until(|| engine.registry().stats().total() == 0).await;

    relay.stop();
}

#[tokio::test]
async fn test_multiple_clients_receive_independently() {
    let relay = setup_test_relay(0).await;
    let engine = Arc::clone(&relay.engine);

    let mut streams = Vec::new();
    for _ in 0..3 {
        let mut client = relay.client.clone();
        streams.push(
            client
                .send_price(Request::new(Conn::default()))
                .await
                .unwrap()
                .into_inner(),
        );
    }
    wait_until(|| engine.registry().stats().broadcast == 3).await;

    relay.queue.push_event(&PriceEvent::new(1, "AAPL", 100.0, 101.0));

    for stream in &mut streams {
        let price = timeout(Duration::from_secs(2), stream.message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(price.uuid, 1);
    }

    // One client leaving does not affect the rest.
    drop(streams.pop());
    wait_until(|| engine.registry().stats().broadcast == 2).await;

    relay.queue.push_event(&PriceEvent::new(2, "AAPL", 100.5, 101.5));
    for stream in &mut streams {
        let price = timeout(Duration::from_secs(2), stream.message())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(price.uuid, 2);
    }

    relay.stop();
}

#[tokio::test]
async fn test_reconnect_under_same_position_key_replaces_stream() {
    let mut relay = setup_test_relay(0).await;
    let engine = Arc::clone(&relay.engine);

    let mut first = relay
        .client
        .send_pos_new_price(position("c1-AAPL"))
        .await
        .unwrap()
        .into_inner();
    let mut second = relay
        .client
        .send_pos_new_price(position("c1-AAPL"))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(engine.registry().stats().position, 1);

    relay.queue.push_event(&PriceEvent::new(1, "AAPL", 100.0, 101.0));

    let price = timeout(Duration::from_secs(2), second.message())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(price.uuid, 1);

    // The replaced stream is told it was dropped, then ends.
    let status = timeout(Duration::from_secs(3), first.message())
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(status.code(), tonic::Code::Unavailable);

    assert!(engine.registry().contains_position("c1-AAPL"));

    relay.stop();
}

#[tokio::test]
async fn test_broadcast_limit_rejects_extra_clients() {
    let mut relay = setup_test_relay(1).await;
    let engine = Arc::clone(&relay.engine);

    let _first = relay
        .client
        .send_price(Request::new(Conn::default()))
        .await
        .unwrap();
    wait_until(|| engine.registry().stats().broadcast == 1).await;

    let status = relay
        .client
        .send_price(Request::new(Conn::default()))
        .await
        .err()
        .expect("second broadcast client must be rejected");
    assert_eq!(status.code(), tonic::Code::ResourceExhausted);

    // Position streams are not capped.
    relay
        .client
        .send_pos_new_price(position("c1-AAPL"))
        .await
        .unwrap();

    relay.stop();
}

#[tokio::test]
async fn test_concurrent_subscribe_unsubscribe() {
    let relay = setup_test_relay(0).await;
    let engine = Arc::clone(&relay.engine);

    let mut handles = Vec::new();
    for i in 0..20 {
        let mut client = relay.client.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                let stream = client
                    .send_price(Request::new(Conn::default()))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(stream);
            } else {
                let stream = client
                    .send_pos_new_price(position(&format!("c{i}-AAPL")))
                    .await
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(stream);
            }
        }));
    }

    for i in 0..10 {
        relay
            .queue
            .push_event(&PriceEvent::new(i + 1, "AAPL", 100.0, 101.0));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    wait_until(|| engine.registry().stats().total() == 0).await;

    relay.stop();
}
