//! Prometheus Metrics
//!
//! Counters, gauges and histograms for the relay, rendered at `/metrics` on
//! the health server port.
//!
//! All recording helpers are no-ops until [`init_metrics`] installs the
//! recorder, so unit tests can exercise instrumented code freely.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::subscription::SubscriberKind;

const EVENTS_RECEIVED: &str = "price_relay_events_received_total";
const DECODE_FAILURES: &str = "price_relay_decode_failures_total";
const SENTINELS_DROPPED: &str = "price_relay_sentinels_dropped_total";
const POP_ERRORS: &str = "price_relay_queue_pop_errors_total";
const EVENTS_DELIVERED: &str = "price_relay_events_delivered_total";
const SUBSCRIBERS_PRUNED: &str = "price_relay_subscribers_pruned_total";
const SUBSCRIBERS: &str = "price_relay_subscribers";
const CACHED_SYMBOLS: &str = "price_relay_cached_symbols";
const FAN_OUT_SECONDS: &str = "price_relay_fan_out_seconds";

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe every metric.
///
/// Subsequent calls return the handle from the first successful call.
///
/// # Errors
///
/// Returns an error if a global recorder is already installed by something
/// else.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Handle for rendering, if [`init_metrics`] has run.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

fn register_metrics() {
    describe_counter!(EVENTS_RECEIVED, "Payloads popped from the price queue");
    describe_counter!(DECODE_FAILURES, "Payloads that were not valid price events");
    describe_counter!(SENTINELS_DROPPED, "Id-zero price events dropped");
    describe_counter!(POP_ERRORS, "Failed pops against the price queue");
    describe_counter!(
        EVENTS_DELIVERED,
        "Price events delivered to subscribers, by subscriber kind"
    );
    describe_counter!(
        SUBSCRIBERS_PRUNED,
        "Subscribers removed after a failed or timed out send"
    );

    describe_gauge!(SUBSCRIBERS, "Live subscriber streams, by kind");
    describe_gauge!(CACHED_SYMBOLS, "Symbols with a cached latest price");

    describe_histogram!(
        FAN_OUT_SECONDS,
        "Time from cache update until every subscriber send settled"
    );
}

/// Count a payload popped from the queue.
pub fn record_event_received() {
    counter!(EVENTS_RECEIVED).increment(1);
}

/// Count a payload that failed to decode.
pub fn record_decode_failure() {
    counter!(DECODE_FAILURES).increment(1);
}

/// Count a dropped sentinel.
pub fn record_sentinel_dropped() {
    counter!(SENTINELS_DROPPED).increment(1);
}

/// Count a failed pop.
pub fn record_pop_error() {
    counter!(POP_ERRORS).increment(1);
}

/// Count successful sends for one tick.
pub fn record_events_delivered(kind: SubscriberKind, count: usize) {
    if count == 0 {
        return;
    }
    counter!(EVENTS_DELIVERED, "kind" => kind.as_str()).increment(count as u64);
}

/// Count a pruned subscriber.
pub fn record_subscriber_pruned(kind: SubscriberKind) {
    counter!(SUBSCRIBERS_PRUNED, "kind" => kind.as_str()).increment(1);
}

/// Set the live subscriber gauge for `kind`.
#[allow(clippy::cast_precision_loss)]
pub fn set_subscribers(kind: SubscriberKind, count: usize) {
    gauge!(SUBSCRIBERS, "kind" => kind.as_str()).set(count as f64);
}

/// Set the cached symbol gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_cached_symbols(count: usize) {
    gauge!(CACHED_SYMBOLS).set(count as f64);
}

/// Record how long one tick's fan-out took.
pub fn record_fan_out_duration(duration: Duration) {
    histogram!(FAN_OUT_SECONDS).record(duration.as_secs_f64());
}
