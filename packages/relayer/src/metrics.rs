//! Prometheus metrics for the Ionize relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    // Watcher metrics
    pub static ref DEPOSITS_DETECTED: CounterVec = register_counter_vec!(
        "relayer_deposits_detected_total",
        "Total number of vault deposits detected",
        &["chain", "routed"]
    ).unwrap();

    pub static ref STREAM_RECONNECTS: CounterVec = register_counter_vec!(
        "relayer_stream_reconnects_total",
        "Total number of watcher stream reconnects",
        &["chain", "reason"]
    ).unwrap();

    pub static ref LAST_EVENT: GaugeVec = register_gauge_vec!(
        "relayer_last_event_timestamp",
        "Unix timestamp of the last event received from a chain",
        &["chain"]
    ).unwrap();

    // Queue metrics
    pub static ref INTENTS_PUBLISHED: CounterVec = register_counter_vec!(
        "relayer_intents_published_total",
        "Total number of intents published to the relay queue",
        &["chain", "status"]
    ).unwrap();

    pub static ref DELIVERIES: CounterVec = register_counter_vec!(
        "relayer_deliveries_total",
        "Relay queue deliveries by outcome",
        &["outcome"]
    ).unwrap();

    // Executor metrics
    pub static ref INTENTS_FINALIZED: CounterVec = register_counter_vec!(
        "relayer_intents_finalized_total",
        "Intents resolved by the executor, by terminal status",
        &["to_chain", "status"]
    ).unwrap();

    pub static ref DUPLICATES_SKIPPED: CounterVec = register_counter_vec!(
        "relayer_duplicates_skipped_total",
        "Intents discarded because they were already processed",
        &["reason"]
    ).unwrap();

    pub static ref PAYOUT_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_payout_latency_seconds",
        "Time to build, sign and submit a payout",
        &["chain"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref PAYOUT_FAILURES: CounterVec = register_counter_vec!(
        "relayer_payout_failures_total",
        "Payout failures by chain and error class",
        &["chain", "class"]
    ).unwrap();

    pub static ref VOLUME_BRIDGED: CounterVec = register_counter_vec!(
        "relayer_volume_bridged_total",
        "Total amount paid out, in whole asset units",
        &["chain", "token"]
    ).unwrap();

    pub static ref FEES_COLLECTED: CounterVec = register_counter_vec!(
        "relayer_fees_collected_total",
        "Fixed fees withheld from payouts, in whole asset units",
        &["chain", "token"]
    ).unwrap();

    // Errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["component", "type"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

/// Record a deposit seen by a watcher
pub fn record_deposit_detected(chain: &str, routed: bool) {
    let routed = if routed { "yes" } else { "no" };
    DEPOSITS_DETECTED.with_label_values(&[chain, routed]).inc();
    record_event(chain);
}

/// Record a stream reconnect
pub fn record_reconnect(chain: &str, reason: &str) {
    STREAM_RECONNECTS.with_label_values(&[chain, reason]).inc();
}

fn record_event(chain: &str) {
    let timestamp = chrono::Utc::now().timestamp() as f64;
    LAST_EVENT.with_label_values(&[chain]).set(timestamp);
}

/// Record an intent publish attempt
pub fn record_published(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    INTENTS_PUBLISHED.with_label_values(&[chain, status]).inc();
}

/// Record how a queue delivery was settled (`ack`, `reject`, `requeue`)
pub fn record_delivery(outcome: &str) {
    DELIVERIES.with_label_values(&[outcome]).inc();
}

/// Record a terminal status
pub fn record_finalized(to_chain: &str, status: &str) {
    INTENTS_FINALIZED.with_label_values(&[to_chain, status]).inc();
}

/// Record a skipped duplicate (`ledger` or `terminal`)
pub fn record_duplicate(reason: &str) {
    DUPLICATES_SKIPPED.with_label_values(&[reason]).inc();
}

/// Record payout latency
pub fn record_payout_latency(chain: &str, seconds: f64) {
    PAYOUT_LATENCY.with_label_values(&[chain]).observe(seconds);
}

/// Record a payout failure
pub fn record_payout_failure(chain: &str, class: &str) {
    PAYOUT_FAILURES.with_label_values(&[chain, class]).inc();
}

/// Record a successful payout and the fee withheld
pub fn record_payout(chain: &str, token: &str, amount: f64, fee: f64) {
    VOLUME_BRIDGED.with_label_values(&[chain, token]).inc_by(amount);
    FEES_COLLECTED.with_label_values(&[chain, token]).inc_by(fee);
}

/// Record an error
pub fn record_error(component: &str, error_type: &str) {
    ERRORS.with_label_values(&[component, error_type]).inc();
}
