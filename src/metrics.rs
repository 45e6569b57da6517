//! Prometheus metrics via `once_cell::Lazy` statics and `register_*!` macros.

use once_cell::sync::Lazy;
use prometheus::{
    opts, register_histogram_vec, register_int_gauge_vec, HistogramVec, IntGaugeVec,
};

const EXPONENTIAL_SECONDS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// 1 while a broker is connected, 0 otherwise; one time series per identity.
pub static BROKER_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("ha_amqp_broker_connected", "1 if the broker is currently connected, else 0"),
        &["identity"]
    )
    .unwrap()
});

pub static PUBLISH_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ha_amqp_publish_duration_seconds",
        "Time spent in a single-broker basic_publish call",
        &["identity"],
        EXPONENTIAL_SECONDS.to_vec()
    )
    .unwrap()
});

/// Entries currently held in the coordinator's published-context cache.
pub static PUBLISHED_CACHE_SIZE: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        opts!("ha_amqp_published_cache_size", "Entries held in the published-context cache"),
        &["coordinator"]
    )
    .unwrap()
});
