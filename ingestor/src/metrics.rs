use lazy_static::lazy_static;
use prometheus::core::Collector;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_messages_total",
        "Total messages received from device brokers"
    ))
    .unwrap();
    pub static ref DECODED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_decoded_messages_total",
        "Total messages carrying a usable alcohol level"
    ))
    .unwrap();
    pub static ref DROPPED_MESSAGES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_dropped_messages_total",
        "Total messages dropped because no alcohol level could be decoded"
    ))
    .unwrap();
    pub static ref READINGS_PERSISTED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_readings_persisted_total",
        "Total readings written to storage"
    ))
    .unwrap();
    pub static ref READING_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_reading_failures_total",
        "Total reading inserts that failed"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_db_failures_total",
        "Total transient database failures that were retried"
    ))
    .unwrap();
    pub static ref FLUSH_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "alcowatch_flush_latency_seconds",
            "Time taken to flush the reading buffer into storage"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
    pub static ref BUFFER_SIZE: Gauge = Gauge::with_opts(Opts::new(
        "alcowatch_buffer_size",
        "Readings waiting in the batch buffer"
    ))
    .unwrap();
    pub static ref CONNECTED_DEVICES: IntGauge = IntGauge::with_opts(Opts::new(
        "alcowatch_connected_devices",
        "Devices with a live broker subscription"
    ))
    .unwrap();
    pub static ref CONNECTION_ATTEMPTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_connection_attempts_total",
        "Total broker connection attempts"
    ))
    .unwrap();
    pub static ref PROTOCOL_FALLBACKS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_protocol_fallbacks_total",
        "Total connection attempts made with a fallback protocol version"
    ))
    .unwrap();
    pub static ref DEVICES_OFFLINE_TOTAL: CounterVec = CounterVec::new(
        Opts::new(
            "alcowatch_devices_offline_total",
            "Total online to offline transitions"
        ),
        &["cause"]
    )
    .unwrap();
    pub static ref CLEANUP_RUNS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("alcowatch_cleanup_runs_total", "Total reading wipes by outcome"),
        &["outcome"]
    )
    .unwrap();
    pub static ref CLEANUP_DELETED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "alcowatch_cleanup_deleted_total",
        "Total readings deleted by the cleanup scheduler"
    ))
    .unwrap();
}

/// Registers every collector. Fails if called twice.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(MESSAGES_TOTAL.clone()),
        Box::new(DECODED_MESSAGES_TOTAL.clone()),
        Box::new(DROPPED_MESSAGES_TOTAL.clone()),
        Box::new(READINGS_PERSISTED_TOTAL.clone()),
        Box::new(READING_FAILURES_TOTAL.clone()),
        Box::new(DB_FAILURES_TOTAL.clone()),
        Box::new(FLUSH_LATENCY_SECONDS.clone()),
        Box::new(BUFFER_SIZE.clone()),
        Box::new(CONNECTED_DEVICES.clone()),
        Box::new(CONNECTION_ATTEMPTS_TOTAL.clone()),
        Box::new(PROTOCOL_FALLBACKS_TOTAL.clone()),
        Box::new(DEVICES_OFFLINE_TOTAL.clone()),
        Box::new(CLEANUP_RUNS_TOTAL.clone()),
        Box::new(CLEANUP_DELETED_TOTAL.clone()),
    ];
    for collector in collectors {
        REGISTRY.register(collector)?;
    }
    Ok(())
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}
