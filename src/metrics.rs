// Prometheus metrics for the admission-control service
//
// Exposed on the /metrics HTTP endpoint:
// - Admission decisions and check latency
// - Violations by scope and limit type
// - Reputation events by type
// - Replication attempts, buffer depth and ingested events
// - Throttle level, multiplier and sampled resource usage

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use std::sync::Arc;

lazy_static! {
    pub static ref REGISTRY: Arc<Registry> = Arc::new(Registry::new());

    // Decision engine
    pub static ref DECISIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratewarden_decisions_total", "Admission decisions by outcome"),
        &["outcome"]
    ).expect("Failed to create decisions metric");

    pub static ref CHECK_DURATION_SECONDS: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new("ratewarden_check_duration_seconds", "Time spent in check_limit")
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
    ).expect("Failed to create check duration metric");

    pub static ref CHECK_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratewarden_check_errors_total", "check_limit failures by error kind"),
        &["kind"]
    ).expect("Failed to create check errors metric");

    pub static ref VIOLATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratewarden_violations_total", "Rule violations"),
        &["scope", "limit_type"]
    ).expect("Failed to create violations metric");

    pub static ref CLEANUP_ROWS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratewarden_cleanup_rows_total", "Rows removed by retention jobs"),
        &["table"]
    ).expect("Failed to create cleanup metric");

    // Reputation
    pub static ref REPUTATION_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        prometheus::Opts::new("ratewarden_reputation_events_total", "Reputation events recorded"),
        &["event_type"]
    ).expect("Failed to create reputation events metric");

    pub static ref REPUTATION_DECAYED_USERS_TOTAL: IntCounter = IntCounter::new(
        "ratewarden_reputation_decayed_users_total",
        "Users moved toward neutral by the decay job"
    ).expect("Failed to create decay metric");

    // Replication
    pub static ref REPLICATION_ATTEMPTS_TOTAL: CounterVec = CounterVec::new(
        prometheus::Opts::new("ratewarden_replication_attempts_total", "Peer sync attempts"),
        &["peer", "direction", "status"]
    ).expect("Failed to create replication attempts metric");

    pub static ref REPLICATION_BUFFER_SIZE: IntGauge = IntGauge::new(
        "ratewarden_replication_buffer_size",
        "Events waiting to be pushed to peers"
    ).expect("Failed to create replication buffer metric");

    pub static ref REPLICATION_EVENTS_INGESTED_TOTAL: IntCounter = IntCounter::new(
        "ratewarden_replication_events_ingested_total",
        "Remote events accepted into the local journal"
    ).expect("Failed to create ingested events metric");

    // Throttling
    pub static ref THROTTLE_LEVEL: IntGauge = IntGauge::new(
        "ratewarden_throttle_level",
        "Current throttle level (0=none .. 4=critical)"
    ).expect("Failed to create throttle level metric");

    pub static ref THROTTLE_MULTIPLIER: Gauge = Gauge::new(
        "ratewarden_throttle_multiplier",
        "Current throttle multiplier"
    ).expect("Failed to create throttle multiplier metric");

    pub static ref CPU_USAGE_PERCENT: Gauge = Gauge::new(
        "ratewarden_cpu_usage_percent",
        "Sampled CPU usage"
    ).expect("Failed to create CPU usage metric");

    pub static ref MEMORY_USAGE_PERCENT: Gauge = Gauge::new(
        "ratewarden_memory_usage_percent",
        "Sampled memory usage"
    ).expect("Failed to create memory usage metric");

    pub static ref LIVE_TASKS: IntGauge = IntGauge::new(
        "ratewarden_live_tasks",
        "Live runtime tasks at the last sample"
    ).expect("Failed to create live tasks metric");
}

/// Register every metric with [`REGISTRY`]
///
/// Safe to call more than once; already registered collectors are skipped.
pub fn init() -> prometheus::Result<()> {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(DECISIONS_TOTAL.clone()),
        Box::new(CHECK_DURATION_SECONDS.clone()),
        Box::new(CHECK_ERRORS_TOTAL.clone()),
        Box::new(VIOLATIONS_TOTAL.clone()),
        Box::new(CLEANUP_ROWS_TOTAL.clone()),
        Box::new(REPUTATION_EVENTS_TOTAL.clone()),
        Box::new(REPUTATION_DECAYED_USERS_TOTAL.clone()),
        Box::new(REPLICATION_ATTEMPTS_TOTAL.clone()),
        Box::new(REPLICATION_BUFFER_SIZE.clone()),
        Box::new(REPLICATION_EVENTS_INGESTED_TOTAL.clone()),
        Box::new(THROTTLE_LEVEL.clone()),
        Box::new(THROTTLE_MULTIPLIER.clone()),
        Box::new(CPU_USAGE_PERCENT.clone()),
        Box::new(MEMORY_USAGE_PERCENT.clone()),
        Box::new(LIVE_TASKS.clone()),
    ];

    for collector in collectors {
        match REGISTRY.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| anyhow::anyhow!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| anyhow::anyhow!("Invalid UTF-8 in metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        assert!(init().is_ok());
        assert!(init().is_ok());
    }

    #[test]
    fn test_gather_contains_decisions() {
        init().unwrap();
        DECISIONS_TOTAL.with_label_values(&["allowed"]).inc();
        let text = gather_metrics().unwrap();
        assert!(text.contains("ratewarden_decisions_total"));
    }
}
