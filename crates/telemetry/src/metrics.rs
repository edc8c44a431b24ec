// Metric construction only fails on malformed names, which are static here.
#![allow(clippy::expect_used)]

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ==== Sessions ====
    pub static ref PTZ_ACTIVE_SESSIONS: IntGauge = {
        let metric = IntGauge::new("ptz_active_sessions", "Number of connected PTZ device sessions")
            .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PTZ_SESSION_REFRESHES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "ptz_session_refreshes_total",
                "Capability refresh requests by result",
            ),
            &["result"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Capability probe ====
    pub static ref PTZ_PROBES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("ptz_probes_total", "Capability probe runs by outcome"),
            &["outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PTZ_PROBE_DURATION: Histogram = {
        let metric = Histogram::with_opts(
            HistogramOpts::new(
                "ptz_probe_duration_seconds",
                "Wall time of a full capability probe",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    // ==== Command dispatch ====
    pub static ref PTZ_COMMANDS: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new("ptz_commands_total", "PTZ commands dispatched by kind and outcome"),
            &["command", "outcome"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PTZ_TRANSPORT_RETRIES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "ptz_transport_retries_total",
                "Transport calls retried after a transient failure",
            ),
            &["operation"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PTZ_CAPABILITY_DOWNGRADES: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "ptz_capability_downgrades_total",
                "Capabilities marked unsupported after a device fault",
            ),
            &["capability"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };

    pub static ref PTZ_CAPABILITY_DEGRADED: IntCounterVec = {
        let metric = IntCounterVec::new(
            Opts::new(
                "ptz_capability_degraded_total",
                "Confirmed capabilities that failed repeatedly and forced a refresh",
            ),
            &["capability"],
        )
        .expect("metric can be created");
        REGISTRY.register(Box::new(metric.clone())).ok();
        metric
    };
}

/// Helper function to encode metrics for Prometheus scraping
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("metrics are not valid UTF-8: {}", e)))
}
