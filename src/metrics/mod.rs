//! Prometheus metrics for the driver.
//!
//! The registry is the integration hook: the host process scrapes or
//! re-registers it however it exposes metrics.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;

/// Global metrics registry
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get the global metrics instance
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Driver metrics collection
pub struct Metrics {
    /// Registry for all metrics
    pub registry: Registry,

    /// Session leases granted
    pub acquires_total: IntCounter,
    /// Acquires that timed out waiting for capacity
    pub acquire_timeouts_total: IntCounter,
    /// Session releases by outcome (reuse/drop)
    pub releases_total: IntCounterVec,
    /// Requests submitted by kind
    pub requests_total: IntCounterVec,
    /// Live multiplexed sessions
    pub sessions_active: IntGauge,
    /// Live transports
    pub transports_active: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let acquires_total = IntCounter::new(
            "hermes_acquires_total",
            "Total number of session leases granted",
        )
        .unwrap();

        let acquire_timeouts_total = IntCounter::new(
            "hermes_acquire_timeouts_total",
            "Total number of acquires that timed out",
        )
        .unwrap();

        let releases_total = IntCounterVec::new(
            Opts::new(
                "hermes_releases_total",
                "Total number of session releases by outcome",
            ),
            &["outcome"], // reuse, drop
        )
        .unwrap();

        let requests_total = IntCounterVec::new(
            Opts::new("hermes_requests_total", "Total requests submitted by kind"),
            &["kind"], // query, update, prepare, tso, admin
        )
        .unwrap();

        let sessions_active = IntGauge::new(
            "hermes_sessions_active",
            "Current number of live multiplexed sessions",
        )
        .unwrap();

        let transports_active = IntGauge::new(
            "hermes_transports_active",
            "Current number of live transports",
        )
        .unwrap();

        registry.register(Box::new(acquires_total.clone())).unwrap();
        registry
            .register(Box::new(acquire_timeouts_total.clone()))
            .unwrap();
        registry.register(Box::new(releases_total.clone())).unwrap();
        registry.register(Box::new(requests_total.clone())).unwrap();
        registry
            .register(Box::new(sessions_active.clone()))
            .unwrap();
        registry
            .register(Box::new(transports_active.clone()))
            .unwrap();

        Self {
            registry,
            acquires_total,
            acquire_timeouts_total,
            releases_total,
            requests_total,
            sessions_active,
            transports_active,
        }
    }

    pub fn record_acquire(&self) {
        self.acquires_total.inc();
    }

    pub fn record_acquire_timeout(&self) {
        self.acquire_timeouts_total.inc();
    }

    pub fn record_release(&self, outcome: &str) {
        self.releases_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_request(&self, kind: &str) {
        self.requests_total.with_label_values(&[kind]).inc();
    }

    pub fn record_session_opened(&self) {
        self.sessions_active.inc();
    }

    pub fn record_session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn record_transport_opened(&self) {
        self.transports_active.inc();
    }

    pub fn record_transport_closed(&self) {
        self.transports_active.dec();
    }

    /// Get metrics as Prometheus text format
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
