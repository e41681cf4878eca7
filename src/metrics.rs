//! Reconcile and proxy metrics (C8): a small `prometheus::Registry` with
//! counters for reconcile runs/failures and proxy requests.

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Clone)]
pub struct Metrics {
    pub reconcile_runs: IntCounter,
    pub reconcile_failures: IntCounterVec,
    pub proxy_requests: IntCounterVec,
    registry: Registry,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let reconcile_runs = IntCounter::with_opts(Opts::new(
            "pvc_clone_reconcile_runs_total",
            "total reconcile invocations",
        ))
        .expect("static metric options are valid");

        let reconcile_failures = IntCounterVec::new(
            Opts::new(
                "pvc_clone_reconcile_failures_total",
                "reconcile invocations that returned an error",
            ),
            &["reason"],
        )
        .expect("static metric options are valid");

        let proxy_requests = IntCounterVec::new(
            Opts::new(
                "pvc_clone_upload_proxy_requests_total",
                "upload proxy requests by route and status class",
            ),
            &["route", "status"],
        )
        .expect("static metric options are valid");

        registry
            .register(Box::new(reconcile_runs.clone()))
            .expect("metric registered exactly once");
        registry
            .register(Box::new(reconcile_failures.clone()))
            .expect("metric registered exactly once");
        registry
            .register(Box::new(proxy_requests.clone()))
            .expect("metric registered exactly once");

        Self {
            reconcile_runs,
            reconcile_failures,
            proxy_requests,
            registry,
        }
    }

    pub fn reconcile_failure(&self, reason: &str) {
        self.reconcile_failures.with_label_values(&[reason]).inc();
    }

    pub fn proxy_request(&self, route: &str, status_class: &str) {
        self.proxy_requests
            .with_label_values(&[route, status_class])
            .inc();
    }

    /// Render the registry in the Prometheus text exposition format for a
    /// `/metrics` handler.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder
            .encode(&families, &mut buf)
            .expect("text encoding never fails for valid metric families");
        String::from_utf8(buf).expect("prometheus text output is always valid utf8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
