use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
pub static PROMETHEUS_REGISTRY: OnceLock<Registry> = OnceLock::new();
pub static CHECKOUTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static RECONCILIATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static RECONCILIATION_MISMATCH_TOTAL: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
    let builder = PrometheusBuilder::new();
    let handle = builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    if METRICS_HANDLE.set(handle).is_err() {
        panic!("failed to set metrics handle: already initialized");
    }

    let registry = Registry::new();

    let checkouts = IntCounterVec::new(
        Opts::new("subscription_checkouts_total", "Checkout attempts by outcome"),
        &["gateway", "outcome"],
    )
    .expect("Failed to create subscription_checkouts_total metric");

    let reconciliations = IntCounterVec::new(
        Opts::new(
            "subscription_reconciliations_total",
            "Reconciliation results by trigger and outcome",
        ),
        &["trigger", "outcome"],
    )
    .expect("Failed to create subscription_reconciliations_total metric");

    let mismatches = IntCounter::with_opts(Opts::new(
        "reconciliation_mismatch_total",
        "Paid transactions the gateway later reported as something else",
    ))
    .expect("Failed to create reconciliation_mismatch_total metric");

    registry
        .register(Box::new(checkouts.clone()))
        .expect("Failed to register subscription_checkouts_total");
    registry
        .register(Box::new(reconciliations.clone()))
        .expect("Failed to register subscription_reconciliations_total");
    registry
        .register(Box::new(mismatches.clone()))
        .expect("Failed to register reconciliation_mismatch_total");

    PROMETHEUS_REGISTRY
        .set(registry)
        .expect("Failed to set prometheus registry");
    CHECKOUTS_TOTAL
        .set(checkouts)
        .expect("Failed to set subscription_checkouts_total");
    RECONCILIATIONS_TOTAL
        .set(reconciliations)
        .expect("Failed to set subscription_reconciliations_total");
    RECONCILIATION_MISMATCH_TOTAL
        .set(mismatches)
        .expect("Failed to set reconciliation_mismatch_total");
}

pub fn get_metrics() -> String {
    let mut output = METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string());

    if let Some(registry) = PROMETHEUS_REGISTRY.get() {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).ok();
        if let Ok(custom_metrics) = String::from_utf8(buffer) {
            output.push_str(&custom_metrics);
        }
    }

    output
}

pub fn record_checkout(gateway: &str, outcome: &str) {
    if let Some(counter) = CHECKOUTS_TOTAL.get() {
        counter.with_label_values(&[gateway, outcome]).inc();
    }
}

/// `trigger` is one of `callback`, `checkout`, `history` or `sweep`.
pub fn record_reconciliation(trigger: &str, outcome: &str) {
    if let Some(counter) = RECONCILIATIONS_TOTAL.get() {
        counter.with_label_values(&[trigger, outcome]).inc();
    }
}

pub fn record_mismatch() {
    if let Some(counter) = RECONCILIATION_MISMATCH_TOTAL.get() {
        counter.inc();
    }
}
