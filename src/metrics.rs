//! # Metrics
//!
//! Prometheus metrics for monitoring the controller.
//!
//! ## Metrics Exposed
//!
//! - `network_inventory_refreshes_total` - Total number of refresh passes
//! - `network_inventory_refresh_errors_total` - Total number of failed refresh passes
//! - `network_inventory_refresh_duration_seconds` - Duration of refresh passes
//! - `network_inventory_entity_changes_total` - Rows created/updated/deleted/failed, by kind and operation
//! - `network_inventory_fetch_retries_total` - Provider API fetch retries, by kind

use anyhow::Result;
use prometheus::{Histogram, IntCounter, IntCounterVec, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static REFRESHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "network_inventory_refreshes_total",
        "Total number of refresh passes",
    )
    .expect("Failed to create REFRESHES_TOTAL metric - this should never happen")
});

static REFRESH_ERRORS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "network_inventory_refresh_errors_total",
        "Total number of failed refresh passes",
    )
    .expect("Failed to create REFRESH_ERRORS_TOTAL metric - this should never happen")
});

static REFRESH_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "network_inventory_refresh_duration_seconds",
            "Duration of refresh passes in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
    )
    .expect("Failed to create REFRESH_DURATION metric - this should never happen")
});

static ENTITY_CHANGES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "network_inventory_entity_changes_total",
            "Rows changed by reconciliation, by entity kind and operation",
        ),
        &["kind", "operation"],
    )
    .expect("Failed to create ENTITY_CHANGES_TOTAL metric - this should never happen")
});

static FETCH_RETRIES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "network_inventory_fetch_retries_total",
            "Provider API fetch retries, by entity kind",
        ),
        &["kind"],
    )
    .expect("Failed to create FETCH_RETRIES_TOTAL metric - this should never happen")
});

#[allow(
    clippy::missing_errors_doc,
    reason = "Error documentation is provided in doc comments"
)]
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(REFRESHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REFRESH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REFRESH_DURATION.clone()))?;
    REGISTRY.register(Box::new(ENTITY_CHANGES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FETCH_RETRIES_TOTAL.clone()))?;

    Ok(())
}

pub fn increment_refreshes() {
    REFRESHES_TOTAL.inc();
}

pub fn increment_refresh_errors() {
    REFRESH_ERRORS_TOTAL.inc();
}

pub fn observe_refresh_duration(duration: f64) {
    REFRESH_DURATION.observe(duration);
}

pub fn record_entity_changes(
    kind: &str,
    created: usize,
    updated: usize,
    deleted: usize,
    failed: usize,
) {
    for (operation, count) in [
        ("create", created),
        ("update", updated),
        ("delete", deleted),
        ("fail", failed),
    ] {
        if count > 0 {
            ENTITY_CHANGES_TOTAL
                .with_label_values(&[kind, operation])
                .inc_by(count as u64);
        }
    }
}

pub fn increment_fetch_retries(kind: &str) {
    FETCH_RETRIES_TOTAL.with_label_values(&[kind]).inc();
}
