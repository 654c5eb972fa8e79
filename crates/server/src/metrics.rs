//! Prometheus metrics for the clonedb server.
//!
//! Exposes lifecycle counters, executor failures and instance start latency.
//!
//! # Security Note
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping.
//! Metrics carry no identifiers or principals, only aggregate counts. The
//! endpoint should still be network-restricted to the scraper.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Image metrics
pub static IMAGES_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("clonedb_images_created_total", "Total number of images created")
        .expect("metric creation failed")
});

pub static IMAGES_FINALISED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "clonedb_images_finalised_total",
        "Total number of images finalised",
    )
    .expect("metric creation failed")
});

pub static IMAGES_DESTROYED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "clonedb_images_destroyed_total",
        "Total number of images destroyed",
    )
    .expect("metric creation failed")
});

pub static CASCADE_DESTROYS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "clonedb_cascade_destroys_total",
        "Total number of images destroyed together with their instances",
    )
    .expect("metric creation failed")
});

// Instance metrics
pub static INSTANCES_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "clonedb_instances_created_total",
        "Total number of instances created",
    )
    .expect("metric creation failed")
});

pub static INSTANCES_DESTROYED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "clonedb_instances_destroyed_total",
        "Total number of instances destroyed",
    )
    .expect("metric creation failed")
});

pub static LIVE_INSTANCES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("clonedb_live_instances", "Current number of live instances")
        .expect("metric creation failed")
});

pub static INSTANCE_CREATE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "clonedb_instance_create_duration_seconds",
            "Time taken to snapshot, start and probe a new instance",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static EXECUTOR_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "clonedb_executor_failures_total",
            "Total executor failures by operation",
        ),
        &["operation"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedded routers can call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(IMAGES_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(IMAGES_FINALISED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(IMAGES_DESTROYED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CASCADE_DESTROYS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INSTANCES_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INSTANCES_DESTROYED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(LIVE_INSTANCES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(INSTANCE_CREATE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(EXECUTOR_FAILURES.clone()))
            .expect("metric registration failed");
    });
}

/// GET /metrics - Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record an executor failure for `operation`.
pub fn record_executor_failure(operation: &str) {
    EXECUTOR_FAILURES.with_label_values(&[operation]).inc();
}
