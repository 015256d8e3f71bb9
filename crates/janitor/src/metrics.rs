//! Prometheus metrics for the janitor.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::LazyLock;

/// Registry for all janitor metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Task poll outcomes, labeled by task name and outcome
/// (`success` / `failure` / `idle`).
pub static TASK_RUNS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keppel_janitor_task_runs_total",
            "Number of janitor task polls by task and outcome",
        ),
        &["task", "outcome"],
    )
    .expect("metric creation failed")
});

/// Rows removed by the sweeps, labeled by object kind
/// (`blob_mount` / `blob` / `manifest` / `unknown_blob` / `unknown_manifest`).
pub static OBJECTS_SWEPT: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keppel_janitor_objects_swept_total",
            "Number of objects removed by janitor sweeps, by kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

/// Register all metrics with the registry, including the processor's
/// operation counters. Call once at startup.
pub fn register_metrics() {
    REGISTRY
        .register(Box::new(TASK_RUNS.clone()))
        .expect("metric registration failed");
    REGISTRY
        .register(Box::new(OBJECTS_SWEPT.clone()))
        .expect("metric registration failed");
    keppel_processor::metrics::register_metrics(&REGISTRY);
}

/// Render all metrics in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::error!("could not encode metrics: {err}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
