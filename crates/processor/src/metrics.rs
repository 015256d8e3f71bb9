//! Prometheus metrics for processor operations.

use crate::error::ProcessorResult;
use prometheus::{IntCounterVec, Opts, Registry};
use std::future::Future;
use std::sync::LazyLock;

/// Mutating operation outcomes, labeled by operation name and outcome
/// (`success` / `failure`).
pub static OPERATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "keppel_processor_operations_total",
            "Number of mutating processor operations by operation and outcome",
        ),
        &["operation", "outcome"],
    )
    .expect("metric creation failed")
});

/// Register the processor metrics with the given registry. Called by the
/// component that exposes the /metrics endpoint.
pub fn register_metrics(registry: &Registry) {
    registry
        .register(Box::new(OPERATIONS.clone()))
        .expect("metric registration failed");
}

/// Run one mutating operation and count its outcome.
pub(crate) async fn observe<T, F>(operation: &'static str, op: F) -> ProcessorResult<T>
where
    F: Future<Output = ProcessorResult<T>>,
{
    let result = op.await;
    let outcome = if result.is_ok() { "success" } else { "failure" };
    OPERATIONS.with_label_values(&[operation, outcome]).inc();
    result
}
