//! Asynchronous maintenance loops for the registry.
//!
//! Every sweeper follows the same shape: claim one due work unit from the
//! scheduler columns (skip-locked on Postgres, so janitor processes pick
//! disjoint units), do the work, then record the next-due timestamp. An
//! idle poll reports [`TaskOutcome::Idle`] and the loop backs off.

pub mod blob_mounts;
pub mod blobs;
pub mod federation;
pub mod gc;
pub mod manifest_sync;
pub mod metrics;
pub mod storage_sweep;
pub mod validation;
pub mod vuln;

pub use federation::{HttpPeerClient, PeerClient};
pub use vuln::{TrivialScanner, VulnerabilityScanner};

use keppel_core::{Auditor, FederationDriver};
use keppel_metadata::{MetadataError, MetadataStore};
use keppel_processor::{Clock, Processor, ProcessorError};
use keppel_storage::{StorageDriver, StorageError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

/// How long a claim lease lasts. A worker that dies mid-sweep loses its
/// claim after this; the unit then retries on the next poll.
pub const CLAIM_LEASE: time::Duration = time::Duration::minutes(5);

/// What a single task poll did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// One unit of work was processed; poll again immediately.
    Processed,
    /// Nothing was due; the loop should back off.
    Idle,
}

/// Task failure, wrapped with the entity the sweeper was working on.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),

    #[error("{0}")]
    Scanner(String),

    #[error("{0}")]
    Peer(String),

    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<TaskError>,
    },
}

impl TaskError {
    /// Wrap with the entity name, e.g. "while sweeping blob mounts in repo
    /// test1/foo".
    pub fn in_context(self, context: impl Into<String>) -> Self {
        Self::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Transient failures reschedule with backoff; the rest are logged as
    /// fatal and the unit retries when its claim lease expires.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Metadata(err) => err.is_transient(),
            Self::Storage(err) => !matches!(err, StorageError::NotFound(_)),
            Self::Processor(err) => err.is_transient(),
            Self::Scanner(_) | Self::Peer(_) => true,
            Self::Wrapped { source, .. } => source.is_transient(),
        }
    }
}

impl From<keppel_core::Error> for TaskError {
    fn from(err: keppel_core::Error) -> Self {
        Self::Processor(ProcessorError::from(err))
    }
}

/// Result of one task poll.
pub type TaskResult = Result<TaskOutcome, TaskError>;

/// The janitor: owns the stores, drivers, and a processor for the
/// mutations that sweeps perform (manifest deletion during GC reuses the
/// exact push/delete semantics).
pub struct Janitor {
    db: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageDriver>,
    federation: Arc<dyn FederationDriver>,
    scanner: Arc<dyn VulnerabilityScanner>,
    auditor: Arc<dyn Auditor>,
    processor: Processor,
    clock: Clock,
}

impl Janitor {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageDriver>,
        federation: Arc<dyn FederationDriver>,
        scanner: Arc<dyn VulnerabilityScanner>,
        auditor: Arc<dyn Auditor>,
    ) -> Self {
        let clock: Clock = Arc::new(OffsetDateTime::now_utc);
        let processor = Processor::new(db.clone(), storage.clone(), auditor.clone())
            .with_clock(clock.clone());
        Self {
            db,
            storage,
            federation,
            scanner,
            auditor,
            processor,
            clock,
        }
    }

    /// Replace the time source (tests only).
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.processor = Processor::new(self.db.clone(), self.storage.clone(), self.auditor.clone())
            .with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub(crate) fn now(&self) -> OffsetDateTime {
        (self.clock)()
    }

    pub(crate) fn db(&self) -> &dyn MetadataStore {
        &*self.db
    }

    pub(crate) fn storage(&self) -> &dyn StorageDriver {
        &*self.storage
    }

    pub(crate) fn federation(&self) -> &dyn FederationDriver {
        &*self.federation
    }

    pub(crate) fn scanner(&self) -> &dyn VulnerabilityScanner {
        &*self.scanner
    }

    pub(crate) fn processor(&self) -> &Processor {
        &self.processor
    }
}

/// Drive one task in a loop until cancellation. `Processed` polls again
/// immediately; `Idle` and errors sleep for `poll_interval`. Outcome
/// counters are recorded per task name.
pub async fn run_task_loop<F, Fut>(
    task_name: &'static str,
    poll_interval: Duration,
    cancel: CancellationToken,
    mut task: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = TaskResult>,
{
    tracing::info!(task = task_name, "janitor loop started");
    loop {
        if cancel.is_cancelled() {
            tracing::info!(task = task_name, "janitor loop stopped");
            return;
        }
        match task().await {
            Ok(TaskOutcome::Processed) => {
                metrics::TASK_RUNS
                    .with_label_values(&[task_name, "success"])
                    .inc();
                continue;
            }
            Ok(TaskOutcome::Idle) => {
                metrics::TASK_RUNS
                    .with_label_values(&[task_name, "idle"])
                    .inc();
                tracing::debug!(task = task_name, "nothing to do - slowing down");
            }
            Err(err) => {
                metrics::TASK_RUNS
                    .with_label_values(&[task_name, "failure"])
                    .inc();
                if err.is_transient() {
                    tracing::warn!(task = task_name, "task failed (will retry): {err}");
                } else {
                    tracing::error!(task = task_name, "task failed: {err}");
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(task = task_name, "janitor loop stopped");
                return;
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}
