//! Synchronous registry mutators.
//!
//! The [`Processor`] implements the operations behind push, pull, and
//! delete: blob registration and mounting, chunked uploads, manifest
//! ingestion with full reference validation, tag updates, and deletes.
//! Replication from upstream registries lives in [`replication`].
//!
//! Every operation is one unit of work against the metadata store; the
//! store's transactions, unique constraints, and restrict FKs are the
//! last line of defense for the schema invariants.

pub mod accounts;
pub mod blobs;
pub mod error;
pub mod manifests;
pub mod metrics;
pub mod replication;
pub mod uploads;

pub use error::{ProcessorError, ProcessorResult};
pub use replication::{HttpReplicationClient, ReplicationClient, UpstreamRef};

use keppel_core::Auditor;
use keppel_metadata::MetadataStore;
use keppel_storage::StorageDriver;
use std::sync::Arc;
use time::OffsetDateTime;

/// Injectable time source so tests can drive mark-and-sweep intervals.
pub type Clock = Arc<dyn Fn() -> OffsetDateTime + Send + Sync>;

/// The synchronous mutator half of the registry core.
pub struct Processor {
    db: Arc<dyn MetadataStore>,
    storage: Arc<dyn StorageDriver>,
    auditor: Arc<dyn Auditor>,
    clock: Clock,
}

impl Processor {
    pub fn new(
        db: Arc<dyn MetadataStore>,
        storage: Arc<dyn StorageDriver>,
        auditor: Arc<dyn Auditor>,
    ) -> Self {
        Self {
            db,
            storage,
            auditor,
            clock: Arc::new(OffsetDateTime::now_utc),
        }
    }

    /// Replace the time source (tests only).
    pub fn with_clock(mut self, clock: Clock) -> Self {
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

    pub(crate) fn auditor(&self) -> &dyn Auditor {
        &*self.auditor
    }
}
