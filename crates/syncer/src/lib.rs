//! Config syncer for kubed
//!
//! Replicates Secrets and ConfigMaps annotated with
//! `kubed.appscode.com/sync: "true"` into every namespace matched by the
//! optional `kubed.appscode.com/sync-selector` label selector, and keeps the
//! replicas identical to their source as sources, namespaces and replicas
//! change.
//!
//! # Components
//!
//! - [`ReplicationEngine`]: source/replica bookkeeping and the write planner
//! - [`ReplicationSink`]: routes Secret and ConfigMap events into the engine
//! - [`NamespaceTracker`]: routes Namespace events into the engine
//! - [`ReplicaWriter`]: the outbound write seam, mocked by `MockReplicaWriter`
//!   with the `test-util` feature

pub mod annotations;
pub mod engine;
pub mod error;
pub mod object;
pub mod replication;
pub mod selector;
pub mod tracker;
pub mod writer;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use annotations::{ORIGIN_ANNOTATION, Origin, SYNC_ANNOTATION, SYNC_SELECTOR_ANNOTATION, SyncSettings};
pub use engine::{DEFAULT_WRITE_TIMEOUT, EngineOptions, ReconcileReport, ReplicationEngine};
pub use error::{SelectorError, WriteError};
pub use object::{ObjectKey, ObjectView, Replica, ReplicaTemplate, Replicable, SyncKind};
pub use replication::ReplicationSink;
pub use selector::parse_selector;
pub use tracker::{NamespaceSnapshot, NamespaceTracker};
pub use writer::ReplicaWriter;
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockReplicaWriter;
