//! Outbound writes issued by the replication engine

use crate::annotations::Origin;
use crate::error::WriteError;
use crate::object::{ObjectKey, Replica};
use async_trait::async_trait;

/// Creates, updates and removes replicas on the cluster.
///
/// Implementations must be idempotent: applying the same replica twice, or
/// deleting one that is already gone, succeeds. They must never touch an
/// object that is not a replica: `apply` over such an object and `delete` of
/// anything whose origin is not `origin` fail with
/// [`WriteError::NotReplica`].
#[async_trait]
pub trait ReplicaWriter: Send + Sync {
    /// Create or overwrite `replica`.
    async fn apply(&self, replica: &Replica) -> Result<(), WriteError>;

    /// Remove the replica of `origin` at `key`.
    async fn delete(&self, key: &ObjectKey, origin: &Origin) -> Result<(), WriteError>;
}
