//! Sink contract registered with a router

use crate::error::SinkError;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Bounds every routed kind satisfies.
pub trait WatchedResource:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

impl<K> WatchedResource for K where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
}

/// Receives lifecycle events for one kind.
///
/// Sinks are registered when a [`Router`](crate::Router) is built and called in
/// registration order. Resync redeliveries arrive through `on_update` with
/// `old` and `new` describing the same object version; sinks must treat them
/// like any other update.
#[async_trait::async_trait]
pub trait EventSink<K: WatchedResource>: Send + Sync {
    /// Short name used in log lines
    fn name(&self) -> &'static str;

    /// Object appeared (initial list or creation)
    async fn on_add(&self, obj: &K) -> Result<(), SinkError>;

    /// Object changed, or a resync redelivery
    async fn on_update(&self, old: &K, new: &K) -> Result<(), SinkError>;

    /// Object is gone; `obj` is its last known state
    async fn on_delete(&self, obj: &K) -> Result<(), SinkError>;

    /// The first complete list of the kind has been delivered
    async fn on_synced(&self) -> Result<(), SinkError> {
        Ok(())
    }
}
