//! Sink routing Secret and ConfigMap events into the replication engine

use crate::engine::ReplicationEngine;
use crate::object::{ObjectView, Replicable};
use async_trait::async_trait;
use informer::{EventSink, SinkError};
use std::marker::PhantomData;
use std::sync::Arc;

/// Replication sink for one replicable kind.
pub struct ReplicationSink<K> {
    engine: Arc<ReplicationEngine>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> ReplicationSink<K> {
    /// Creates a sink feeding `engine`.
    pub fn new(engine: Arc<ReplicationEngine>) -> Self {
        Self {
            engine,
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for ReplicationSink<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSink")
            .field("engine", &self.engine)
            .finish()
    }
}

#[async_trait]
impl<K: Replicable> EventSink<K> for ReplicationSink<K> {
    fn name(&self) -> &'static str {
        "config-syncer"
    }

    async fn on_add(&self, obj: &K) -> Result<(), SinkError> {
        self.engine.on_object_upsert(&ObjectView::of(obj)).await;
        Ok(())
    }

    async fn on_update(&self, _old: &K, new: &K) -> Result<(), SinkError> {
        self.engine.on_object_upsert(&ObjectView::of(new)).await;
        Ok(())
    }

    async fn on_delete(&self, obj: &K) -> Result<(), SinkError> {
        self.engine.on_object_delete(&ObjectView::of(obj)).await;
        Ok(())
    }

    async fn on_synced(&self) -> Result<(), SinkError> {
        self.engine.on_initial_sync(K::KIND).await;
        Ok(())
    }
}
