//! Recycle bin contract, the sink feeding it, and a filesystem backend.
//!
//! The sink hands the bin a snapshot of an object right before it is lost:
//! on delete always, on update only when `handle_updates` is set and the
//! object's labels, annotations or payload actually changed.

use crate::snapshot::{ContentDigest, Snapshot};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use informer::{EventSink, ObjectIdentity, SinkError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Directory used for cluster scoped objects.
const CLUSTER_SCOPE_DIR: &str = "_cluster";

/// Errors raised by recycle bin backends.
#[derive(Debug, Error)]
pub enum RecycleBinError {
    /// Writing the snapshot failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot could not be rendered as YAML
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<RecycleBinError> for SinkError {
    fn from(e: RecycleBinError) -> Self {
        match e {
            RecycleBinError::Io(e) => SinkError::Io(e),
            RecycleBinError::Yaml(e) => SinkError::Backend {
                sink: "recycle-bin",
                message: e.to_string(),
            },
        }
    }
}

/// Backend storing snapshots of deleted or overwritten objects.
#[async_trait]
pub trait RecycleBin: Send + Sync {
    /// Keep the last state of a deleted object.
    async fn delete(&self, identity: &ObjectIdentity, snapshot: &Value) -> Result<(), SinkError>;

    /// Keep the state an object had before an update.
    async fn update(&self, identity: &ObjectIdentity, old: &Value, new: &Value) -> Result<(), SinkError>;
}

/// Routes one kind's deletes (and optionally updates) into a [`RecycleBin`].
pub struct RecycleBinSink<K> {
    bin: Arc<dyn RecycleBin>,
    handle_updates: bool,
    _kind: PhantomData<fn() -> K>,
}

impl<K> RecycleBinSink<K> {
    /// Creates a sink writing to `bin`. Updates are forwarded only when
    /// `handle_updates` is set.
    pub fn new(bin: Arc<dyn RecycleBin>, handle_updates: bool) -> Self {
        Self {
            bin,
            handle_updates,
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for RecycleBinSink<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecycleBinSink")
            .field("handle_updates", &self.handle_updates)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: Snapshot> EventSink<K> for RecycleBinSink<K> {
    fn name(&self) -> &'static str {
        "recycle-bin"
    }

    async fn on_add(&self, _obj: &K) -> Result<(), SinkError> {
        Ok(())
    }

    async fn on_update(&self, old: &K, new: &K) -> Result<(), SinkError> {
        if !self.handle_updates || !ContentDigest::changed(old, new) {
            return Ok(());
        }
        let identity = ObjectIdentity::of(new);
        let old = serde_json::to_value(old.redacted())?;
        let new = serde_json::to_value(new.redacted())?;
        self.bin.update(&identity, &old, &new).await
    }

    async fn on_delete(&self, obj: &K) -> Result<(), SinkError> {
        let identity = ObjectIdentity::of(obj);
        let snapshot = serde_json::to_value(obj.redacted())?;
        self.bin.delete(&identity, &snapshot).await
    }
}

/// Document written for each recycled object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecycledDocument {
    /// What was recycled
    pub identity: ObjectIdentity,
    /// "delete" or "update"
    pub event: String,
    /// When the bin received it
    pub recorded_at: DateTime<Utc>,
    /// State before the event
    pub object: Value,
    /// State after an update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<Value>,
}

/// Recycle bin writing one YAML file per snapshot:
/// `<root>/<kind>/<namespace>/<name>.<timestamp>.<event>.yaml`.
#[derive(Debug, Clone)]
pub struct FsRecycleBin {
    root: PathBuf,
}

impl FsRecycleBin {
    /// Creates a bin rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of the bin.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, doc: &RecycledDocument) -> PathBuf {
        let identity = &doc.identity;
        let scope = identity
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(CLUSTER_SCOPE_DIR);
        let file = format!(
            "{}.{}.{}.yaml",
            identity.name,
            doc.recorded_at.format("%Y%m%dT%H%M%S%.6fZ"),
            doc.event
        );
        self.root.join(identity.kind.to_lowercase()).join(scope).join(file)
    }

    async fn store(&self, doc: RecycledDocument) -> Result<PathBuf, RecycleBinError> {
        let path = self.path_for(&doc);
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let yaml = serde_yaml::to_string(&doc)?;
        tokio::fs::write(&path, yaml).await?;
        Ok(path)
    }
}

#[async_trait]
impl RecycleBin for FsRecycleBin {
    async fn delete(&self, identity: &ObjectIdentity, snapshot: &Value) -> Result<(), SinkError> {
        let path = self
            .store(RecycledDocument {
                identity: identity.clone(),
                event: "delete".to_string(),
                recorded_at: Utc::now(),
                object: snapshot.clone(),
                replaced_by: None,
            })
            .await?;
        info!("Recycled deleted {} to {}", identity, path.display());
        Ok(())
    }

    async fn update(&self, identity: &ObjectIdentity, old: &Value, new: &Value) -> Result<(), SinkError> {
        let path = self
            .store(RecycledDocument {
                identity: identity.clone(),
                event: "update".to_string(),
                recorded_at: Utc::now(),
                object: old.clone(),
                replaced_by: Some(new.clone()),
            })
            .await?;
        debug!("Recycled previous version of {} to {}", identity, path.display());
        Ok(())
    }
}
