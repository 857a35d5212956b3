//! In-memory recycle bin for unit tests

use crate::recycle_bin::RecycleBin;
use async_trait::async_trait;
use informer::{ObjectIdentity, SinkError};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// One call received by [`MemoryRecycleBin`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecycledEntry {
    /// "delete" or "update"
    pub event: &'static str,
    /// Object the call was about
    pub identity: ObjectIdentity,
    /// Deleted object, or the pre-update state
    pub snapshot: Value,
    /// Post-update state
    pub replaced_by: Option<Value>,
}

/// Recycle bin that keeps every call in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecycleBin {
    entries: Arc<Mutex<Vec<RecycledEntry>>>,
}

impl MemoryRecycleBin {
    /// Creates an empty bin.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far, oldest first.
    pub fn entries(&self) -> Vec<RecycledEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, entry: RecycledEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

#[async_trait]
impl RecycleBin for MemoryRecycleBin {
    async fn delete(&self, identity: &ObjectIdentity, snapshot: &Value) -> Result<(), SinkError> {
        self.push(RecycledEntry {
            event: "delete",
            identity: identity.clone(),
            snapshot: snapshot.clone(),
            replaced_by: None,
        });
        Ok(())
    }

    async fn update(&self, identity: &ObjectIdentity, old: &Value, new: &Value) -> Result<(), SinkError> {
        self.push(RecycledEntry {
            event: "update",
            identity: identity.clone(),
            snapshot: old.clone(),
            replaced_by: Some(new.clone()),
        });
        Ok(())
    }
}
