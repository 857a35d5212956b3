//! Mock ReplicaWriter for unit testing
//!
//! Keeps written replicas in memory, counts calls, and can be told to fail
//! so tests can exercise the retry-on-resync path. Refuses to overwrite or
//! delete objects that are not replicas, like the API server writer.

use crate::annotations::Origin;
use crate::error::WriteError;
use crate::object::{ObjectKey, Replica};
use crate::writer::ReplicaWriter;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

/// In-memory stand-in for the cluster.
#[derive(Debug, Clone, Default)]
pub struct MockReplicaWriter {
    objects: Arc<Mutex<BTreeMap<ObjectKey, Replica>>>,
    applies: Arc<Mutex<usize>>,
    deletes: Arc<Mutex<usize>>,
    failing: Arc<Mutex<bool>>,
}

impl MockReplicaWriter {
    /// Create an empty mock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    /// Replica currently stored at `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<Replica> {
        lock(&self.objects).get(key).cloned()
    }

    /// Every stored replica.
    pub fn replicas(&self) -> Vec<Replica> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Namespaces holding a replica with this kind and name.
    pub fn namespaces_holding(&self, key: &ObjectKey) -> BTreeSet<String> {
        lock(&self.objects)
            .keys()
            .filter(|k| k.kind == key.kind && k.name == key.name)
            .map(|k| k.namespace.clone())
            .collect()
    }

    /// Successful and failed `apply` calls so far.
    pub fn apply_calls(&self) -> usize {
        *lock(&self.applies)
    }

    /// Successful and failed `delete` calls so far.
    pub fn delete_calls(&self) -> usize {
        *lock(&self.deletes)
    }

    /// Total writes so far.
    pub fn write_calls(&self) -> usize {
        self.apply_calls() + self.delete_calls()
    }

    /// Place an object directly, as if written by someone else.
    pub fn insert(&self, replica: Replica) {
        lock(&self.objects).insert(replica.key.clone(), replica);
    }

    /// Drop an object directly, as if deleted by someone else.
    pub fn remove(&self, key: &ObjectKey) -> Option<Replica> {
        lock(&self.objects).remove(key)
    }

    fn check_failing(&self) -> Result<(), WriteError> {
        if *lock(&self.failing) {
            Err(WriteError::Backend("injected failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl ReplicaWriter for MockReplicaWriter {
    async fn apply(&self, replica: &Replica) -> Result<(), WriteError> {
        *lock(&self.applies) += 1;
        self.check_failing()?;
        let key = &replica.key;
        let mut objects = lock(&self.objects);
        let foreign = objects
            .get(key)
            .is_some_and(|existing| Origin::of_replica(&key.namespace, &key.name, &existing.annotations).is_none());
        if foreign {
            return Err(WriteError::NotReplica(key.clone()));
        }
        objects.insert(key.clone(), replica.clone());
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey, origin: &Origin) -> Result<(), WriteError> {
        *lock(&self.deletes) += 1;
        self.check_failing()?;
        let mut objects = lock(&self.objects);
        let Some(existing) = objects.get(key) else {
            return Ok(());
        };
        if Origin::of_replica(&key.namespace, &key.name, &existing.annotations).as_ref() != Some(origin) {
            return Err(WriteError::NotReplica(key.clone()));
        }
        objects.remove(key);
        Ok(())
    }
}
