//! Local object cache turning raw watch events into typed notifications.
//!
//! The watch stream only says "this object now looks like X". Sinks want to
//! know whether X is new, what it looked like before, and which objects
//! disappeared while the watch was re-listing. `ObjectCache` keeps the last
//! seen typed copy of every object to answer those questions.

use crate::identity::object_key;
use crate::sink::WatchedResource;
use kube::api::DynamicObject;
use kube_runtime::watcher;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, error, info};

/// A typed lifecycle event ready for dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    /// First sighting of an object
    Added(K),
    /// Object changed; `old == new` for resync redeliveries
    Updated {
        /// Previously cached copy
        old: K,
        /// Current copy
        new: K,
    },
    /// Object removed; carries its last known state
    Deleted(K),
    /// The first complete list has been delivered
    Synced,
}

/// Typed cache of every object of one kind.
#[derive(Debug)]
pub struct ObjectCache<K> {
    kind: String,
    objects: BTreeMap<String, K>,
    // keys seen since the current re-list started
    relist: Option<HashSet<String>>,
    synced: bool,
}

impl<K: WatchedResource> ObjectCache<K> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            objects: BTreeMap::new(),
            relist: None,
            synced: false,
        }
    }

    /// Number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether the first complete list has been seen.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Folds one watch event into the cache.
    ///
    /// Payloads that do not deserialize into `K` are logged and dropped.
    pub fn apply(&mut self, event: watcher::Event<DynamicObject>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Init => {
                debug!("{} watcher (re)listing", self.kind);
                self.relist = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let key = object_key(&obj.metadata);
                if let Some(seen) = self.relist.as_mut() {
                    seen.insert(key);
                }
                self.upsert(&obj).into_iter().collect()
            }
            watcher::Event::Apply(obj) => self.upsert(&obj).into_iter().collect(),
            watcher::Event::Delete(obj) => self.remove(&obj).into_iter().collect(),
            watcher::Event::InitDone => self.finish_relist(),
        }
    }

    /// Redelivers every cached object as an unchanged update.
    pub fn resync(&self) -> Vec<Notification<K>> {
        self.objects
            .values()
            .map(|obj| Notification::Updated {
                old: obj.clone(),
                new: obj.clone(),
            })
            .collect()
    }

    fn upsert(&mut self, obj: &DynamicObject) -> Option<Notification<K>> {
        let key = object_key(&obj.metadata);
        let typed = match cast::<K>(obj) {
            Ok(typed) => typed,
            Err(e) => {
                error!("Invalid {} object {}: {}", self.kind, key, e);
                return None;
            }
        };

        match self.objects.insert(key, typed.clone()) {
            Some(old) => Some(Notification::Updated { old, new: typed }),
            None => Some(Notification::Added(typed)),
        }
    }

    fn remove(&mut self, obj: &DynamicObject) -> Option<Notification<K>> {
        let key = object_key(&obj.metadata);
        let cached = self.objects.remove(&key);

        match cast::<K>(obj) {
            Ok(last) => Some(Notification::Deleted(last)),
            Err(e) => match cached {
                Some(last) => {
                    debug!("Using cached copy of deleted {} {}: {}", self.kind, key, e);
                    Some(Notification::Deleted(last))
                }
                None => {
                    error!("Invalid {} object {}: {}", self.kind, key, e);
                    None
                }
            },
        }
    }

    fn finish_relist(&mut self) -> Vec<Notification<K>> {
        let mut out = Vec::new();

        if let Some(seen) = self.relist.take() {
            let vanished: Vec<String> = self
                .objects
                .keys()
                .filter(|key| !seen.contains(*key))
                .cloned()
                .collect();
            for key in vanished {
                if let Some(last) = self.objects.remove(&key) {
                    debug!("{} {} vanished while re-listing", self.kind, key);
                    out.push(Notification::Deleted(last));
                }
            }
        }

        if !self.synced {
            self.synced = true;
            info!("{} watcher initialization complete ({} objects)", self.kind, self.objects.len());
            out.push(Notification::Synced);
        }

        out
    }
}

impl<K: WatchedResource> Default for ObjectCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts an untyped object into the routed kind.
fn cast<K: WatchedResource>(obj: &DynamicObject) -> Result<K, serde_json::Error> {
    serde_json::to_value(obj).and_then(serde_json::from_value)
}
