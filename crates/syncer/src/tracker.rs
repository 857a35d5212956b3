//! Namespace label tracking

use crate::engine::ReplicationEngine;
use async_trait::async_trait;
use informer::{EventSink, SinkError};
use k8s_openapi::api::core::v1::Namespace;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Current namespaces and their labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSnapshot {
    labels: BTreeMap<String, BTreeMap<String, String>>,
}

impl NamespaceSnapshot {
    /// Records `name` with `labels`. Returns true when anything changed.
    pub fn upsert(&mut self, name: &str, labels: &BTreeMap<String, String>) -> bool {
        match self.labels.get(name) {
            Some(current) if current == labels => false,
            _ => {
                self.labels.insert(name.to_string(), labels.clone());
                true
            }
        }
    }

    /// Forgets `name`. Returns true when it was known.
    pub fn remove(&mut self, name: &str) -> bool {
        self.labels.remove(name).is_some()
    }

    /// Whether `name` is a known namespace.
    pub fn contains(&self, name: &str) -> bool {
        self.labels.contains_key(name)
    }

    /// Labels of `name`, if known.
    pub fn labels(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.labels.get(name)
    }

    /// Known namespace names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.labels.keys().map(String::as_str)
    }

    /// Number of known namespaces.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when no namespace is known.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Feeds Namespace events into the replication engine.
///
/// Each handler returns only after the engine has finished reacting to the
/// namespace, so the next Namespace event sees the updated snapshot.
#[derive(Debug, Clone)]
pub struct NamespaceTracker {
    engine: Arc<ReplicationEngine>,
}

impl NamespaceTracker {
    /// Creates a tracker for `engine`.
    pub fn new(engine: Arc<ReplicationEngine>) -> Self {
        Self { engine }
    }

    /// Current label snapshot.
    pub fn snapshot(&self) -> NamespaceSnapshot {
        self.engine.namespaces()
    }
}

fn name_and_labels(ns: &Namespace) -> (String, BTreeMap<String, String>) {
    (
        ns.metadata.name.clone().unwrap_or_default(),
        ns.metadata.labels.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl EventSink<Namespace> for NamespaceTracker {
    fn name(&self) -> &'static str {
        "namespace-tracker"
    }

    async fn on_add(&self, obj: &Namespace) -> Result<(), SinkError> {
        let (name, labels) = name_and_labels(obj);
        self.engine.on_namespace_upsert(&name, &labels).await;
        Ok(())
    }

    async fn on_update(&self, _old: &Namespace, new: &Namespace) -> Result<(), SinkError> {
        let (name, labels) = name_and_labels(new);
        self.engine.on_namespace_upsert(&name, &labels).await;
        Ok(())
    }

    async fn on_delete(&self, obj: &Namespace) -> Result<(), SinkError> {
        let (name, _) = name_and_labels(obj);
        self.engine.on_namespace_delete(&name);
        Ok(())
    }

    async fn on_synced(&self) -> Result<(), SinkError> {
        self.engine.on_namespaces_synced().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_snapshot_tracks_label_changes() {
        let mut snapshot = NamespaceSnapshot::default();

        assert!(snapshot.upsert("team-a", &labels(&[("app", "A")])));
        assert!(!snapshot.upsert("team-a", &labels(&[("app", "A")])));
        assert!(snapshot.upsert("team-a", &labels(&[("app", "B")])));
        assert_eq!(
            snapshot.labels("team-a").and_then(|l| l.get("app")).map(String::as_str),
            Some("B")
        );

        snapshot.upsert("default", &labels(&[]));
        assert_eq!(snapshot.names().collect::<Vec<_>>(), vec!["default", "team-a"]);

        assert!(snapshot.remove("team-a"));
        assert!(!snapshot.remove("team-a"));
        assert!(!snapshot.contains("team-a"));
        assert_eq!(snapshot.len(), 1);
    }
}
