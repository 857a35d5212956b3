//! Replicable kinds and the engine's view of their objects

use crate::annotations::{Origin, replica_annotations};
use informer::WatchedResource;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Kinds the engine replicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKind {
    /// `v1/ConfigMap`
    ConfigMap,
    /// `v1/Secret`
    Secret,
}

impl SyncKind {
    /// Every replicable kind.
    pub const ALL: [SyncKind; 2] = [SyncKind::ConfigMap, SyncKind::Secret];

    /// Kubernetes kind name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind, namespace and name of a Secret or ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object kind
    pub kind: SyncKind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Builds a key.
    pub fn new(kind: SyncKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl ObjectKey {
    /// Origin recorded on replicas of this object.
    pub fn as_origin(&self) -> Origin {
        Origin {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.kind, self.name, self.namespace)
    }
}

/// Typed kinds that can be replicated.
pub trait Replicable: WatchedResource {
    /// Engine kind for this type.
    const KIND: SyncKind;

    /// Replicated content, without metadata.
    fn payload(&self) -> Value;
}

impl Replicable for Secret {
    const KIND: SyncKind = SyncKind::Secret;

    fn payload(&self) -> Value {
        let mut out = Map::new();
        if let Some(type_) = &self.type_ {
            out.insert("type".to_string(), json!(type_));
        }
        if let Some(data) = &self.data {
            out.insert("data".to_string(), json!(data));
        }
        Value::Object(out)
    }
}

impl Replicable for ConfigMap {
    const KIND: SyncKind = SyncKind::ConfigMap;

    fn payload(&self) -> Value {
        let mut out = Map::new();
        if let Some(data) = &self.data {
            out.insert("data".to_string(), json!(data));
        }
        if let Some(binary_data) = &self.binary_data {
            out.insert("binaryData".to_string(), json!(binary_data));
        }
        Value::Object(out)
    }
}

/// SHA-256 over labels, annotations and payload.
pub fn content_hash(
    labels: &BTreeMap<String, String>,
    annotations: &BTreeMap<String, String>,
    payload: &Value,
) -> String {
    let canonical = json!({
        "labels": labels,
        "annotations": annotations,
        "payload": payload,
    });
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// What the engine keeps of an observed Secret or ConfigMap.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectView {
    /// Identity
    pub key: ObjectKey,
    /// Object labels
    pub labels: BTreeMap<String, String>,
    /// Object annotations
    pub annotations: BTreeMap<String, String>,
    /// Replicated content
    pub payload: Value,
}

impl ObjectView {
    /// View of a typed object.
    pub fn of<K: Replicable>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            key: ObjectKey::new(
                K::KIND,
                meta.namespace.clone().unwrap_or_default(),
                meta.name.clone().unwrap_or_default(),
            ),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
            payload: obj.payload(),
        }
    }

    /// Source of this object when it is a replica.
    ///
    /// An origin annotation naming a different object name, or the object's
    /// own namespace, does not make a replica.
    pub fn origin(&self) -> Option<Origin> {
        Origin::of_replica(&self.key.namespace, &self.key.name, &self.annotations)
    }

    /// Key of the source this replica came from.
    pub fn origin_key(&self) -> Option<ObjectKey> {
        self.origin()
            .map(|o| ObjectKey::new(self.key.kind, o.namespace, o.name))
    }

    /// Hash of what is currently on the cluster.
    pub fn content_hash(&self) -> String {
        content_hash(&self.labels, &self.annotations, &self.payload)
    }
}

/// Replica content derived from one source, independent of target namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaTemplate {
    /// Source identity
    pub source: ObjectKey,
    /// Labels copied from the source
    pub labels: BTreeMap<String, String>,
    /// Source annotations minus sync controls, plus the origin annotation
    pub annotations: BTreeMap<String, String>,
    /// Payload copied from the source
    pub payload: Value,
    /// Hash of the rendered content
    pub hash: String,
}

impl ReplicaTemplate {
    /// Template for replicas of `source`.
    pub fn from_source(source: &ObjectView) -> Self {
        let annotations = replica_annotations(&source.annotations, &source.key.as_origin());
        let hash = content_hash(&source.labels, &annotations, &source.payload);
        Self {
            source: source.key.clone(),
            labels: source.labels.clone(),
            annotations,
            payload: source.payload.clone(),
            hash,
        }
    }

    /// The replica to write into `namespace`.
    pub fn render(&self, namespace: &str) -> Replica {
        Replica {
            key: ObjectKey::new(self.source.kind, namespace, self.source.name.clone()),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            payload: self.payload.clone(),
        }
    }

    /// Whether `observed` already mirrors this template: equal payload, and
    /// every templated label and annotation present with the same value.
    /// Extra metadata added by other tooling is tolerated.
    pub fn is_mirrored_by(&self, observed: &ObjectView) -> bool {
        let superset = |want: &BTreeMap<String, String>, have: &BTreeMap<String, String>| {
            want.iter().all(|(k, v)| have.get(k) == Some(v))
        };
        observed.key.kind == self.source.kind
            && observed.key.name == self.source.name
            && observed.payload == self.payload
            && superset(&self.labels, &observed.labels)
            && superset(&self.annotations, &observed.annotations)
    }
}

/// A replica as handed to a [`ReplicaWriter`](crate::ReplicaWriter).
#[derive(Debug, Clone, PartialEq)]
pub struct Replica {
    /// Target identity
    pub key: ObjectKey,
    /// Labels to set
    pub labels: BTreeMap<String, String>,
    /// Annotations to set
    pub annotations: BTreeMap<String, String>,
    /// Payload fields merged into the top level of the manifest
    pub payload: Value,
}

impl Replica {
    /// Full object manifest, as written to the API server.
    pub fn to_manifest(&self) -> Value {
        let mut manifest = json!({
            "apiVersion": "v1",
            "kind": self.key.kind.as_str(),
            "metadata": {
                "name": self.key.name,
                "namespace": self.key.namespace,
                "labels": self.labels,
                "annotations": self.annotations,
            },
        });
        if let (Some(out), Some(fields)) = (manifest.as_object_mut(), self.payload.as_object()) {
            for (k, v) in fields {
                out.insert(k.clone(), v.clone());
            }
        }
        manifest
    }

    /// How the replica looks once written.
    pub fn view(&self) -> ObjectView {
        ObjectView {
            key: self.key.clone(),
            labels: self.labels.clone(),
            annotations: self.annotations.clone(),
            payload: self.payload.clone(),
        }
    }
}
