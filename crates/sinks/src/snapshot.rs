//! Per-kind snapshot rules: which part of an object is its payload, and how
//! to make a copy that is safe to hand out.

use crds::{ClusterAlert, DormantDatabase};
use informer::WatchedResource;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// Replacement for every secret value handed to a sink.
pub const REDACTED: &str = "-----";

/// Written by `kubectl apply`; holds the full manifest, secret values included.
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Kinds the sinks know how to snapshot.
pub trait Snapshot: WatchedResource {
    /// The data or spec portion of the object.
    fn payload(&self) -> Value;

    /// A copy safe to hand to sinks that are not the source of truth.
    fn redacted(&self) -> Self {
        self.clone()
    }
}

impl Snapshot for Secret {
    fn payload(&self) -> Value {
        json!({
            "type": self.type_,
            "data": self.data,
            "stringData": self.string_data,
        })
    }

    fn redacted(&self) -> Self {
        let mut out = self.clone();
        if let Some(data) = out.data.as_mut() {
            for value in data.values_mut() {
                *value = ByteString(REDACTED.as_bytes().to_vec());
            }
        }
        if let Some(data) = out.string_data.as_mut() {
            for value in data.values_mut() {
                *value = REDACTED.to_string();
            }
        }
        if let Some(annotations) = out.metadata.annotations.as_mut() {
            annotations.remove(LAST_APPLIED_ANNOTATION);
        }
        out
    }
}

impl Snapshot for ConfigMap {
    fn payload(&self) -> Value {
        json!({
            "data": self.data,
            "binaryData": self.binary_data,
            "immutable": self.immutable,
        })
    }
}

impl Snapshot for Namespace {
    fn payload(&self) -> Value {
        json!(self.spec)
    }
}

impl Snapshot for ClusterAlert {
    fn payload(&self) -> Value {
        json!(self.spec)
    }
}

impl Snapshot for DormantDatabase {
    fn payload(&self) -> Value {
        json!(self.spec)
    }
}

/// SHA-256 over labels, annotations and payload of one object version.
///
/// Two versions with equal digests differ at most in bookkeeping fields
/// (resource version, managed fields, status).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Digest of `obj`.
    pub fn of<K: Snapshot>(obj: &K) -> Self {
        let meta = obj.meta();
        let canonical = json!({
            "labels": meta.labels,
            "annotations": meta.annotations,
            "payload": obj.payload(),
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    /// True when labels, annotations or payload differ between the versions.
    pub fn changed<K: Snapshot>(old: &K, new: &K) -> bool {
        Self::of(old) != Self::of(new)
    }

    /// Hex form of the digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
