//! Annotation keys that control replication

use crate::error::SelectorError;
use crate::selector::parse_selector;
use kube::core::{Selector, SelectorExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// `"true"` turns replication on for the annotated object.
pub const SYNC_ANNOTATION: &str = "kubed.appscode.com/sync";

/// Label selector narrowing the target namespaces; empty or absent means all.
pub const SYNC_SELECTOR_ANNOTATION: &str = "kubed.appscode.com/sync-selector";

/// Set on every replica; JSON `{"namespace": .., "name": ..}` of its source.
pub const ORIGIN_ANNOTATION: &str = "kubed.appscode.com/origin";

/// Describes the source manifest, not the replica.
const LAST_APPLIED_ANNOTATION: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Source of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Origin {
    /// Namespace of the source object
    pub namespace: String,
    /// Name of the source object (and of every replica)
    pub name: String,
}

impl Origin {
    /// Reads the origin annotation. Returns `None` when absent or unparsable.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Option<Self> {
        let raw = annotations.get(ORIGIN_ANNOTATION)?;
        match serde_json::from_str(raw) {
            Ok(origin) => Some(origin),
            Err(e) => {
                warn!("Ignoring malformed {} annotation {:?}: {}", ORIGIN_ANNOTATION, raw, e);
                None
            }
        }
    }

    /// Origin of the object `namespace/name` when it is a replica: the
    /// annotation must name an object of the same name in another namespace.
    pub fn of_replica(namespace: &str, name: &str, annotations: &BTreeMap<String, String>) -> Option<Self> {
        Self::from_annotations(annotations).filter(|o| o.name == name && o.namespace != namespace)
    }

    /// Value for the origin annotation.
    pub fn to_annotation(&self) -> String {
        // two string fields cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Replication settings read from an object's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSettings {
    /// No replication; replicas elsewhere must go
    Disabled,
    /// Replicate into namespaces matching the selector
    Enabled(Selector),
    /// Replication requested but the selector does not parse; matches nothing
    InvalidSelector(SelectorError),
}

impl SyncSettings {
    /// Reads the sync flag and selector annotations.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Self {
        match annotations.get(SYNC_ANNOTATION).map(String::as_str) {
            Some("true") => {}
            None | Some("false") => return Self::Disabled,
            Some(other) => {
                warn!("Unrecognized {} value {:?}, treating as disabled", SYNC_ANNOTATION, other);
                return Self::Disabled;
            }
        }

        let raw = annotations
            .get(SYNC_SELECTOR_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default();
        match parse_selector(raw) {
            Ok(selector) => Self::Enabled(selector),
            Err(e) => {
                warn!("Invalid {} {:?}: {}; no namespace will match", SYNC_SELECTOR_ANNOTATION, raw, e);
                Self::InvalidSelector(e)
            }
        }
    }

    /// Whether a source with these settings is replicated at all.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }

    /// Whether a namespace with `labels` should hold a replica.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Enabled(selector) => selector.matches(labels),
            Self::Disabled | Self::InvalidSelector(_) => false,
        }
    }
}

/// Annotations a replica carries: the source's minus the sync controls,
/// plus the origin annotation.
pub fn replica_annotations(
    source: &BTreeMap<String, String>,
    origin: &Origin,
) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = source
        .iter()
        .filter(|(key, _)| !is_control_key(key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    out.insert(ORIGIN_ANNOTATION.to_string(), origin.to_annotation());
    out
}

fn is_control_key(key: &str) -> bool {
    matches!(
        key,
        SYNC_ANNOTATION | SYNC_SELECTOR_ANNOTATION | ORIGIN_ANNOTATION | LAST_APPLIED_ANNOTATION
    )
}
