//! DormantDatabase CRD
//!
//! Left behind by KubeDB when a database object is deleted without wiping its
//! data. The `origin` block keeps the deleted database's metadata and spec so it
//! can be resumed later.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubedb.com",
    version = "v1alpha1",
    kind = "DormantDatabase",
    namespaced,
    status = "DormantDatabaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseSpec {
    /// Snapshot of the deleted database object
    pub origin: Origin,

    /// Delete the database data when the DormantDatabase is deleted
    #[serde(default)]
    pub wipe_out: bool,

    /// Recreate the original database from `origin`
    #[serde(default)]
    pub resume: bool,
}

/// Metadata and spec of the database a DormantDatabase was created from.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// Name of the original database object
    #[serde(default)]
    pub name: String,

    /// Labels of the original database object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations of the original database object
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Spec of the original database, kept verbatim (engine specific)
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DormantDatabaseStatus {
    /// Phase reported by KubeDB ("Pausing", "Paused", "WipingOut", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,

    /// Human readable reason for the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the database was paused
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_time: Option<chrono::DateTime<chrono::Utc>>,
}
