//! ClusterAlert CRD
//!
//! Namespaced health checks owned by the Searchlight operator. kubed only
//! observes these objects; it never writes them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[kube(
    group = "monitoring.appscode.com",
    version = "v1alpha1",
    kind = "ClusterAlert",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAlertSpec {
    /// Icinga check command (e.g. "node-status", "ca-cert")
    pub check: String,

    /// How often the check runs (e.g. "1m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<String>,

    /// Minimum interval between two notifications for the same alert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert_interval: Option<String>,

    /// Check-specific variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, String>,

    /// Secret holding notifier credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifier_secret_name: Option<String>,

    /// Notification receivers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub receivers: Vec<Receiver>,

    /// Pause notifications without deleting the alert
    #[serde(default)]
    pub paused: bool,
}

/// A notification target for an alert state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Receiver {
    /// Alert state this receiver cares about ("Warning", "Critical")
    pub state: String,

    /// Notifier name (e.g. "Mailgun", "Slack")
    pub notifier: String,

    /// Recipients understood by the notifier
    #[serde(default)]
    pub to: Vec<String>,
}
