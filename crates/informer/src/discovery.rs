//! Checks which kinds the cluster actually serves.
//!
//! Each API group is discovered on its own, so an unavailable aggregated
//! group (a broken metrics server, an uninstalled operator) only disables
//! the kinds of that group.

use kube::Client;
use kube::Resource;
use kube::discovery::{self, ApiResource};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Preferred resources of the API groups the daemon watches, taken once at
/// startup.
#[derive(Debug, Clone, Default)]
pub struct ApiSurface {
    // (group, kind) -> resource at the group's preferred version
    resources: BTreeMap<(String, String), ApiResource>,
}

impl ApiSurface {
    /// Discovers `groups` (`""` is the core group). Groups that fail
    /// discovery are logged and left out.
    pub async fn discover(client: &Client, groups: &[&str]) -> Self {
        let mut resources = Vec::new();
        for name in groups {
            match discovery::group(client, name).await {
                Ok(group) => {
                    debug!(
                        "API group {:?} served at {}",
                        name,
                        group.preferred_version_or_latest()
                    );
                    resources.extend(group.recommended_resources().into_iter().map(|(ar, _caps)| ar));
                }
                Err(e) => warn!("API group {:?} is not served, its kinds will not be watched: {}", name, e),
            }
        }

        let surface = Self::from_resources(resources);
        info!("API discovery complete ({} kinds)", surface.resources.len());
        surface
    }

    /// Surface serving exactly `resources`.
    pub fn from_resources(resources: impl IntoIterator<Item = ApiResource>) -> Self {
        Self {
            resources: resources
                .into_iter()
                .map(|ar| ((ar.group.clone(), ar.kind.clone()), ar))
                .collect(),
        }
    }

    /// Resolves `K` to the resource to watch.
    ///
    /// Returns `None` unless the kind's group is served and its preferred
    /// version is the one `K` was compiled against.
    pub fn resolve<K>(&self) -> Option<ApiResource>
    where
        K: Resource<DynamicType = ()>,
    {
        let (group, version, kind) = (K::group(&()), K::version(&()), K::kind(&()));

        let Some(served) = self.resources.get(&(group.to_string(), kind.to_string())) else {
            debug!("{} is not served", kind);
            return None;
        };
        if served.version != version {
            debug!(
                "{} is served as {} but {} is preferred",
                kind, version, served.version
            );
            return None;
        }
        Some(served.clone())
    }
}
