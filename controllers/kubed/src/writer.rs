//! Replica writes against the API server.
//!
//! A replica is replaced wholesale so it ends up holding exactly the source's
//! content, including the removal of keys the source no longer has. Objects
//! without a valid origin annotation are never replaced or deleted, and
//! deletes carry uid and resourceVersion preconditions so an object swapped
//! in after the ownership check survives.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, PostParams, Preconditions};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde_json::Value;
use syncer::{ObjectKey, Origin, Replica, ReplicaWriter, SyncKind, WriteError};
use tracing::debug;

/// Type the API server assumes for a Secret without one.
const DEFAULT_SECRET_TYPE: &str = "Opaque";

/// [`ReplicaWriter`] backed by a Kubernetes client.
#[derive(Clone)]
pub struct KubeReplicaWriter {
    client: Client,
}

impl std::fmt::Debug for KubeReplicaWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeReplicaWriter").finish_non_exhaustive()
    }
}

impl KubeReplicaWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        let resource = match key.kind {
            SyncKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            SyncKind::Secret => ApiResource::erase::<Secret>(&()),
        };
        Api::namespaced_with(self.client.clone(), &key.namespace, &resource)
    }
}

/// Origin of `obj` when it is a replica living at `key`.
fn replica_origin(key: &ObjectKey, obj: &DynamicObject) -> Option<Origin> {
    Origin::of_replica(&key.namespace, &key.name, obj.annotations())
}

fn secret_type(obj: &DynamicObject) -> &str {
    obj.data
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_SECRET_TYPE)
}

/// Secret `type` is immutable; changing it takes a delete and a create.
fn type_changed(key: &ObjectKey, existing: &DynamicObject, desired: &DynamicObject) -> bool {
    key.kind == SyncKind::Secret && secret_type(existing) != secret_type(desired)
}

/// Delete only the exact object that was inspected.
fn guarded_delete(existing: &DynamicObject) -> DeleteParams {
    DeleteParams {
        preconditions: Some(Preconditions {
            uid: existing.metadata.uid.clone(),
            resource_version: existing.metadata.resource_version.clone(),
        }),
        ..Default::default()
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(status) if status.code == 404)
}

#[async_trait]
impl ReplicaWriter for KubeReplicaWriter {
    async fn apply(&self, replica: &Replica) -> Result<(), WriteError> {
        let key = &replica.key;
        let api = self.api(key);
        let mut obj: DynamicObject = serde_json::from_value(replica.to_manifest())?;

        let Some(existing) = api.get_opt(&key.name).await? else {
            debug!("Creating {}", key);
            api.create(&PostParams::default(), &obj).await?;
            return Ok(());
        };
        if replica_origin(key, &existing).is_none() {
            return Err(WriteError::NotReplica(key.clone()));
        }

        if type_changed(key, &existing, &obj) {
            debug!(
                "Recreating {}: type {} -> {}",
                key,
                secret_type(&existing),
                secret_type(&obj)
            );
            match api.delete(&key.name, &guarded_delete(&existing)).await {
                Ok(_) => {}
                Err(e) if is_not_found(&e) => {}
                Err(e) => return Err(e.into()),
            }
            api.create(&PostParams::default(), &obj).await?;
        } else {
            debug!("Replacing {}", key);
            obj.metadata.resource_version = existing.metadata.resource_version;
            api.replace(&key.name, &PostParams::default(), &obj).await?;
        }
        Ok(())
    }

    async fn delete(&self, key: &ObjectKey, origin: &Origin) -> Result<(), WriteError> {
        let api = self.api(key);
        let Some(existing) = api.get_opt(&key.name).await? else {
            return Ok(());
        };
        if replica_origin(key, &existing).as_ref() != Some(origin) {
            return Err(WriteError::NotReplica(key.clone()));
        }

        match api.delete(&key.name, &guarded_delete(&existing)).await {
            Ok(_) => {
                debug!("Deleted {}", key);
                Ok(())
            }
            // already gone
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
