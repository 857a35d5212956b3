//! Search index contract, the sink feeding it, and an in-memory backend.

use crate::snapshot::Snapshot;
use async_trait::async_trait;
use informer::{EventSink, SinkError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Backend that indexes the current state of watched objects.
///
/// Objects arrive as JSON snapshots, already redacted.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Index a new object.
    async fn handle_add(&self, obj: &Value) -> Result<(), SinkError>;

    /// Replace the indexed copy of an object.
    async fn handle_update(&self, old: &Value, new: &Value) -> Result<(), SinkError>;

    /// Drop an object from the index.
    async fn handle_delete(&self, obj: &Value) -> Result<(), SinkError>;
}

/// Routes one kind's events into a [`SearchIndex`].
pub struct SearchIndexSink<K> {
    index: Arc<dyn SearchIndex>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> SearchIndexSink<K> {
    /// Creates a sink writing to `index`.
    pub fn new(index: Arc<dyn SearchIndex>) -> Self {
        Self {
            index,
            _kind: PhantomData,
        }
    }
}

impl<K> std::fmt::Debug for SearchIndexSink<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndexSink").finish_non_exhaustive()
    }
}

#[async_trait]
impl<K: Snapshot> EventSink<K> for SearchIndexSink<K> {
    fn name(&self) -> &'static str {
        "search-index"
    }

    async fn on_add(&self, obj: &K) -> Result<(), SinkError> {
        let doc = serde_json::to_value(obj.redacted())?;
        self.index.handle_add(&doc).await
    }

    async fn on_update(&self, old: &K, new: &K) -> Result<(), SinkError> {
        let old = serde_json::to_value(old.redacted())?;
        let new = serde_json::to_value(new.redacted())?;
        self.index.handle_update(&old, &new).await
    }

    async fn on_delete(&self, obj: &K) -> Result<(), SinkError> {
        let doc = serde_json::to_value(obj.redacted())?;
        self.index.handle_delete(&doc).await
    }
}

/// Index key: kind, namespace (empty for cluster scoped), name.
pub type DocumentKey = (String, String, String);

/// Search index kept in process memory.
#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    documents: RwLock<BTreeMap<DocumentKey, Value>>,
}

impl MemorySearchIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexed copy of one object.
    pub fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> Option<Value> {
        let key = (
            kind.to_string(),
            namespace.unwrap_or_default().to_string(),
            name.to_string(),
        );
        self.read().get(&key).cloned()
    }

    /// Number of indexed objects.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Keys of every document whose JSON rendering contains `needle`.
    pub fn search(&self, needle: &str) -> Vec<DocumentKey> {
        self.read()
            .iter()
            .filter(|(_, doc)| doc.to_string().contains(needle))
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<DocumentKey, Value>> {
        self.documents.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<DocumentKey, Value>> {
        self.documents.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn document_key(obj: &Value) -> Result<DocumentKey, SinkError> {
    let field = |path: &str| obj.pointer(path).and_then(Value::as_str).unwrap_or_default();

    let kind = field("/kind");
    let name = field("/metadata/name");
    if kind.is_empty() || name.is_empty() {
        return Err(SinkError::Backend {
            sink: "search-index",
            message: "document has no kind or name".to_string(),
        });
    }
    Ok((kind.to_string(), field("/metadata/namespace").to_string(), name.to_string()))
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn handle_add(&self, obj: &Value) -> Result<(), SinkError> {
        let key = document_key(obj)?;
        debug!(kind = %key.0, namespace = %key.1, name = %key.2, "Indexing document");
        self.write().insert(key, obj.clone());
        Ok(())
    }

    async fn handle_update(&self, _old: &Value, new: &Value) -> Result<(), SinkError> {
        let key = document_key(new)?;
        self.write().insert(key, new.clone());
        Ok(())
    }

    async fn handle_delete(&self, obj: &Value) -> Result<(), SinkError> {
        let key = document_key(obj)?;
        debug!(kind = %key.0, namespace = %key.1, name = %key.2, "Removing document");
        self.write().remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::REDACTED;
    use k8s_openapi::ByteString;
    use k8s_openapi::api::core::v1::{Namespace, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn secret(value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("api-token".to_string()),
                namespace: Some("payments".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(
                "token".to_string(),
                ByteString(value.as_bytes().to_vec()),
            )])),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_secret_values_never_reach_the_index() {
        let index = Arc::new(MemorySearchIndex::new());
        let sink = SearchIndexSink::<Secret>::new(index.clone());

        sink.on_add(&secret("s3cr3t-value")).await.unwrap();
        sink.on_update(&secret("s3cr3t-value"), &secret("rotated-value"))
            .await
            .unwrap();

        assert_eq!(index.len(), 1);
        assert!(index.search("s3cr3t").is_empty());
        assert!(index.search("rotated").is_empty());
        assert_eq!(index.search("api-token").len(), 1);

        let doc = index.get("Secret", Some("payments"), "api-token").unwrap();
        let token = doc.pointer("/data/token").and_then(Value::as_str).unwrap();
        // ByteString serializes as base64 of the placeholder
        assert_eq!(REDACTED, "-----");
        assert_eq!(token, "LS0tLS0=");
        assert!(!doc.to_string().contains("cm90YXRlZC12YWx1ZQ"));
    }

    #[tokio::test]
    async fn test_delete_removes_document() {
        let index = Arc::new(MemorySearchIndex::new());
        let sink = SearchIndexSink::<Namespace>::new(index.clone());
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("team-a".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        sink.on_add(&ns).await.unwrap();
        assert!(index.get("Namespace", None, "team-a").is_some());

        sink.on_delete(&ns).await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_document_without_name_is_rejected() {
        let index = MemorySearchIndex::new();
        let result = index.handle_add(&serde_json::json!({ "kind": "Secret" })).await;

        assert!(matches!(result, Err(SinkError::Backend { .. })));
        assert!(index.is_empty());
    }
}
