//! Fan-out of notifications to the sinks registered for a kind.

use crate::cache::Notification;
use crate::identity::ObjectIdentity;
use crate::sink::{EventSink, WatchedResource};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Delivers notifications to sinks in registration order.
///
/// A failing sink is logged and skipped; the remaining sinks still see the
/// event.
pub struct Dispatcher<K: WatchedResource> {
    kind: String,
    sinks: Vec<Arc<dyn EventSink<K>>>,
}

impl<K: WatchedResource> Dispatcher<K> {
    /// Creates a dispatcher over `sinks`, called in the given order.
    pub fn new(sinks: Vec<Arc<dyn EventSink<K>>>) -> Self {
        Self {
            kind: K::kind(&()).into_owned(),
            sinks,
        }
    }

    /// Kind this dispatcher routes.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// True when no sink is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Names of the registered sinks, in dispatch order.
    pub fn sink_names(&self) -> Vec<&'static str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Delivers one notification to every sink. Returns the number of sinks
    /// that reported an error.
    pub async fn dispatch(&self, notification: &Notification<K>) -> usize {
        match notification {
            Notification::Added(obj) => info!("{} added", ObjectIdentity::of(obj)),
            Notification::Updated { new, .. } => debug!("{} updated", ObjectIdentity::of(new)),
            Notification::Deleted(obj) => info!("{} deleted", ObjectIdentity::of(obj)),
            Notification::Synced => debug!("{} synced", self.kind),
        }

        let mut failures = 0;
        for sink in &self.sinks {
            let result = match notification {
                Notification::Added(obj) => sink.on_add(obj).await,
                Notification::Updated { old, new } => sink.on_update(old, new).await,
                Notification::Deleted(obj) => sink.on_delete(obj).await,
                Notification::Synced => sink.on_synced().await,
            };
            if let Err(e) = result {
                failures += 1;
                error!("{} sink failed to handle {} event: {}", sink.name(), self.kind, e);
            }
        }
        failures
    }
}

impl<K: WatchedResource> std::fmt::Debug for Dispatcher<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kind", &self.kind)
            .field("sinks", &self.sink_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    /// Records every call it receives, optionally failing each one.
    struct RecordingSink {
        name: &'static str,
        fail: bool,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingSink {
        fn record(&self, what: &str) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push(format!("{}:{}", self.name, what));
            if self.fail {
                Err(SinkError::Backend {
                    sink: self.name,
                    message: "boom".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait::async_trait]
    impl EventSink<ConfigMap> for RecordingSink {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_add(&self, _obj: &ConfigMap) -> Result<(), SinkError> {
            self.record("add")
        }

        async fn on_update(&self, _old: &ConfigMap, _new: &ConfigMap) -> Result<(), SinkError> {
            self.record("update")
        }

        async fn on_delete(&self, _obj: &ConfigMap) -> Result<(), SinkError> {
            self.record("delete")
        }

        async fn on_synced(&self) -> Result<(), SinkError> {
            self.record("synced")
        }
    }

    fn config_map() -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn dispatcher(calls: &Arc<Mutex<Vec<String>>>, first_fails: bool) -> Dispatcher<ConfigMap> {
        Dispatcher::new(vec![
            Arc::new(RecordingSink {
                name: "first",
                fail: first_fails,
                calls: calls.clone(),
            }),
            Arc::new(RecordingSink {
                name: "second",
                fail: false,
                calls: calls.clone(),
            }),
        ])
    }

    #[tokio::test]
    async fn test_dispatch_preserves_registration_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&calls, false);

        let failures = dispatcher.dispatch(&Notification::Added(config_map())).await;

        assert_eq!(failures, 0);
        assert_eq!(*calls.lock().unwrap(), vec!["first:add", "second:add"]);
        assert_eq!(dispatcher.sink_names(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_later_sinks() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = dispatcher(&calls, true);

        let cm = config_map();
        let failures = dispatcher
            .dispatch(&Notification::Updated {
                old: cm.clone(),
                new: cm,
            })
            .await;
        assert_eq!(failures, 1);

        dispatcher.dispatch(&Notification::Synced).await;
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:update", "second:update", "first:synced", "second:synced"]
        );
    }
}
