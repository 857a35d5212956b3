//! Per-kind list+watch loop under a supervisor.
//!
//! `Router::run` resolves the kind against the API surface, then keeps a watch
//! loop alive until shutdown. A loop that panics or whose stream ends is logged
//! and restarted from a fresh list. The object cache outlives the loop, so the
//! re-list reports objects removed while no watch was running as deletes.

use crate::cache::ObjectCache;
use crate::discovery::ApiSurface;
use crate::dispatch::Dispatcher;
use crate::error::RouterError;
use crate::sink::{EventSink, WatchedResource};
use futures::StreamExt;
use futures::stream::BoxStream;
use kube::api::DynamicObject;
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause before a crashed watch loop is restarted.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Raw watch events for one kind, starting with a full list.
pub type EventStream = BoxStream<'static, Result<watcher::Event<DynamicObject>, watcher::Error>>;

/// Watches one kind and dispatches its events to the registered sinks.
pub struct Router<K: WatchedResource> {
    client: Client,
    dispatcher: Arc<Dispatcher<K>>,
    resync_period: Duration,
    shutdown: CancellationToken,
}

impl<K: WatchedResource> Router<K> {
    /// Creates a router. Sinks are called in the order given.
    pub fn new(
        client: Client,
        sinks: Vec<Arc<dyn EventSink<K>>>,
        resync_period: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            dispatcher: Arc::new(Dispatcher::new(sinks)),
            resync_period,
            shutdown,
        }
    }

    /// Blocks until shutdown. Intended to be spawned as its own task.
    ///
    /// Returns immediately, without error, when the cluster does not serve the
    /// kind or no sink is registered.
    pub async fn run(self, surface: &ApiSurface) -> Result<(), RouterError> {
        let Some(resource) = surface.resolve::<K>() else {
            warn!(
                "Skipping watching non-preferred GroupVersion:{} Kind:{}",
                K::api_version(&()),
                K::kind(&())
            );
            return Ok(());
        };

        if self.dispatcher.is_empty() {
            info!("No sinks registered for {}, not watching", self.dispatcher.kind());
            return Ok(());
        }

        info!(
            "Starting {} watcher (sinks: {:?}, resync every {:?})",
            self.dispatcher.kind(),
            self.dispatcher.sink_names(),
            self.resync_period
        );
        let client = self.client;
        let open = move || -> EventStream {
            let api: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
            watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed()
        };
        supervise(
            self.dispatcher,
            open,
            self.resync_period,
            RESTART_DELAY,
            self.shutdown,
        )
        .await
    }
}

/// Runs watch loops over streams from `open` until shutdown, restarting after
/// `restart_delay` whenever one panics or its stream ends.
async fn supervise<K, F>(
    dispatcher: Arc<Dispatcher<K>>,
    open: F,
    resync_period: Duration,
    restart_delay: Duration,
    shutdown: CancellationToken,
) -> Result<(), RouterError>
where
    K: WatchedResource,
    F: Fn() -> EventStream,
{
    let kind = dispatcher.kind().to_string();
    let cache = Arc::new(Mutex::new(ObjectCache::<K>::new()));

    loop {
        let task = tokio::spawn(watch_loop(
            open(),
            cache.clone(),
            dispatcher.clone(),
            resync_period,
            shutdown.clone(),
        ));

        match task.await {
            Ok(Ok(())) => {
                info!("{} watcher stopped", kind);
                return Ok(());
            }
            Ok(Err(e)) => error!("{} watcher failed: {}, restarting with a fresh list", kind, e),
            Err(e) if e.is_panic() => {
                error!("{} watcher panicked: {}, restarting with a fresh list", kind, e);
            }
            Err(_) => return Err(RouterError::Aborted(kind)),
        }

        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            () = tokio::time::sleep(restart_delay) => {}
        }
    }
}

async fn watch_loop<K: WatchedResource>(
    mut stream: EventStream,
    cache: Arc<Mutex<ObjectCache<K>>>,
    dispatcher: Arc<Dispatcher<K>>,
    resync_period: Duration,
    shutdown: CancellationToken,
) -> Result<(), RouterError> {
    let mut resync = tokio::time::interval_at(Instant::now() + resync_period, resync_period);
    resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            _ = resync.tick() => {
                let notifications = cache.lock().await.resync();
                for notification in notifications {
                    dispatcher.dispatch(&notification).await;
                }
            }
            event = stream.next() => match event {
                Some(Ok(event)) => {
                    let notifications = cache.lock().await.apply(event);
                    for notification in notifications {
                        dispatcher.dispatch(&notification).await;
                    }
                }
                // the stream backs off and re-establishes the watch by itself
                Some(Err(e)) => warn!("{} watch error: {}", dispatcher.kind(), e),
                None => return Err(RouterError::StreamEnded(dispatcher.kind().to_string())),
            },
        }
    }
}

impl<K: WatchedResource> std::fmt::Debug for Router<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("dispatcher", &self.dispatcher)
            .field("resync_period", &self.resync_period)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SinkError;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::ResourceExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Records calls as `what:name`; panics on the first add of "explode".
    struct RecordingSink {
        calls: Arc<StdMutex<Vec<String>>>,
    }

    impl RecordingSink {
        fn record(&self, what: &str, obj: &ConfigMap) {
            self.calls.lock().unwrap().push(format!("{}:{}", what, obj.name_any()));
        }
    }

    #[async_trait::async_trait]
    impl EventSink<ConfigMap> for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn on_add(&self, obj: &ConfigMap) -> Result<(), SinkError> {
            self.record("add", obj);
            if obj.name_any() == "explode" {
                panic!("sink blew up on {}", obj.name_any());
            }
            Ok(())
        }

        async fn on_update(&self, _old: &ConfigMap, new: &ConfigMap) -> Result<(), SinkError> {
            self.record("update", new);
            Ok(())
        }

        async fn on_delete(&self, obj: &ConfigMap) -> Result<(), SinkError> {
            self.record("delete", obj);
            Ok(())
        }
    }

    fn object(name: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default" },
            "data": { "key": name }
        }))
        .unwrap()
    }

    fn listing(names: &[&str]) -> Vec<watcher::Event<DynamicObject>> {
        let mut events = vec![watcher::Event::Init];
        events.extend(names.iter().map(|name| watcher::Event::InitApply(object(name))));
        events.push(watcher::Event::InitDone);
        events
    }

    /// Hands out one scripted stream per watch loop. A script ending in
    /// `None` closes the stream; otherwise it stays open. Once the scripts run
    /// out, streams stay open and empty.
    struct Scripted {
        scripts: StdMutex<VecDeque<(Vec<watcher::Event<DynamicObject>>, bool)>>,
        opened: StdMutex<usize>,
    }

    impl Scripted {
        fn new(scripts: Vec<(Vec<watcher::Event<DynamicObject>>, bool)>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into()),
                opened: StdMutex::new(0),
            })
        }

        fn open(&self) -> EventStream {
            *self.opened.lock().unwrap() += 1;
            let (events, closes) = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
            let events = futures::stream::iter(events.into_iter().map(Ok));
            if closes {
                events.boxed()
            } else {
                events.chain(futures::stream::pending()).boxed()
            }
        }

        fn opened(&self) -> usize {
            *self.opened.lock().unwrap()
        }
    }

    async fn run_until(scripted: Arc<Scripted>, expected: &str) -> (Vec<String>, usize) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let sink: Arc<dyn EventSink<ConfigMap>> = Arc::new(RecordingSink { calls: calls.clone() });
        let dispatcher = Arc::new(Dispatcher::new(vec![sink]));
        let shutdown = CancellationToken::new();

        let open = {
            let scripted = scripted.clone();
            move || scripted.open()
        };
        let task = tokio::spawn(supervise(
            dispatcher,
            open,
            Duration::from_secs(3600),
            Duration::ZERO,
            shutdown.clone(),
        ));

        for _ in 0..200 {
            if calls.lock().unwrap().iter().any(|c| c == expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown.cancel();
        task.await.unwrap().unwrap();

        let calls = calls.lock().unwrap().clone();
        (calls, scripted.opened())
    }

    #[tokio::test]
    async fn test_panicking_sink_restarts_watch_loop() {
        let scripted = Scripted::new(vec![
            (listing(&["keep", "explode"]), false),
            (listing(&["keep"]), false),
        ]);

        let (calls, opened) = run_until(scripted, "delete:explode").await;

        assert_eq!(opened, 2);
        assert_eq!(
            calls,
            vec!["add:keep", "add:explode", "update:keep", "delete:explode"]
        );
    }

    #[tokio::test]
    async fn test_ended_stream_relists_and_reports_vanished_objects() {
        let scripted = Scripted::new(vec![
            (listing(&["a", "b"]), true),
            (listing(&["a"]), false),
        ]);

        let (calls, opened) = run_until(scripted, "delete:b").await;

        assert_eq!(opened, 2);
        assert_eq!(calls, vec!["add:a", "add:b", "update:a", "delete:b"]);
    }
}
