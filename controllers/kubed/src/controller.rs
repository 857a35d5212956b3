//! Main controller implementation.
//!
//! Builds the sinks enabled by the configuration, registers them per kind and
//! runs one router per watched kind:
//!
//! | Kind            | Sinks                                            |
//! |-----------------|--------------------------------------------------|
//! | Secret          | search index, recycle bin, config syncer         |
//! | ConfigMap       | search index, recycle bin, config syncer         |
//! | Namespace       | search index, recycle bin, namespace tracker     |
//! | ClusterAlert    | search index, recycle bin                        |
//! | DormantDatabase | search index, recycle bin                        |

use crate::config::ClusterConfig;
use crate::error::ControllerError;
use crate::writer::KubeReplicaWriter;
use crds::{ClusterAlert, DormantDatabase};
use informer::{ApiSurface, EventSink, Router, RouterError, WatchedResource};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::{Client, Resource};
use sinks::{FsRecycleBin, MemorySearchIndex, RecycleBin, RecycleBinSink, SearchIndex, SearchIndexSink, Snapshot};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use syncer::{EngineOptions, NamespaceTracker, Replicable, ReplicationEngine, ReplicationSink};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type RouterHandle = (&'static str, JoinHandle<Result<(), RouterError>>);

/// Sinks shared by every kind, plus the config syncer when enabled.
#[derive(Clone, Default)]
pub struct SinkSet {
    search_index: Option<Arc<dyn SearchIndex>>,
    recycle_bin: Option<Arc<dyn RecycleBin>>,
    handle_updates: bool,
    engine: Option<Arc<ReplicationEngine>>,
}

impl std::fmt::Debug for SinkSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSet")
            .field("search_index", &self.search_index.is_some())
            .field("recycle_bin", &self.recycle_bin.is_some())
            .field("handle_updates", &self.handle_updates)
            .field("config_syncer", &self.engine.is_some())
            .finish()
    }
}

impl SinkSet {
    pub fn new(
        search_index: Option<Arc<dyn SearchIndex>>,
        recycle_bin: Option<Arc<dyn RecycleBin>>,
        handle_updates: bool,
        engine: Option<Arc<ReplicationEngine>>,
    ) -> Self {
        Self {
            search_index,
            recycle_bin,
            handle_updates,
            engine,
        }
    }

    /// Search index and recycle bin, in that order.
    pub fn common<K: Snapshot>(&self) -> Vec<Arc<dyn EventSink<K>>> {
        let mut sinks: Vec<Arc<dyn EventSink<K>>> = Vec::new();
        if let Some(index) = &self.search_index {
            sinks.push(Arc::new(SearchIndexSink::<K>::new(Arc::clone(index))));
        }
        if let Some(bin) = &self.recycle_bin {
            sinks.push(Arc::new(RecycleBinSink::<K>::new(Arc::clone(bin), self.handle_updates)));
        }
        sinks
    }

    /// Common sinks followed by the config syncer.
    pub fn replicated<K: Snapshot + Replicable>(&self) -> Vec<Arc<dyn EventSink<K>>> {
        let mut sinks = self.common::<K>();
        if let Some(engine) = &self.engine {
            sinks.push(Arc::new(ReplicationSink::<K>::new(Arc::clone(engine))));
        }
        sinks
    }

    /// Common sinks followed by the namespace tracker.
    pub fn namespaces(&self) -> Vec<Arc<dyn EventSink<Namespace>>> {
        let mut sinks = self.common::<Namespace>();
        if let Some(engine) = &self.engine {
            sinks.push(Arc::new(NamespaceTracker::new(Arc::clone(engine))));
        }
        sinks
    }
}

/// Main controller for the kubed daemon.
pub struct Controller {
    routers: Vec<RouterHandle>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("routers", &self.routers.iter().map(|(kind, _)| *kind).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Connects to the cluster and starts every router.
    pub async fn new(config: ClusterConfig) -> Result<Self, ControllerError> {
        info!("Initializing kubed");

        let client = Client::try_default().await?;
        let groups = watched_groups();
        let groups: Vec<&str> = groups.iter().map(String::as_str).collect();
        let surface = Arc::new(ApiSurface::discover(&client, &groups).await);
        let shutdown = CancellationToken::new();

        let search_index = config
            .api_server
            .enable_search_index
            .then(|| Arc::new(MemorySearchIndex::new()) as Arc<dyn SearchIndex>);
        let recycle_bin = config
            .recycle_bin
            .as_ref()
            .map(|spec| Arc::new(FsRecycleBin::new(&spec.path)) as Arc<dyn RecycleBin>);
        let handle_updates = config.recycle_bin.as_ref().is_some_and(|spec| spec.handle_updates);
        let engine = config.enable_config_syncer.then(|| {
            Arc::new(ReplicationEngine::new(
                Arc::new(KubeReplicaWriter::new(client.clone())),
                EngineOptions {
                    write_timeout: config.write_timeout(),
                },
                shutdown.clone(),
            ))
        });
        let sinks = SinkSet::new(search_index, recycle_bin, handle_updates, engine);
        info!("Sinks: {:?}", sinks);

        let resync = config.resync_period();
        let spawn = Spawner {
            client,
            surface,
            resync,
            shutdown: shutdown.clone(),
        };
        let routers = vec![
            ("Namespace", spawn.router::<Namespace>(sinks.namespaces())),
            ("Secret", spawn.router::<Secret>(sinks.replicated())),
            ("ConfigMap", spawn.router::<ConfigMap>(sinks.replicated())),
            ("ClusterAlert", spawn.router::<ClusterAlert>(sinks.common())),
            ("DormantDatabase", spawn.router::<DormantDatabase>(sinks.common())),
        ];

        Ok(Self { routers, shutdown })
    }

    /// Runs until SIGINT or until a router fails.
    ///
    /// Routers that end cleanly (kind not served, no sinks) are dropped from
    /// the set; the daemon keeps running on the rest.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("kubed running");

        let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
        let mut outcome = Ok(());
        while !self.routers.is_empty() {
            let finished = tokio::select! {
                signal = &mut ctrl_c => {
                    signal?;
                    info!("Shutdown requested");
                    None
                }
                (result, index, _) = futures::future::select_all(self.routers.iter_mut().map(|(_, handle)| handle)) => {
                    Some((index, result))
                }
            };
            let Some((index, result)) = finished else {
                break;
            };

            let (kind, _) = self.routers.remove(index);
            match result {
                Ok(Ok(())) => info!("{} router finished", kind),
                Ok(Err(e)) => {
                    outcome = Err(ControllerError::Watch(format!("{kind} router error: {e}")));
                    break;
                }
                Err(e) => {
                    outcome = Err(ControllerError::Watch(format!("{kind} router panicked: {e}")));
                    break;
                }
            }
        }

        self.shutdown.cancel();
        for (kind, handle) in self.routers {
            if let Err(e) = handle.await {
                warn!("{} router did not stop cleanly: {}", kind, e);
            }
        }
        info!("kubed stopped");
        outcome
    }
}

/// API groups of every watched kind; `""` is the core group.
fn watched_groups() -> BTreeSet<String> {
    [
        Namespace::group(&()),
        Secret::group(&()),
        ConfigMap::group(&()),
        ClusterAlert::group(&()),
        DormantDatabase::group(&()),
    ]
    .into_iter()
    .map(|group| group.into_owned())
    .collect()
}

struct Spawner {
    client: Client,
    surface: Arc<ApiSurface>,
    resync: Duration,
    shutdown: CancellationToken,
}

impl Spawner {
    fn router<K: WatchedResource>(
        &self,
        sinks: Vec<Arc<dyn EventSink<K>>>,
    ) -> JoinHandle<Result<(), RouterError>> {
        let router = Router::<K>::new(self.client.clone(), sinks, self.resync, self.shutdown.clone());
        let surface = Arc::clone(&self.surface);
        tokio::spawn(async move { router.run(&surface).await })
    }
}
