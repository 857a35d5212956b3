//! Replication engine
//!
//! Keeps replicas of sync-enabled Secrets and ConfigMaps in every namespace
//! their selector matches. All decisions are made from the engine's current
//! view (sources, namespace labels, replicas written or observed, objects that
//! are not replicas), so the outcome does not depend on the order events
//! arrive in.
//!
//! Ownership of a target namespace: for a kind and name, the namespace `n` is
//! owned by the enabled source with the smallest namespace whose selector
//! matches `n`, unless `n` is unknown or already holds an object of that kind
//! and name that is not a replica.
//!
//! Writes are planned while holding the state lock, executed without it,
//! then committed. A write that raced with another event triggers one more
//! planning pass for its family. Failed writes are left for the next resync.

use crate::annotations::SyncSettings;
use crate::error::WriteError;
use crate::object::{ObjectKey, ObjectView, Replica, ReplicaTemplate, SyncKind};
use crate::tracker::NamespaceSnapshot;
use crate::writer::ReplicaWriter;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default bound on a single replica write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Hash recorded for a replica whose last write failed; never matches a template.
const FAILED_WRITE: &str = "";

/// Kind and name shared by a source and all of its replicas.
type Family = (SyncKind, String);

fn family_of(key: &ObjectKey) -> Family {
    (key.kind, key.name.clone())
}

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Bound on every apply or delete call
    pub write_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Writes issued while handling one event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Replicas created or updated
    pub applied: usize,
    /// Replicas removed
    pub deleted: usize,
    /// Writes that failed or timed out
    pub failed: usize,
    /// Writes not attempted because of shutdown
    pub skipped: usize,
}

impl ReconcileReport {
    /// Number of writes attempted.
    pub fn writes(&self) -> usize {
        self.applied + self.deleted + self.failed
    }

    /// True when nothing was written or attempted.
    pub fn is_noop(&self) -> bool {
        self.writes() == 0 && self.skipped == 0
    }
}

#[derive(Debug, Clone)]
struct SourceEntry {
    settings: SyncSettings,
    template: ReplicaTemplate,
}

#[derive(Debug, Clone)]
enum WriteOp {
    Apply {
        source: ObjectKey,
        replica: Replica,
        hash: String,
    },
    Delete {
        source: ObjectKey,
        target: ObjectKey,
    },
}

impl WriteOp {
    fn source(&self) -> &ObjectKey {
        match self {
            Self::Apply { source, .. } | Self::Delete { source, .. } => source,
        }
    }

    fn target(&self) -> &ObjectKey {
        match self {
            Self::Apply { replica, .. } => &replica.key,
            Self::Delete { target, .. } => target,
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    namespaces: NamespaceSnapshot,
    namespaces_synced: bool,
    synced: BTreeSet<SyncKind>,
    // enabled sources: family -> source namespace -> entry
    sources: BTreeMap<Family, BTreeMap<String, SourceEntry>>,
    // family -> source namespace -> target namespace -> hash on the cluster
    replicas: BTreeMap<Family, BTreeMap<String, BTreeMap<String, String>>>,
    // Secrets and ConfigMaps that are not replicas
    originals: HashSet<ObjectKey>,
    // replicas observed before their kind was ready
    pending: BTreeMap<ObjectKey, ObjectView>,
    // held entries looked at by plan_family
    #[cfg(test)]
    held_visits: usize,
}

impl EngineState {
    fn ready(&self, kind: SyncKind) -> bool {
        self.namespaces_synced && self.synced.contains(&kind)
    }

    fn owner(&self, family: &Family, ns: &str) -> Option<&str> {
        let labels = self.namespaces.labels(ns)?;
        if self.originals.contains(&ObjectKey::new(family.0, ns, family.1.as_str())) {
            return None;
        }
        self.sources
            .get(family)?
            .iter()
            .find(|(source_ns, entry)| source_ns.as_str() != ns && entry.settings.selects(labels))
            .map(|(source_ns, _)| source_ns.as_str())
    }

    fn held(&self, family: &Family, source_ns: &str, ns: &str) -> Option<&str> {
        self.replicas
            .get(family)?
            .get(source_ns)?
            .get(ns)
            .map(String::as_str)
    }

    fn record(&mut self, family: &Family, source_ns: &str, ns: &str, hash: String) {
        self.replicas
            .entry(family.clone())
            .or_default()
            .entry(source_ns.to_string())
            .or_default()
            .insert(ns.to_string(), hash);
    }

    fn forget(&mut self, family: &Family, source_ns: &str, ns: &str) {
        let Some(by_source) = self.replicas.get_mut(family) else {
            return;
        };
        if let Some(held) = by_source.get_mut(source_ns) {
            held.remove(ns);
            if held.is_empty() {
                by_source.remove(source_ns);
            }
        }
        if by_source.is_empty() {
            self.replicas.remove(family);
        }
    }

    /// Drops every record of a replica at `ns`, whichever source it came from.
    fn forget_target(&mut self, family: &Family, ns: &str) {
        let holders: Vec<String> = self
            .replicas
            .get(family)
            .map(|by_source| {
                by_source
                    .iter()
                    .filter(|(_, held)| held.contains_key(ns))
                    .map(|(source_ns, _)| source_ns.clone())
                    .collect()
            })
            .unwrap_or_default();
        for source_ns in holders {
            self.forget(family, &source_ns, ns);
        }
    }

    fn families(&self, kind: SyncKind) -> BTreeSet<Family> {
        self.sources
            .keys()
            .chain(self.replicas.keys())
            .filter(|family| family.0 == kind)
            .cloned()
            .collect()
    }

    /// Writes needed to bring one family to its desired state, optionally
    /// restricted to a single target namespace.
    fn plan_family(&mut self, family: &Family, only: Option<&str>) -> Vec<WriteOp> {
        let targets: Vec<String> = match only {
            Some(ns) if self.namespaces.contains(ns) => vec![ns.to_string()],
            Some(_) => Vec::new(),
            None => self.namespaces.names().map(str::to_string).collect(),
        };

        let mut ops = Vec::new();
        if let Some(sources) = self.sources.get(family) {
            for (source_ns, entry) in sources {
                for ns in &targets {
                    if self.owner(family, ns) != Some(source_ns.as_str()) {
                        continue;
                    }
                    if self.held(family, source_ns, ns) != Some(entry.template.hash.as_str()) {
                        ops.push(WriteOp::Apply {
                            source: entry.template.source.clone(),
                            replica: entry.template.render(ns),
                            hash: entry.template.hash.clone(),
                        });
                    }
                }
            }
        }

        let mut stale = Vec::new();
        if let Some(by_source) = self.replicas.get(family) {
            for (source_ns, held) in by_source {
                let targets: Vec<&String> = match only {
                    Some(ns) => held.get_key_value(ns).map(|(ns, _)| ns).into_iter().collect(),
                    None => held.keys().collect(),
                };
                #[cfg(test)]
                {
                    self.held_visits += targets.len();
                }
                for ns in targets {
                    let target = ObjectKey::new(family.0, ns.as_str(), family.1.as_str());
                    match self.owner(family, ns) {
                        Some(owner) if owner == source_ns.as_str() => {}
                        // the owner's apply overwrites it, or it is not ours any more
                        Some(_) => stale.push((source_ns.clone(), ns.clone())),
                        None if !self.namespaces.contains(ns) || self.originals.contains(&target) => {
                            stale.push((source_ns.clone(), ns.clone()));
                        }
                        None => ops.push(WriteOp::Delete {
                            source: ObjectKey::new(family.0, source_ns.as_str(), family.1.as_str()),
                            target,
                        }),
                    }
                }
            }
        }
        for (source_ns, ns) in stale {
            self.forget(family, &source_ns, &ns);
        }

        ops
    }

    fn plan_kind(&mut self, kind: SyncKind, only: Option<&str>) -> Vec<WriteOp> {
        let mut ops = Vec::new();
        for family in self.families(kind) {
            ops.extend(self.plan_family(&family, only));
        }
        ops
    }

    /// Registers an observed replica at whatever hash it actually has.
    /// Returns false when its namespace is not known yet.
    fn observe(&mut self, view: &ObjectView) -> bool {
        let Some(origin) = view.origin_key() else {
            return false;
        };
        let family = family_of(&view.key);
        let ns = view.key.namespace.as_str();
        self.originals.remove(&view.key);
        if !self.namespaces.contains(ns) {
            return false;
        }

        let hash = match self.sources.get(&family).and_then(|s| s.get(&origin.namespace)) {
            Some(entry) if entry.template.is_mirrored_by(view) => entry.template.hash.clone(),
            _ => view.content_hash(),
        };
        self.forget_target(&family, ns);
        self.record(&family, &origin.namespace, ns, hash);
        true
    }

    /// Folds buffered observations of a newly ready kind in and plans every
    /// family of that kind.
    fn catch_up(&mut self, kind: SyncKind) -> Vec<WriteOp> {
        let buffered: Vec<ObjectKey> = self
            .pending
            .keys()
            .filter(|key| key.kind == kind)
            .cloned()
            .collect();
        let count = buffered.len();
        for key in buffered {
            if let Some(view) = self.pending.remove(&key) {
                self.observe(&view);
            }
        }
        let ops = self.plan_kind(kind, None);
        info!(
            "{} replication ready: {} existing replicas found, {} writes planned",
            kind,
            count,
            ops.len()
        );
        ops
    }

    /// The writer found an object at the target that this source does not
    /// own. An apply target becomes an original; either way the record of our
    /// replica there goes. The informer reports the actual object next.
    fn yield_target(&mut self, op: &WriteOp) -> bool {
        let family = family_of(op.target());
        self.forget(&family, &op.source().namespace, &op.target().namespace);
        if let WriteOp::Apply { replica, .. } = op {
            self.originals.insert(replica.key.clone());
        }
        false
    }

    /// Records the outcome of a write. Returns true when the family must be
    /// planned again because the state moved while the write was in flight.
    fn commit(&mut self, op: &WriteOp, ok: bool) -> bool {
        let family = family_of(op.target());
        let source_ns = op.source().namespace.as_str();
        let ns = op.target().namespace.as_str();

        match op {
            WriteOp::Apply { hash, .. } => {
                if !self.namespaces.contains(ns) {
                    return false;
                }
                self.forget_target(&family, ns);
                if !ok {
                    self.record(&family, source_ns, ns, FAILED_WRITE.to_string());
                    return false;
                }
                self.record(&family, source_ns, ns, hash.clone());
                let current = self
                    .sources
                    .get(&family)
                    .and_then(|s| s.get(source_ns))
                    .map(|entry| entry.template.hash.as_str());
                current != Some(hash.as_str()) || self.owner(&family, ns) != Some(source_ns)
            }
            WriteOp::Delete { .. } => {
                if !ok {
                    return false;
                }
                self.forget(&family, source_ns, ns);
                self.owner(&family, ns).is_some()
            }
        }
    }
}

/// Keeps replicas of annotated Secrets and ConfigMaps in sync.
pub struct ReplicationEngine {
    state: Mutex<EngineState>,
    writer: Arc<dyn ReplicaWriter>,
    options: EngineOptions,
    shutdown: CancellationToken,
}

impl ReplicationEngine {
    /// Creates an engine writing through `writer`. Cancelling `shutdown`
    /// aborts in-flight writes and skips the rest.
    pub fn new(writer: Arc<dyn ReplicaWriter>, options: EngineOptions, shutdown: CancellationToken) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            writer,
            options,
            shutdown,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A Secret or ConfigMap was added or updated. Routes replicas to
    /// [`on_replica_observed`](Self::on_replica_observed) and everything else
    /// to [`on_source_upsert`](Self::on_source_upsert).
    pub async fn on_object_upsert(&self, obj: &ObjectView) -> ReconcileReport {
        if obj.origin_key().is_some() {
            self.on_replica_observed(obj).await
        } else {
            self.on_source_upsert(obj).await
        }
    }

    /// A Secret or ConfigMap was deleted.
    pub async fn on_object_delete(&self, obj: &ObjectView) -> ReconcileReport {
        if obj.origin_key().is_some() {
            self.on_replica_deleted(obj).await
        } else {
            self.on_source_delete(&obj.key).await
        }
    }

    /// A non-replica object was added or updated: re-read its sync settings
    /// and reconcile every replica of its kind and name.
    pub async fn on_source_upsert(&self, source: &ObjectView) -> ReconcileReport {
        let family = family_of(&source.key);
        let ops = {
            let mut state = self.lock();
            state.originals.insert(source.key.clone());
            state.pending.remove(&source.key);

            let settings = SyncSettings::from_annotations(&source.annotations);
            let ns = source.key.namespace.clone();
            if settings.is_enabled() {
                let template = ReplicaTemplate::from_source(source);
                let hash = template.hash.clone();
                let entries = state.sources.entry(family.clone()).or_default();
                match entries.insert(ns, SourceEntry { settings, template }) {
                    None => info!("Sync enabled for {}", source.key),
                    Some(previous) if previous.template.hash != hash => {
                        debug!("Sync source {} changed", source.key);
                    }
                    Some(_) => {}
                }
            } else if let Some(entries) = state.sources.get_mut(&family) {
                if entries.remove(&ns).is_some() {
                    info!("Sync disabled for {}", source.key);
                }
                if entries.is_empty() {
                    state.sources.remove(&family);
                }
            }

            if !state.ready(source.key.kind) {
                debug!("{} recorded, waiting for initial sync", source.key);
                return ReconcileReport::default();
            }
            state.plan_family(&family, None)
        };
        self.run(ops).await
    }

    /// A non-replica object was deleted: remove its replicas.
    pub async fn on_source_delete(&self, key: &ObjectKey) -> ReconcileReport {
        let family = family_of(key);
        let ops = {
            let mut state = self.lock();
            state.originals.remove(key);
            state.pending.remove(key);
            if let Some(entries) = state.sources.get_mut(&family) {
                if entries.remove(&key.namespace).is_some() {
                    info!("Sync source {} deleted", key);
                }
                if entries.is_empty() {
                    state.sources.remove(&family);
                }
            }

            if !state.ready(key.kind) {
                return ReconcileReport::default();
            }
            state.plan_family(&family, None)
        };
        self.run(ops).await
    }

    /// An object carrying the origin annotation was added or updated: adopt
    /// it, overwrite it if it drifted, or remove it if nothing owns its
    /// namespace.
    pub async fn on_replica_observed(&self, replica: &ObjectView) -> ReconcileReport {
        if replica.origin_key().is_none() {
            warn!("{} has no usable origin, not handled as a replica", replica.key);
            return ReconcileReport::default();
        }
        let family = family_of(&replica.key);
        let ops = {
            let mut state = self.lock();
            if !state.ready(replica.key.kind) {
                state.originals.remove(&replica.key);
                state.pending.insert(replica.key.clone(), replica.clone());
                return ReconcileReport::default();
            }
            if !state.observe(replica) {
                debug!("{} is in an unknown namespace, deferring to resync", replica.key);
                return ReconcileReport::default();
            }
            state.plan_family(&family, Some(&replica.key.namespace))
        };
        self.run(ops).await
    }

    /// A replica disappeared: recreate it if its namespace should still hold one.
    pub async fn on_replica_deleted(&self, replica: &ObjectView) -> ReconcileReport {
        let family = family_of(&replica.key);
        let ops = {
            let mut state = self.lock();
            state.originals.remove(&replica.key);
            if !state.ready(replica.key.kind) {
                state.pending.remove(&replica.key);
                return ReconcileReport::default();
            }
            state.forget_target(&family, &replica.key.namespace);
            state.plan_family(&family, Some(&replica.key.namespace))
        };
        self.run(ops).await
    }

    /// A namespace appeared or its labels changed: re-evaluate every source
    /// against that namespace only.
    pub async fn on_namespace_upsert(&self, name: &str, labels: &BTreeMap<String, String>) -> ReconcileReport {
        let ops = {
            let mut state = self.lock();
            if state.namespaces.upsert(name, labels) {
                debug!("Namespace {} labels now {:?}", name, labels);
            }
            let mut ops = Vec::new();
            for kind in SyncKind::ALL {
                if state.ready(kind) {
                    ops.extend(state.plan_kind(kind, Some(name)));
                }
            }
            ops
        };
        self.run(ops).await
    }

    /// A namespace is gone, and every object in it with it. Only bookkeeping
    /// is dropped; no write is issued.
    pub fn on_namespace_delete(&self, name: &str) {
        let mut state = self.lock();
        state.namespaces.remove(name);
        state.originals.retain(|key| key.namespace != name);
        state.pending.retain(|key, _| key.namespace != name);
        for by_source in state.replicas.values_mut() {
            for held in by_source.values_mut() {
                held.remove(name);
            }
            by_source.retain(|_, held| !held.is_empty());
        }
        state.replicas.retain(|_, by_source| !by_source.is_empty());
        debug!("Namespace {} removed from replication state", name);
    }

    /// The first complete list of Namespaces has been delivered.
    pub async fn on_namespaces_synced(&self) -> ReconcileReport {
        let ops = {
            let mut state = self.lock();
            if state.namespaces_synced {
                return ReconcileReport::default();
            }
            state.namespaces_synced = true;
            info!("Namespace list complete ({} namespaces)", state.namespaces.len());
            let mut ops = Vec::new();
            for kind in SyncKind::ALL {
                if state.ready(kind) {
                    ops.extend(state.catch_up(kind));
                }
            }
            ops
        };
        self.run(ops).await
    }

    /// The first complete list of `kind` has been delivered. Until this and
    /// the namespace list are both complete, the kind is recorded but not
    /// written.
    pub async fn on_initial_sync(&self, kind: SyncKind) -> ReconcileReport {
        let ops = {
            let mut state = self.lock();
            if !state.synced.insert(kind) || !state.ready(kind) {
                return ReconcileReport::default();
            }
            state.catch_up(kind)
        };
        self.run(ops).await
    }

    /// Namespaces holding `source`: its own, plus every namespace a replica
    /// was successfully written to or adopted in.
    pub fn replicas_of(&self, source: &ObjectKey) -> BTreeSet<String> {
        let state = self.lock();
        let mut out = BTreeSet::new();
        if state.originals.contains(source) {
            out.insert(source.namespace.clone());
        }
        if let Some(held) = state
            .replicas
            .get(&family_of(source))
            .and_then(|by_source| by_source.get(&source.namespace))
        {
            out.extend(
                held.iter()
                    .filter(|(_, hash)| hash.as_str() != FAILED_WRITE)
                    .map(|(ns, _)| ns.clone()),
            );
        }
        out
    }

    /// Copy of the namespace label cache.
    pub fn namespaces(&self) -> NamespaceSnapshot {
        self.lock().namespaces.clone()
    }

    /// Whether writes for `kind` are enabled.
    pub fn is_ready(&self, kind: SyncKind) -> bool {
        self.lock().ready(kind)
    }

    async fn run(&self, ops: Vec<WriteOp>) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let raced = self.execute(ops, &mut report).await;
        if raced.is_empty() {
            return report;
        }

        let ops = {
            let mut state = self.lock();
            let mut ops = Vec::new();
            for family in &raced {
                if state.ready(family.0) {
                    ops.extend(state.plan_family(family, None));
                }
            }
            ops
        };
        if !ops.is_empty() {
            debug!("Replanned {} families after concurrent changes", raced.len());
        }
        self.execute(ops, &mut report).await;
        report
    }

    async fn execute(&self, ops: Vec<WriteOp>, report: &mut ReconcileReport) -> BTreeSet<Family> {
        let mut raced = BTreeSet::new();
        for op in ops {
            if self.shutdown.is_cancelled() {
                report.skipped += 1;
                continue;
            }

            let result = self.write(&op).await;
            match (&op, &result) {
                (WriteOp::Apply { .. }, Ok(())) => {
                    report.applied += 1;
                    info!("Replicated {} to {}", op.source(), op.target().namespace);
                }
                (WriteOp::Delete { .. }, Ok(())) => {
                    report.deleted += 1;
                    info!("Removed replica {} of {}", op.target(), op.source());
                }
                (_, Err(WriteError::Cancelled)) => {
                    report.skipped += 1;
                    warn!("Write to {} cancelled by shutdown", op.target());
                }
                (_, Err(e @ WriteError::NotReplica(_))) => {
                    report.failed += 1;
                    warn!("Skipping {} for {}: {}", op.target(), op.source(), e);
                }
                (WriteOp::Apply { .. }, Err(e)) => {
                    report.failed += 1;
                    error!("Failed to replicate {} to {}: {}", op.source(), op.target().namespace, e);
                }
                (WriteOp::Delete { .. }, Err(e)) => {
                    report.failed += 1;
                    error!("Failed to remove replica {}: {}", op.target(), e);
                }
            }

            let replan = {
                let mut state = self.lock();
                match &result {
                    Err(WriteError::NotReplica(_)) => state.yield_target(&op),
                    _ => state.commit(&op, result.is_ok()),
                }
            };
            if replan {
                raced.insert(family_of(op.target()));
            }
        }
        raced
    }

    async fn write(&self, op: &WriteOp) -> Result<(), WriteError> {
        let write = async {
            match op {
                WriteOp::Apply { replica, .. } => self.writer.apply(replica).await,
                WriteOp::Delete { source, target } => self.writer.delete(target, &source.as_origin()).await,
            }
        };
        tokio::select! {
            () = self.shutdown.cancelled() => Err(WriteError::Cancelled),
            result = tokio::time::timeout(self.options.write_timeout, write) => match result {
                Ok(result) => result,
                Err(_elapsed) => Err(WriteError::Timeout(self.options.write_timeout)),
            },
        }
    }
}

impl std::fmt::Debug for ReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
