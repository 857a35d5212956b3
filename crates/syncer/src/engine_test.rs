//! Unit tests for the replication engine internals

use super::*;
use crate::annotations::{Origin, SYNC_ANNOTATION};
use crate::mock::MockReplicaWriter;
use async_trait::async_trait;
use serde_json::json;

fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn key(ns: &str, name: &str) -> ObjectKey {
    ObjectKey::new(SyncKind::Secret, ns, name)
}

fn secret(ns: &str, name: &str, annotations: &[(&str, &str)], value: &str) -> ObjectView {
    ObjectView {
        key: key(ns, name),
        labels: BTreeMap::new(),
        annotations: map(annotations),
        payload: json!({ "data": { "token": value } }),
    }
}

fn synced_source(ns: &str, name: &str, value: &str) -> ObjectView {
    secret(ns, name, &[(SYNC_ANNOTATION, "true")], value)
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn engine() -> (ReplicationEngine, MockReplicaWriter) {
    let writer = MockReplicaWriter::new();
    let engine = ReplicationEngine::new(
        Arc::new(writer.clone()),
        EngineOptions::default(),
        CancellationToken::new(),
    );
    (engine, writer)
}

async fn make_ready(engine: &ReplicationEngine, namespaces: &[&str]) {
    for ns in namespaces {
        engine.on_namespace_upsert(ns, &BTreeMap::new()).await;
    }
    engine.on_namespaces_synced().await;
    engine.on_initial_sync(SyncKind::Secret).await;
}

/// Never completes a write.
struct StuckWriter;

#[async_trait]
impl ReplicaWriter for StuckWriter {
    async fn apply(&self, _replica: &Replica) -> Result<(), WriteError> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &ObjectKey, _origin: &Origin) -> Result<(), WriteError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_no_writes_before_initial_sync() {
    let (engine, writer) = engine();
    engine.on_namespace_upsert("a", &map(&[])).await;
    engine.on_namespace_upsert("b", &map(&[])).await;

    let report = engine.on_source_upsert(&synced_source("a", "creds", "v1")).await;
    assert!(report.is_noop());

    // namespaces complete, secrets not yet
    assert!(engine.on_namespaces_synced().await.is_noop());
    assert!(!engine.is_ready(SyncKind::Secret));
    assert_eq!(writer.write_calls(), 0);

    let report = engine.on_initial_sync(SyncKind::Secret).await;
    assert_eq!(report.applied, 1);
    assert_eq!(writer.namespaces_holding(&key("a", "creds")), set(&["b"]));

    // a second sync notification is not a second catch-up
    assert!(engine.on_initial_sync(SyncKind::Secret).await.is_noop());
}

#[tokio::test]
async fn test_existing_replicas_adopted_on_restart() {
    let (engine, writer) = engine();
    let source = synced_source("a", "creds", "v1");
    let template = ReplicaTemplate::from_source(&source);
    writer.insert(template.render("b"));
    writer.insert(template.render("c"));

    // a fresh list may deliver replicas before their source
    for replica in writer.replicas() {
        engine.on_replica_observed(&replica.view()).await;
    }
    engine.on_source_upsert(&source).await;
    make_ready(&engine, &["a", "b", "c"]).await;

    assert_eq!(writer.write_calls(), 0);
    assert_eq!(engine.replicas_of(&source.key), set(&["a", "b", "c"]));
}

#[tokio::test]
async fn test_drifted_replica_is_overwritten() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b"]).await;
    let source = synced_source("a", "creds", "v1");
    engine.on_source_upsert(&source).await;

    let mut drifted = writer.get(&key("b", "creds")).unwrap().view();
    drifted.payload = json!({ "data": { "token": "edited" } });
    let report = engine.on_replica_observed(&drifted).await;

    assert_eq!(report.applied, 1);
    assert_eq!(writer.get(&key("b", "creds")).unwrap().payload, source.payload);
}

#[tokio::test]
async fn test_own_write_echo_is_ignored() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b", "c"]).await;
    engine.on_source_upsert(&synced_source("a", "creds", "v1")).await;
    let writes = writer.write_calls();

    for replica in writer.replicas() {
        let mut echoed = replica.view();
        // the API server adds its own metadata on the way back
        echoed
            .labels
            .insert("app.kubernetes.io/managed-by".to_string(), "kubed".to_string());
        assert!(engine.on_replica_observed(&echoed).await.is_noop());
    }
    assert_eq!(writer.write_calls(), writes);
}

#[tokio::test]
async fn test_orphan_replica_is_removed() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b"]).await;
    let ghost = ReplicaTemplate::from_source(&synced_source("a", "creds", "v1")).render("b");
    writer.insert(ghost.clone());

    let report = engine.on_replica_observed(&ghost.view()).await;

    assert_eq!(report.deleted, 1);
    assert!(writer.get(&key("b", "creds")).is_none());
    // the delete echo changes nothing
    assert!(engine.on_replica_deleted(&ghost.view()).await.is_noop());
}

#[tokio::test]
async fn test_existing_object_is_never_overwritten() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b"]).await;
    engine.on_source_upsert(&secret("b", "creds", &[], "mine")).await;

    let report = engine.on_source_upsert(&synced_source("a", "creds", "v1")).await;
    assert!(report.is_noop());
    assert_eq!(writer.write_calls(), 0);

    // once the unrelated object is gone the namespace can take a replica
    let report = engine.on_source_delete(&key("b", "creds")).await;
    assert_eq!(report.applied, 1);
    assert!(writer.get(&key("b", "creds")).is_some());
}

#[tokio::test]
async fn test_unobserved_object_at_target_is_not_overwritten() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b", "c"]).await;
    // created by a user, not yet seen by the informer
    let mine = secret("b", "creds", &[], "mine");
    writer.insert(Replica {
        key: mine.key.clone(),
        labels: mine.labels.clone(),
        annotations: mine.annotations.clone(),
        payload: mine.payload.clone(),
    });

    let source = synced_source("a", "creds", "v1");
    let report = engine.on_source_upsert(&source).await;

    assert_eq!(report.applied, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(writer.get(&key("b", "creds")).unwrap().payload, mine.payload);
    assert_eq!(engine.replicas_of(&source.key), set(&["a", "c"]));

    // b is left alone from now on
    let writes = writer.write_calls();
    assert!(engine.on_namespace_upsert("b", &map(&[("x", "y")])).await.is_noop());
    assert!(engine.on_source_upsert(&source).await.is_noop());
    assert_eq!(writer.write_calls(), writes);
}

#[tokio::test]
async fn test_replaced_replica_is_not_deleted() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b"]).await;
    let source = synced_source("a", "creds", "v1");
    engine.on_source_upsert(&source).await;

    // a user swapped the replica for their own object; no event seen yet
    let mine = secret("b", "creds", &[], "mine");
    writer.remove(&key("b", "creds"));
    writer.insert(Replica {
        key: mine.key.clone(),
        labels: mine.labels.clone(),
        annotations: mine.annotations.clone(),
        payload: mine.payload.clone(),
    });

    let report = engine.on_source_delete(&source.key).await;
    assert_eq!(report.deleted, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(writer.get(&key("b", "creds")).unwrap().payload, mine.payload);
    assert!(engine.replicas_of(&source.key).is_empty());
}

#[tokio::test]
async fn test_same_named_sources_resolve_by_namespace_order() {
    async fn run(first: &ObjectView, second: &ObjectView) -> serde_json::Value {
        let (engine, writer) = engine();
        make_ready(&engine, &["a", "b", "c"]).await;
        engine.on_source_upsert(first).await;
        // the replica in the second source's namespace is replaced by the source
        engine.on_source_upsert(second).await;
        writer.get(&key("c", "creds")).unwrap().payload
    }

    let from_a = synced_source("a", "creds", "from-a");
    let from_b = synced_source("b", "creds", "from-b");

    assert_eq!(run(&from_a, &from_b).await, from_a.payload);
    assert_eq!(run(&from_b, &from_a).await, from_a.payload);
}

#[tokio::test]
async fn test_stuck_write_times_out() {
    let engine = ReplicationEngine::new(
        Arc::new(StuckWriter),
        EngineOptions {
            write_timeout: Duration::from_millis(20),
        },
        CancellationToken::new(),
    );
    make_ready(&engine, &["a", "b"]).await;

    let source = synced_source("a", "creds", "v1");
    let report = engine.on_source_upsert(&source).await;

    assert_eq!(report.failed, 1);
    assert_eq!(engine.replicas_of(&source.key), set(&["a"]));
}

#[tokio::test]
async fn test_shutdown_skips_writes() {
    let writer = MockReplicaWriter::new();
    let shutdown = CancellationToken::new();
    let engine = ReplicationEngine::new(Arc::new(writer.clone()), EngineOptions::default(), shutdown.clone());
    make_ready(&engine, &["a", "b", "c"]).await;

    shutdown.cancel();
    let report = engine.on_source_upsert(&synced_source("a", "creds", "v1")).await;

    assert_eq!(report.skipped, 2);
    assert_eq!(report.writes(), 0);
    assert_eq!(writer.write_calls(), 0);
}

#[tokio::test]
async fn test_namespace_delete_issues_no_writes() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b"]).await;
    let source = synced_source("a", "creds", "v1");
    engine.on_source_upsert(&source).await;
    let writes = writer.write_calls();

    engine.on_namespace_delete("b");
    assert_eq!(writer.write_calls(), writes);
    assert_eq!(engine.replicas_of(&source.key), set(&["a"]));

    // a namespace re-created under the same name gets a fresh replica
    let report = engine.on_namespace_upsert("b", &map(&[])).await;
    assert_eq!(report.applied, 1);
}

#[tokio::test]
async fn test_externally_deleted_replica_is_recreated() {
    let (engine, writer) = engine();
    make_ready(&engine, &["a", "b"]).await;
    engine.on_source_upsert(&synced_source("a", "creds", "v1")).await;

    let replica = writer.get(&key("b", "creds")).unwrap();
    writer.remove(&replica.key);
    let report = engine.on_replica_deleted(&replica.view()).await;

    assert_eq!(report.applied, 1);
    assert_eq!(writer.get(&key("b", "creds")), Some(replica));
}

#[test]
fn test_commit_flags_writes_overtaken_by_newer_state() {
    let mut state = EngineState::default();
    state.namespaces.upsert("a", &map(&[]));
    state.namespaces.upsert("b", &map(&[]));
    state.namespaces_synced = true;
    state.synced.insert(SyncKind::Secret);

    let old = ReplicaTemplate::from_source(&synced_source("a", "creds", "v1"));
    let current = synced_source("a", "creds", "v2");
    state.originals.insert(current.key.clone());
    state
        .sources
        .entry((SyncKind::Secret, "creds".to_string()))
        .or_default()
        .insert(
            "a".to_string(),
            SourceEntry {
                settings: SyncSettings::from_annotations(&current.annotations),
                template: ReplicaTemplate::from_source(&current),
            },
        );

    let stale_apply = WriteOp::Apply {
        source: current.key.clone(),
        replica: old.render("b"),
        hash: old.hash.clone(),
    };
    assert!(state.commit(&stale_apply, true));

    // the follow-up plan rewrites it with the current content
    let ops = state.plan_family(&(SyncKind::Secret, "creds".to_string()), None);
    assert!(matches!(ops.as_slice(), [WriteOp::Apply { replica, .. }] if replica.key == key("b", "creds")));
}

#[test]
fn test_failed_apply_is_retried_by_next_plan() {
    let mut state = EngineState::default();
    state.namespaces.upsert("a", &map(&[]));
    state.namespaces.upsert("b", &map(&[]));
    let source = synced_source("a", "creds", "v1");
    let template = ReplicaTemplate::from_source(&source);
    state.originals.insert(source.key.clone());
    state
        .sources
        .entry((SyncKind::Secret, "creds".to_string()))
        .or_default()
        .insert(
            "a".to_string(),
            SourceEntry {
                settings: SyncSettings::from_annotations(&source.annotations),
                template: template.clone(),
            },
        );

    let apply = WriteOp::Apply {
        source: source.key.clone(),
        replica: template.render("b"),
        hash: template.hash.clone(),
    };
    assert!(!state.commit(&apply, false));
    assert_eq!(
        state.held(&(SyncKind::Secret, "creds".to_string()), "a", "b"),
        Some(FAILED_WRITE)
    );

    let ops = state.plan_family(&(SyncKind::Secret, "creds".to_string()), None);
    assert_eq!(ops.len(), 1);
}

#[test]
fn test_single_namespace_plan_looks_up_held_replicas() {
    let mut state = EngineState::default();
    let family = (SyncKind::Secret, "creds".to_string());
    let targets: Vec<String> = (0..500).map(|i| format!("ns-{i:03}")).collect();
    state.namespaces.upsert("a", &map(&[]));
    for ns in &targets {
        state.namespaces.upsert(ns, &map(&[]));
    }
    state.namespaces_synced = true;
    state.synced.insert(SyncKind::Secret);

    let source = synced_source("a", "creds", "v1");
    let template = ReplicaTemplate::from_source(&source);
    state.originals.insert(source.key.clone());
    for ns in &targets {
        state.record(&family, "a", ns, template.hash.clone());
    }
    state.sources.entry(family.clone()).or_default().insert(
        "a".to_string(),
        SourceEntry {
            settings: SyncSettings::from_annotations(&source.annotations),
            template,
        },
    );

    assert!(state.plan_family(&family, Some("ns-250")).is_empty());
    assert_eq!(state.held_visits, 1);
    assert!(state.plan_family(&family, Some("elsewhere")).is_empty());
    assert_eq!(state.held_visits, 1);

    state.held_visits = 0;
    assert!(state.plan_family(&family, None).is_empty());
    assert_eq!(state.held_visits, targets.len());
}
