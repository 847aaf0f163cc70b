//! End-to-end tests of reconciliation, routing and replication against
//! in-memory core services and object stores.

use hoss_policy::DEFAULT_OPEN_POLICY;
use hoss_sync_engine::memory::{
    ApiCall, MemoryCoreServices, MemoryObjectStore, MemoryQueueFactory, StaticClient,
    StaticClientFactory,
};
use hoss_sync_engine::{
    ApiEvent, ApiEventType, BucketEvent, ConfigGraph, CoreServiceApi, CoreServiceConfig, Demuxer,
    DesiredStateMonitor, DispatchOutcome, EngineConfig, ExecuteContext, MatchOutcome,
    Message, NamespaceSyncRequest, NotificationQueueConfig, ObjectStoreClient, ObjectStoreConfig,
    ReconcilePlan, Reconciler, RefreshIntervals, ReloadHandle, ServiceDeps, StaticToken,
    SyncKey, SyncKind, SyncRelationship, SyncService, BACKFILL_USER_AGENT, SYNC_USER_AGENT,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const CORE_A: &str = "http://core-a/v1";
const CORE_B: &str = "http://core-b/v1";
const STORAGE_A: &str = "http://minio-a:9000";
const STORAGE_B: &str = "http://minio-b:9000";

const NO_RAW_POLICY: &str = r#"
Version: "1"
Statements:
  - Id: no-raw
    Conditions:
      - { Left: "object:key", Right: "*.raw", Operator: "!=" }
"#;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two core services, each with one object store and one namespace.
struct Fixture {
    api: Arc<MemoryCoreServices>,
    store_a: Arc<MemoryObjectStore>,
    store_b: Arc<MemoryObjectStore>,
    client_a: Arc<StaticClient>,
    graph: Arc<ConfigGraph>,
    monitors: Vec<Arc<DesiredStateMonitor>>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();

        let api = Arc::new(MemoryCoreServices::new());
        for (core, store, storage, namespace, bucket) in [
            (CORE_A, "store-a", STORAGE_A, "ns-a", "bucket-a"),
            (CORE_B, "store-b", STORAGE_B, "ns-b", "bucket-b"),
        ] {
            api.add_core_service(core);
            api.add_object_store(core, store, storage);
            api.add_namespace(core, namespace, store, bucket);
        }
        api.add_namespace(CORE_B, "ns-b2", "store-b", "bucket-b2");

        let store_a = Arc::new(MemoryObjectStore::new().with_page_size(2).with_chunk_size(4));
        let store_b = Arc::new(MemoryObjectStore::new());
        let client_a = Arc::new(StaticClient::new(store_a.clone()));
        let client_b = Arc::new(StaticClient::new(store_b.clone()));

        let shared: Arc<dyn CoreServiceApi> = api.clone();
        let graph = Arc::new(ConfigGraph::new([
            CoreServiceConfig::new(
                CORE_A,
                shared.clone(),
                [ObjectStoreConfig {
                    name: "store-a".into(),
                    endpoint: STORAGE_A.into(),
                    client: client_a.clone(),
                }],
                16,
                16,
            ),
            CoreServiceConfig::new(
                CORE_B,
                shared.clone(),
                [ObjectStoreConfig {
                    name: "store-b".into(),
                    endpoint: STORAGE_B.into(),
                    client: client_b,
                }],
                16,
                16,
            ),
        ]));

        let monitors = [CORE_A, CORE_B]
            .into_iter()
            .map(|core| {
                Arc::new(DesiredStateMonitor::new(
                    core,
                    shared.clone(),
                    Duration::from_secs(3600),
                ))
            })
            .collect();

        Self {
            api,
            store_a,
            store_b,
            client_a,
            graph,
            monitors,
        }
    }

    fn reconciler(&self) -> (Reconciler, ReloadHandle) {
        Reconciler::new(
            self.graph.clone(),
            self.monitors.clone(),
            Duration::from_secs(5),
        )
    }

    /// Publishes the relationships on core service A and runs one pass.
    async fn reconcile(&self, relationships: Vec<SyncRelationship>) -> ReconcilePlan {
        self.api.set_relationships(CORE_A, relationships);
        for monitor in &self.monitors {
            monitor.poll_once().await.unwrap();
        }
        self.reconciler().0.reconcile().await
    }

    fn node(&self, endpoint: &str) -> &Arc<CoreServiceConfig> {
        self.graph.node(endpoint).unwrap()
    }

    async fn execute(&self, message: impl Into<Message>) {
        let ctx = ExecuteContext::new(Duration::ZERO, CancellationToken::new());
        message
            .into()
            .execute(self.node(CORE_A), &ctx)
            .await
            .unwrap();
    }

    fn api_calls(&self, filter: impl Fn(&ApiCall) -> bool) -> Vec<ApiCall> {
        self.api.calls().into_iter().filter(|call| filter(call)).collect()
    }
}

fn a_to_b(policy: &str) -> SyncRelationship {
    SyncRelationship::new(SyncKind::Simplex, (CORE_A, "ns-a"), (CORE_B, "ns-b"))
        .with_policy("ds/", policy)
}

fn put(key: &str, size: u64) -> BucketEvent {
    BucketEvent::new("s3:ObjectCreated:Put", "bucket-a", key, size)
        .with_endpoint(STORAGE_A)
        .with_event_time("2021-03-09T17:04:05Z")
        .with_source("10.0.0.1", "MinIO (linux; amd64)")
}

fn delete(key: &str) -> BucketEvent {
    BucketEvent::new("s3:ObjectRemoved:Delete", "bucket-a", key, 0)
        .with_endpoint(STORAGE_A)
        .with_source("10.0.0.1", "MinIO (linux; amd64)")
}

#[tokio::test]
async fn reconcile_is_idempotent() {
    let fixture = Fixture::new();
    let relationship = a_to_b(DEFAULT_OPEN_POLICY);

    let plan = fixture.reconcile(vec![relationship.clone()]).await;
    assert_eq!(plan.to_create, vec![relationship.clone()]);
    assert!(plan.to_delete.is_empty());

    let current = fixture.graph.current_relationships();
    assert_eq!(current.len(), 1);
    assert!(current.contains_key(&relationship.identity()));

    {
        let state = fixture.node(CORE_A).read();
        let namespace = &state.namespaces["ns-a"];
        assert_eq!(namespace.location().bucket, "bucket-a");
        let targets = namespace.linked_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, SyncKey::new(CORE_B, "ns-b"));
        assert_eq!(targets[0].2.bucket, "bucket-b");
    }
    // the target namespace was created on demand
    assert!(fixture.node(CORE_B).read().namespaces.contains_key("ns-b"));

    let plan = fixture.reconcile(vec![relationship]).await;
    assert!(plan.is_empty());
    assert_eq!(fixture.graph.current_relationships().len(), 1);
}

#[tokio::test]
async fn policy_change_replaces_relationship() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    let plan = fixture.reconcile(vec![a_to_b(NO_RAW_POLICY)]).await;
    assert_eq!(plan.to_create.len(), 1);
    assert_eq!(plan.to_delete.len(), 1);

    let state = fixture.node(CORE_A).read();
    let namespace = &state.namespaces["ns-a"];
    assert_eq!(namespace.policies()["ds/"], NO_RAW_POLICY);
    assert_eq!(namespace.targets().len(), 1);
    assert!(namespace.targets()[&SyncKey::new(CORE_B, "ns-b")].is_linked());
}

#[tokio::test]
async fn removing_last_relationship_clears_policies() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    let plan = fixture.reconcile(Vec::new()).await;
    assert_eq!(plan.to_delete.len(), 1);
    assert!(fixture.graph.current_relationships().is_empty());

    let state = fixture.node(CORE_A).read();
    let namespace = &state.namespaces["ns-a"];
    assert!(namespace.targets().is_empty());
    assert!(namespace.policies().is_empty());
    assert!(namespace.filters().is_empty());
}

#[tokio::test]
async fn unresolvable_namespace_is_skipped() {
    let fixture = Fixture::new();
    let relationship =
        SyncRelationship::new(SyncKind::Simplex, (CORE_A, "missing"), (CORE_B, "ns-b"))
            .with_policy("ds/", DEFAULT_OPEN_POLICY);

    fixture.reconcile(vec![relationship.clone()]).await;
    assert!(fixture.graph.current_relationships().is_empty());

    // the namespace appears later and the next pass picks it up
    fixture.api.add_namespace(CORE_A, "missing", "store-a", "bucket-m");
    let plan = fixture.reconcile(vec![relationship]).await;
    assert_eq!(plan.to_create.len(), 1);
    assert_eq!(fixture.graph.current_relationships().len(), 1);
}

#[tokio::test]
async fn demuxer_routes_to_owning_node() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;
    let demuxer = Demuxer::new(fixture.graph.clone(), fixture.reconciler().1);

    let unknown = Message::from(put("ds/file.txt", 1).with_endpoint("http://elsewhere:9000"));
    for node in fixture.graph.nodes() {
        assert_eq!(unknown.matches(node), MatchOutcome::NONE);
    }
    assert_eq!(demuxer.dispatch(unknown).await, DispatchOutcome::Unroutable);

    let access = BucketEvent::new("s3:ObjectAccessed:Get", "bucket-a", "ds/file.txt", 1)
        .with_endpoint(STORAGE_A);
    assert_eq!(demuxer.dispatch(access.into()).await, DispatchOutcome::Ignored);

    let descriptor = put("ds/.dataset.yaml", 1);
    assert_eq!(demuxer.dispatch(descriptor.into()).await, DispatchOutcome::Ignored);

    let event = put("ds/file.txt", 1);
    assert_eq!(
        demuxer.dispatch(event.clone().into()).await,
        DispatchOutcome::Queued(CORE_A.to_string())
    );
    let queued = fixture.node(CORE_A).work_receiver().try_recv().unwrap();
    assert_eq!(queued, Message::Bucket(event));
    assert!(fixture.node(CORE_B).work_receiver().is_empty());
}

#[tokio::test]
async fn api_events_route_by_source_endpoint() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    let known = Message::from(
        ApiEvent::new(ApiEventType::PutDatasetPermission, CORE_A, "ns-a").with_dataset("ds"),
    );
    assert_eq!(known.matches(fixture.node(CORE_A)), MatchOutcome::MATCHED);
    assert_eq!(known.matches(fixture.node(CORE_B)), MatchOutcome::NONE);

    let unsynced = Message::from(ApiEvent::new(
        ApiEventType::PutDatasetPermission,
        CORE_A,
        "other",
    ));
    assert_eq!(unsynced.matches(fixture.node(CORE_A)), MatchOutcome::NONE);

    let created = Message::from(
        ApiEvent::new(ApiEventType::CreateNamespace, CORE_A, "other").with_object_store("store-a"),
    );
    assert_eq!(created.matches(fixture.node(CORE_A)), MatchOutcome::MATCHED);
}

#[tokio::test]
async fn put_replicates_objects_admitted_by_policy() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(NO_RAW_POLICY)]).await;

    let metadata = HashMap::from([
        ("owner".to_string(), "alice".to_string()),
        ("color".to_string(), "blue".to_string()),
    ]);
    fixture
        .store_a
        .insert("bucket-a", "ds/file.txt", "hello", metadata.clone());
    fixture
        .store_a
        .insert("bucket-a", "ds/image.raw", "raw bytes", HashMap::new());

    fixture.execute(put("ds/file.txt", 5)).await;
    fixture.execute(put("ds/image.raw", 9)).await;

    let (body, copied) = fixture.store_b.object("bucket-b", "ds/file.txt").unwrap();
    assert_eq!(&body[..], b"hello");
    assert_eq!(copied, metadata);
    assert!(!fixture.store_b.contains("bucket-b", "ds/image.raw"));

    // the source index sees every put, replicated or not
    let documents = fixture.api.metadata_documents(CORE_A);
    assert_eq!(documents.len(), 2);
    let document = documents
        .values()
        .find(|document| document.object_key == "ds/file.txt")
        .unwrap();
    assert_eq!(document.dataset_extended, "store-a|bucket-a|ds");
    assert_eq!(document.size_bytes, 5);
    assert_eq!(document.last_modified_date, "2021-03-09T17:04:05Z");
    assert_eq!(document.metadata, vec!["color:blue", "owner:alice"]);
}

#[tokio::test]
async fn large_objects_copy_across_many_chunks() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    let content: Vec<u8> = (0..1021u32).map(|i| (i % 251) as u8).collect();
    fixture
        .store_a
        .insert("bucket-a", "ds/large.bin", content.clone(), HashMap::new());

    fixture.execute(put("ds/large.bin", 1021)).await;

    let (body, _) = fixture.store_b.object("bucket-b", "ds/large.bin").unwrap();
    assert_eq!(&body[..], &content[..]);
}

#[tokio::test]
async fn delete_replicates_and_unindexes() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    fixture
        .store_a
        .insert("bucket-a", "ds/file.txt", "hello", HashMap::new());
    fixture.execute(put("ds/file.txt", 5)).await;
    assert!(fixture.store_b.contains("bucket-b", "ds/file.txt"));

    fixture
        .store_a
        .delete_object("bucket-a", "ds/file.txt")
        .await
        .unwrap();
    fixture.execute(delete("ds/file.txt")).await;

    assert!(!fixture.store_b.contains("bucket-b", "ds/file.txt"));
    assert!(fixture.api.metadata_documents(CORE_A).is_empty());
}

#[tokio::test]
async fn removed_delete_marker_restores_object() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    // the object still answers a head request, so the delete is a restore
    fixture
        .store_a
        .insert("bucket-a", "ds/file.txt", "restored", HashMap::new());
    fixture.execute(delete("ds/file.txt")).await;

    let (body, _) = fixture.store_b.object("bucket-b", "ds/file.txt").unwrap();
    assert_eq!(&body[..], b"restored");
    assert_eq!(fixture.api.metadata_documents(CORE_A).len(), 1);
}

#[tokio::test]
async fn engine_writes_are_indexed_but_not_echoed() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    fixture
        .store_a
        .insert("bucket-a", "ds/echo.txt", "echo", HashMap::new());
    let event = put("ds/echo.txt", 4).with_source("10.0.0.2", format!("aws-sdk {SYNC_USER_AGENT}"));
    fixture.execute(event).await;

    assert!(!fixture.store_b.contains("bucket-b", "ds/echo.txt"));
    assert_eq!(fixture.api.metadata_documents(CORE_A).len(), 1);
}

#[tokio::test]
async fn objects_outside_policy_prefixes_are_not_synced() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    fixture
        .store_a
        .insert("bucket-a", "other/file.txt", "x", HashMap::new());
    fixture.execute(put("other/file.txt", 1)).await;

    assert!(!fixture.store_b.contains("bucket-b", "other/file.txt"));
    assert_eq!(fixture.api.metadata_documents(CORE_A).len(), 1);
}

#[tokio::test]
async fn dataset_sync_creates_dataset_and_backfills() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;
    for key in ["ds/a.txt", "ds/b.txt", "ds/c d+e.txt", "other/x.txt"] {
        fixture.store_a.insert("bucket-a", key, key, HashMap::new());
    }

    let event = ApiEvent::new(ApiEventType::PutDatasetSync, CORE_A, "ns-a")
        .with_dataset("ds")
        .with_description("raw captures");
    fixture.execute(event).await;

    let created = fixture.api_calls(|call| matches!(call, ApiCall::CreateDataset { .. }));
    let [ApiCall::CreateDataset {
        endpoint,
        namespace,
        request,
    }] = created.as_slice()
    else {
        panic!("expected one dataset creation, got {created:?}");
    };
    assert_eq!(endpoint, CORE_B);
    assert_eq!(namespace, "ns-b");
    assert_eq!(request.name, "ds");
    assert_eq!(request.description, "raw captures");

    let replay = fixture.node(CORE_A).replay_receiver().clone();
    let mut replayed = Vec::new();
    for _ in 0..3 {
        let message = tokio::time::timeout(Duration::from_secs(5), replay.recv())
            .await
            .unwrap()
            .unwrap();
        let Message::Bucket(event) = message else {
            panic!("expected a bucket event");
        };
        assert_eq!(event.endpoint, STORAGE_A);
        assert_eq!(event.source.user_agent, BACKFILL_USER_AGENT);
        assert!(!event.is_self_generated());
        replayed.push(event);
    }

    let mut keys: Vec<_> = replayed.iter().map(BucketEvent::key).collect();
    keys.sort();
    assert_eq!(keys, vec!["ds/a.txt", "ds/b.txt", "ds/c d+e.txt"]);

    for event in replayed {
        fixture.execute(event).await;
    }
    assert_eq!(
        fixture.store_b.keys("bucket-b"),
        vec!["ds/a.txt", "ds/b.txt", "ds/c d+e.txt"]
    );
}

#[tokio::test]
async fn permission_changes_are_mirrored_to_targets() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    fixture
        .execute(
            ApiEvent::new(ApiEventType::PutDatasetPermission, CORE_A, "ns-a")
                .with_dataset("ds")
                .with_permission("analysts", "read_only"),
        )
        .await;
    fixture
        .execute(
            ApiEvent::new(ApiEventType::DeleteDatasetPermission, CORE_A, "ns-a")
                .with_dataset("ds")
                .with_permission("analysts", ""),
        )
        .await;

    let calls = fixture.api_calls(|call| {
        matches!(
            call,
            ApiCall::PutDatasetPermission { .. } | ApiCall::DeleteDatasetPermission { .. }
        )
    });
    assert_eq!(
        calls,
        vec![
            ApiCall::PutDatasetPermission {
                endpoint: CORE_B.into(),
                namespace: "ns-b".into(),
                dataset: "ds".into(),
                group: "analysts".into(),
                permission: "read_only".into(),
            },
            ApiCall::DeleteDatasetPermission {
                endpoint: CORE_B.into(),
                namespace: "ns-b".into(),
                dataset: "ds".into(),
                group: "analysts".into(),
            },
        ]
    );
}

#[tokio::test]
async fn namespace_duplex_targets_only_the_named_namespace() {
    let fixture = Fixture::new();
    fixture
        .reconcile(vec![
            a_to_b(DEFAULT_OPEN_POLICY),
            SyncRelationship::new(SyncKind::Simplex, (CORE_A, "ns-a"), (CORE_B, "ns-b2"))
                .with_policy("ds/", DEFAULT_OPEN_POLICY),
        ])
        .await;

    fixture
        .execute(
            ApiEvent::new(ApiEventType::PutNamespaceDuplex, CORE_A, "ns-a")
                .with_target(CORE_B, "ns-b2"),
        )
        .await;

    let calls = fixture.api_calls(|call| matches!(call, ApiCall::PutNamespaceSync { .. }));
    assert_eq!(
        calls,
        vec![ApiCall::PutNamespaceSync {
            endpoint: CORE_B.into(),
            namespace: "ns-b2".into(),
            request: NamespaceSyncRequest {
                target_core_service: CORE_A.into(),
                target_namespace: "ns-a".into(),
                sync_type: SyncKind::Duplex,
            },
        }]
    );
}

#[tokio::test]
async fn dataset_duplex_enables_sync_on_targets() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    fixture
        .execute(
            ApiEvent::new(ApiEventType::PutDatasetDuplex, CORE_A, "ns-a")
                .with_dataset("ds")
                .with_sync_policy(NO_RAW_POLICY),
        )
        .await;

    let calls = fixture.api_calls(|call| matches!(call, ApiCall::PutDatasetSync { .. }));
    let [ApiCall::PutDatasetSync {
        endpoint,
        namespace,
        dataset,
        request,
    }] = calls.as_slice()
    else {
        panic!("expected one dataset sync call, got {calls:?}");
    };
    assert_eq!(endpoint, CORE_B);
    assert_eq!(namespace, "ns-b");
    assert_eq!(dataset, "ds");
    assert_eq!(request.sync_type, SyncKind::Duplex);
    assert_eq!(request.sync_policy, NO_RAW_POLICY);
}

#[tokio::test]
async fn namespace_creation_refreshes_object_store_client() {
    let fixture = Fixture::new();

    fixture
        .execute(
            ApiEvent::new(ApiEventType::CreateNamespace, CORE_A, "new-ns")
                .with_object_store("store-a"),
        )
        .await;
    assert_eq!(fixture.client_a.refresh_count(), 1);

    fixture
        .execute(
            ApiEvent::new(ApiEventType::CreateNamespace, CORE_A, "new-ns")
                .with_object_store("unknown"),
        )
        .await;
    assert_eq!(fixture.client_a.refresh_count(), 1);
}

#[tokio::test]
async fn unknown_api_event_fails() {
    let fixture = Fixture::new();
    fixture.reconcile(vec![a_to_b(DEFAULT_OPEN_POLICY)]).await;

    let ctx = ExecuteContext::new(Duration::ZERO, CancellationToken::new());
    let event = ApiEvent::new(ApiEventType::Unknown, CORE_A, "ns-a");
    assert!(Message::from(event)
        .execute(fixture.node(CORE_A), &ctx)
        .await
        .is_err());
}

#[tokio::test]
async fn forced_reload_waits_for_reconciliation() {
    let fixture = Fixture::new();
    let (reconciler, reload) = fixture.reconciler();
    let cancel = CancellationToken::new();
    let changed = Arc::new(tokio::sync::Notify::new());
    let task = tokio::spawn(reconciler.run(changed, cancel.clone()));

    assert_eq!(reload.generation(), 0);
    fixture
        .api
        .set_relationships(CORE_A, vec![a_to_b(DEFAULT_OPEN_POLICY)]);

    reload.force_reload().await;
    assert!(reload.generation() >= 1);
    assert_eq!(fixture.graph.current_relationships().len(), 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn service_replicates_queued_notifications() {
    init_tracing();
    let api = Arc::new(MemoryCoreServices::new());
    let store_a = Arc::new(MemoryObjectStore::new());
    let store_b = Arc::new(MemoryObjectStore::new());
    let clients = Arc::new(StaticClientFactory::new());
    clients.insert("store-a", store_a.clone());
    clients.insert("store-b", store_b.clone());

    for (core, store, storage, namespace, bucket) in [
        (CORE_A, "store-a", STORAGE_A, "ns-a", "bucket-a"),
        (CORE_B, "store-b", STORAGE_B, "ns-b", "bucket-b"),
    ] {
        api.add_core_service(core);
        api.add_object_store(core, store, storage);
        api.add_namespace(core, namespace, store, bucket);
    }
    api.set_relationships(CORE_A, vec![a_to_b(DEFAULT_OPEN_POLICY)]);

    let queue: NotificationQueueConfig = serde_json::from_value(serde_json::json!({
        "type": "amqp",
        "settings": {
            "message_type": "bucket_notification",
            "source_endpoint": STORAGE_A,
            "queue_name": "core-a-bucket",
        }
    }))
    .unwrap();
    api.add_queue(CORE_A, queue);

    let queues = Arc::new(MemoryQueueFactory::new());
    let bodies = queues.sender("core-a-bucket");

    let config = EngineConfig::new([CORE_A, CORE_B])
        .with_worker_instance_count(2)
        .with_refresh_intervals(RefreshIntervals {
            core_service: Duration::from_secs(3600),
            ..RefreshIntervals::default()
        });
    let deps = ServiceDeps {
        api: api.clone(),
        tokens: Arc::new(StaticToken::new("token")),
        clients,
        queues,
    };
    let service = SyncService::start(config, deps).await.unwrap();

    service.reload_handle().force_reload().await;
    assert_eq!(service.graph().current_relationships().len(), 1);

    store_a.insert("bucket-a", "ds/queued.txt", "queued", HashMap::new());
    let body = serde_json::json!({"Records": [{
        "eventName": "s3:ObjectCreated:Put",
        "eventTime": "2021-03-09T17:04:05.000Z",
        "s3": {
            "bucket": {"name": "bucket-a"},
            "object": {"key": "ds/queued.txt", "size": 6}
        },
        "source": {"host": "10.0.0.1", "userAgent": "MinIO (linux; amd64)"}
    }]});
    bodies
        .send(serde_json::to_vec(&body).unwrap().into())
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !store_b.contains("bucket-b", "ds/queued.txt") {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(api.metadata_documents(CORE_A).len(), 1);

    service.shutdown().await;
}

#[tokio::test]
async fn service_fails_on_unknown_queue_format() {
    init_tracing();
    let api = Arc::new(MemoryCoreServices::new());
    api.add_core_service(CORE_A);
    let queue: NotificationQueueConfig = serde_json::from_value(serde_json::json!({
        "type": "amqp",
        "settings": {"message_type": "carrier_pigeon", "queue_name": "q"}
    }))
    .unwrap();
    api.add_queue(CORE_A, queue);

    let deps = ServiceDeps {
        api,
        tokens: Arc::new(StaticToken::new("token")),
        clients: Arc::new(StaticClientFactory::new()),
        queues: Arc::new(MemoryQueueFactory::new()),
    };
    let result = SyncService::start(EngineConfig::new([CORE_A]), deps).await;
    assert!(matches!(result, Err(hoss_sync_engine::SyncError::Config(_))));
}
