//! End-to-end exercises of the cluster facade against an in-process mock
//! node: bootstrap, bucket open, CRUD round trips, durability framing,
//! not-my-vbucket re-routing, ping and diagnostics.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{config_document, ClusterState, MockNode, PASSWORD, USERNAME};
use serde_json::json;
use shoal_client::cluster::Cluster;
use shoal_client::config::{ClusterOptions, Credentials};
use shoal_client::diag::PingState;
use shoal_client::kv::operations::{KvOperation, KvRequest, StoreSemantics};
use shoal_client::kv::DocumentId;
use shoal_client::protocol::subdoc::MutateInSpec;
use shoal_client::protocol::DurabilityLevel;
use shoal_client::service::ServiceType;
use shoal_client::ErrorKind;

fn options_for(port: u16) -> ClusterOptions {
    let mut options = ClusterOptions::default();
    options.seed_hosts = vec![format!("127.0.0.1:{port}")];
    options.credentials = Credentials {
        username: USERNAME.into(),
        password: PASSWORD.into(),
    };
    options.security.allow_plain_without_tls = true;
    options
}

async fn single_node_cluster() -> (Cluster, MockNode, Arc<ClusterState>) {
    let state = Arc::new(ClusterState::default());
    let node = MockNode::start(0, Arc::clone(&state)).await;
    node.set_config(config_document(
        1,
        1,
        &[("127.0.0.1", node.port, None)],
        0,
    ));
    let cluster = Cluster::connect(options_for(node.port)).await.unwrap();
    cluster.open_bucket("default").await.unwrap();
    (cluster, node, state)
}

fn doc_id(key: &str) -> DocumentId {
    DocumentId::in_default_collection("default", key).unwrap()
}

#[tokio::test]
async fn upsert_then_get_round_trip() {
    let (cluster, _node, _state) = single_node_cluster().await;

    let body = br#"{"a":1,"b":2}"#.to_vec();
    let upsert = cluster
        .execute(KvRequest::new(
            doc_id("foo"),
            KvOperation::Upsert {
                value: body.clone(),
                flags: 0,
                expiry: 0,
                preserve_expiry: false,
            },
        ))
        .await
        .unwrap();
    assert_ne!(upsert.cas, 0);
    let token = upsert.mutation_token.unwrap();
    assert_ne!(token.sequence_number, 0);

    let get = cluster
        .execute(KvRequest::new(doc_id("foo"), KvOperation::Get))
        .await
        .unwrap();
    assert_eq!(get.value, body);
    assert_eq!(get.cas, upsert.cas);

    cluster.close().await;
}

#[tokio::test]
async fn replace_honours_cas() {
    let (cluster, _node, _state) = single_node_cluster().await;

    let upsert = cluster
        .execute(KvRequest::new(
            doc_id("x"),
            KvOperation::Upsert {
                value: b"{}".to_vec(),
                flags: 0,
                expiry: 0,
                preserve_expiry: false,
            },
        ))
        .await
        .unwrap();
    let cas = upsert.cas;

    let stale = cluster
        .execute(KvRequest::new(
            doc_id("x"),
            KvOperation::Replace {
                value: br#"{"v":1}"#.to_vec(),
                flags: 0,
                expiry: 0,
                preserve_expiry: false,
                cas: cas + 1,
            },
        ))
        .await
        .unwrap_err();
    assert_eq!(stale.kind(), ErrorKind::CasMismatch);
    let context = stale.kv_context().unwrap();
    assert_eq!(context.bucket, "default");
    assert_eq!(context.status_code, Some(0x02));

    let fresh = cluster
        .execute(KvRequest::new(
            doc_id("x"),
            KvOperation::Replace {
                value: br#"{"v":1}"#.to_vec(),
                flags: 0,
                expiry: 0,
                preserve_expiry: false,
                cas,
            },
        ))
        .await
        .unwrap();
    assert_ne!(fresh.cas, cas);

    cluster.close().await;
}

#[tokio::test]
async fn mutate_in_with_durability_floors_wire_timeout() {
    let (cluster, _node, state) = single_node_cluster().await;

    cluster
        .execute(KvRequest::new(
            doc_id("y"),
            KvOperation::Upsert {
                value: br#"{"a":1,"b":2}"#.to_vec(),
                flags: 0,
                expiry: 0,
                preserve_expiry: false,
            },
        ))
        .await
        .unwrap();

    let mut request = KvRequest::new(
        doc_id("y"),
        KvOperation::MutateIn {
            specs: vec![MutateInSpec::dict_upsert("baz", b"42".to_vec())],
            semantics: StoreSemantics::Replace,
            expiry: 0,
            preserve_expiry: false,
            access_deleted: false,
            create_as_deleted: false,
            revive_document: false,
            cas: 0,
        },
    );
    request.durability = DurabilityLevel::MajorityAndPersistToActive;
    request.timeout = Some(Duration::from_millis(1_500));
    cluster.execute(request).await.unwrap();

    let frames = state.durability_frames.lock().clone();
    assert_eq!(frames.len(), 1);
    let (level, timeout_ms) = frames[0];
    assert_eq!(level, 0x02);
    assert_eq!(timeout_ms, 1_350);

    let get = cluster
        .execute(KvRequest::new(doc_id("y"), KvOperation::Get))
        .await
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&get.value).unwrap();
    assert_eq!(value, json!({"a": 1, "b": 2, "baz": 42}));

    cluster.close().await;
}

#[tokio::test]
async fn missing_document_carries_error_context() {
    let (cluster, _node, _state) = single_node_cluster().await;

    let err = cluster
        .execute(KvRequest::new(doc_id("nope"), KvOperation::Get))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DocumentNotFound);
    let context = err.kv_context().unwrap();
    assert_eq!(context.status_code, Some(0x01));
    assert_eq!(context.key.as_deref(), Some("nope"));
    assert!(context.opaque.is_some());
    assert!(context.last_dispatched_to.is_some());

    cluster.close().await;
}

#[tokio::test]
async fn collection_qualified_op_needs_collections_feature() {
    let (cluster, _node, _state) = single_node_cluster().await;

    // The mock never negotiates collections, so a non-default collection
    // cannot be addressed.
    let id = DocumentId::new("default", "inventory", "hotels", "h1").unwrap();
    let err = cluster
        .execute(KvRequest::new(id, KvOperation::Get))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

    cluster.close().await;
}

#[tokio::test]
async fn not_my_vbucket_adopts_config_and_reroutes() {
    let state = Arc::new(ClusterState::default());
    let node0 = MockNode::start(0, Arc::clone(&state)).await;
    let node1 = MockNode::start(1, Arc::clone(&state)).await;

    // Start life as a single-node cluster on node 0.
    node0.set_config(config_document(
        1,
        1,
        &[("127.0.0.1", node0.port, None)],
        0,
    ));
    let cluster = Cluster::connect(options_for(node0.port)).await.unwrap();
    cluster.open_bucket("default").await.unwrap();

    // From now on node 0 bounces document ops with not-my-vbucket carrying
    // the two-node map whose active is node 1.
    let next = config_document(
        2,
        1,
        &[
            ("127.0.0.1", node0.port, None),
            ("127.0.0.1", node1.port, None),
        ],
        1,
    );
    node0.set_config(next.clone());
    node1.set_config(next);
    state.nmvb_remaining.store(1_000, Ordering::SeqCst);

    let response = cluster
        .execute(KvRequest::new(
            doc_id("moved"),
            KvOperation::Upsert {
                value: br#"{"here":true}"#.to_vec(),
                flags: 0,
                expiry: 0,
                preserve_expiry: false,
            },
        ))
        .await
        .unwrap();
    assert_ne!(response.cas, 0);

    let version = cluster.configuration_version().unwrap();
    assert_eq!((version.epoch, version.rev), (1, 2));
    assert!(state.documents.lock().contains_key(b"moved".as_slice()));

    cluster.close().await;
}

#[tokio::test]
async fn ping_and_diagnostics_report_sessions() {
    let (cluster, _node, _state) = single_node_cluster().await;

    let ping = cluster
        .ping(Some(vec![ServiceType::KeyValue]), Some("report-1".into()))
        .await
        .unwrap();
    assert_eq!(ping.version, 2);
    assert_eq!(ping.id, "report-1");
    let kv = &ping.services[&ServiceType::KeyValue];
    assert!(!kv.is_empty());
    assert!(kv.iter().all(|e| e.state == PingState::Ok));

    let diag = cluster.diagnostics(None);
    assert_eq!(diag.version, 2);
    let kv = &diag.services[&ServiceType::KeyValue];
    assert!(!kv.is_empty());
    assert!(kv.iter().any(|e| e.namespace.as_deref() == Some("default")));

    cluster.close().await;
}

#[tokio::test]
async fn operations_after_close_are_canceled() {
    let (cluster, _node, _state) = single_node_cluster().await;
    cluster.close().await;

    let err = cluster
        .execute(KvRequest::new(doc_id("foo"), KvOperation::Get))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RequestCanceled);
}
