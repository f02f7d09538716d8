use docshard::config::ClusterConfig;
use docshard::document::to_document;
use docshard::{Cluster, QuerySettings, QueryShape, SessionId, WriteCommand, WriteOp};
use serde_json::{Value, json};
use tempfile::tempdir;

const NS: &str = "test.retries";

fn cluster(dir: &std::path::Path) -> Cluster {
    let cluster = Cluster::open(dir, ClusterConfig::testing(), &["shard0"]).expect("open");
    cluster.enable_sharding("test", Some("shard0")).expect("db");
    cluster.create_collection(NS).expect("create");
    cluster
}

fn inc_counter() -> WriteOp {
    WriteOp::Update {
        filter: to_document(json!({"_id": 1})).expect("filter"),
        update: json!({"$inc": {"counter": 1}}),
        upsert: false,
    }
}

fn counter(cluster: &Cluster) -> Option<Value> {
    let docs = cluster
        .shard("shard0")
        .expect("shard0")
        .find(NS, &to_document(json!({"_id": 1})).expect("filter"));
    docs.first().and_then(|d| d.get("counter").cloned())
}

#[tokio::test]
async fn retried_update_returns_the_first_reply_without_reapplying() {
    let dir = tempdir().expect("tempdir");
    let cluster = cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 1, "counter": 0})).expect("doc")],
            }),
        )
        .await
        .expect("insert");

    let session = SessionId::new();
    let first = router
        .execute(NS, WriteCommand::retryable(session, 1, inc_counter()))
        .await
        .expect("first");
    assert_eq!(first.n, 1);
    assert!(first.updated_existing);

    let logged = cluster.shard("shard0").expect("shard0").oplog().len();
    for _ in 0..3 {
        let retried = router
            .execute(NS, WriteCommand::retryable(session, 1, inc_counter()))
            .await
            .expect("retry");
        assert_eq!(retried, first);
    }
    assert_eq!(counter(&cluster), Some(json!(1)));
    assert_eq!(cluster.shard("shard0").expect("shard0").oplog().len(), logged);

    router
        .execute(NS, WriteCommand::retryable(session, 2, inc_counter()))
        .await
        .expect("next txn");
    assert_eq!(counter(&cluster), Some(json!(2)));

    let err = router
        .execute(NS, WriteCommand::retryable(session, 1, inc_counter()))
        .await
        .expect_err("older txn");
    assert_eq!(err.code_str(), "transaction_too_old");
    assert_eq!(counter(&cluster), Some(json!(2)));
}

#[tokio::test]
async fn retried_delete_keeps_its_original_count() {
    let dir = tempdir().expect("tempdir");
    let cluster = cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 1})).expect("doc")],
            }),
        )
        .await
        .expect("insert");

    let session = SessionId::new();
    let delete = || WriteOp::Delete {
        filter: to_document(json!({"_id": 1})).expect("filter"),
    };
    let first = router
        .execute(NS, WriteCommand::retryable(session, 5, delete()))
        .await
        .expect("delete");
    assert_eq!(first.n, 1);
    let retried = router
        .execute(NS, WriteCommand::retryable(session, 5, delete()))
        .await
        .expect("retry");
    assert_eq!(retried.n, 1);

    let plain = router
        .execute(NS, WriteCommand::new(delete()))
        .await
        .expect("non-retryable delete");
    assert_eq!(plain.n, 0);
}

#[tokio::test]
async fn sessions_are_independent() {
    let dir = tempdir().expect("tempdir");
    let cluster = cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 1, "counter": 0})).expect("doc")],
            }),
        )
        .await
        .expect("insert");

    let (a, b) = (SessionId::new(), SessionId::new());
    let (ra, rb) = tokio::join!(
        router.execute(NS, WriteCommand::retryable(a, 1, inc_counter())),
        router.execute(NS, WriteCommand::retryable(b, 1, inc_counter())),
    );
    ra.expect("a");
    rb.expect("b");
    assert_eq!(counter(&cluster), Some(json!(2)));

    let shard = cluster.shard("shard0").expect("shard0");
    let sessions = shard.sessions();
    assert_eq!(sessions.get(a).map(|r| r.txn_number), Some(1));
    assert_eq!(sessions.get(b).map(|r| r.txn_number), Some(1));
}

#[tokio::test]
async fn rejected_shape_fails_but_raw_data_is_exempt() {
    let dir = tempdir().expect("tempdir");
    let cluster = cluster(dir.path());
    let router = cluster.new_router("router0");
    let logged = cluster.shard("shard0").expect("shard0").oplog().len();
    let filter = to_document(json!({"_id": 1})).expect("filter");
    let shape = QueryShape::new(NS, "update", Some(&filter));
    cluster
        .settings()
        .set(shape.clone(), QuerySettings { reject: true })
        .expect("set");

    let err = router
        .execute(NS, WriteCommand::new(inc_counter()))
        .await
        .expect_err("rejected");
    assert_eq!(err.code_str(), "query_rejected_by_settings");
    assert_eq!(cluster.shard("shard0").expect("shard0").oplog().len(), logged);

    let other_shape = router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Update {
                filter: to_document(json!({"name": "x"})).expect("filter"),
                update: json!({"$set": {"seen": true}}),
                upsert: false,
            }),
        )
        .await
        .expect("different filter fields");
    assert_eq!(other_shape.n, 0);

    let raw = shape.clone().raw();
    assert!(cluster.settings().check(&raw).is_ok());
    let err = cluster
        .settings()
        .set(raw, QuerySettings { reject: true })
        .expect_err("rawData shapes cannot carry settings");
    assert_eq!(err.code_str(), "validation");

    assert!(cluster.settings().remove(&shape).is_some());
    router
        .execute(NS, WriteCommand::new(inc_counter()))
        .await
        .expect("allowed after removal");
}
