use docshard::config::ClusterConfig;
use docshard::document::to_document;
use docshard::shard::ShardWriteRequest;
use docshard::{Cluster, KeyValue, MigrationHooks, WriteCommand, WriteOp};
use serde_json::json;
use tempfile::tempdir;

const NS: &str = "test.stale";

async fn moved_cluster(dir: &std::path::Path) -> (Cluster, docshard::Router) {
    let cluster = Cluster::open(dir, ClusterConfig::testing(), &["shard0", "shard1"]).expect("open");
    cluster.enable_sharding("test", Some("shard0")).expect("db");
    cluster.create_collection(NS).expect("create");
    cluster.shard_collection(NS, "x").expect("shard");
    cluster.split_chunk(NS, KeyValue::number(10.0)).expect("split");

    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 1, "x": 1})).expect("doc")],
            }),
        )
        .await
        .expect("low insert");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 2, "x": 20})).expect("doc")],
            }),
        )
        .await
        .expect("high insert");

    cluster
        .move_chunk(NS, &KeyValue::number(20.0), "shard1", MigrationHooks::default())
        .await
        .expect("move");
    (cluster, router)
}

fn set_y(x: i64) -> WriteOp {
    WriteOp::Update {
        filter: to_document(json!({"x": x})).expect("filter"),
        update: json!({"$set": {"y": true}}),
        upsert: false,
    }
}

#[tokio::test]
async fn router_with_stale_cache_retries_on_the_new_owner() {
    let dir = tempdir().expect("tempdir");
    let (cluster, router) = moved_cluster(dir.path()).await;
    let cached = router.routing_table(NS).expect("cached");
    assert_eq!(cached.owner_of(&KeyValue::number(20.0)).map(|c| c.shard.as_str()), Some("shard0"));

    let reply = router.execute(NS, WriteCommand::new(set_y(20))).await.expect("update");
    assert_eq!(reply.n, 1);

    let refreshed = router.routing_table(NS).expect("refreshed");
    assert_eq!(refreshed.version, cluster.catalog().routing_table(NS).expect("catalog").version);
    assert_eq!(
        refreshed.owner_of(&KeyValue::number(20.0)).map(|c| c.shard.as_str()),
        Some("shard1")
    );

    let filter = to_document(json!({"_id": 2})).expect("filter");
    let docs = cluster.shard("shard1").expect("shard1").find(NS, &filter);
    assert_eq!(docs[0].get("y"), Some(&json!(true)));
    assert!(cluster.shard("shard0").expect("shard0").find(NS, &filter).is_empty());

    let low = router.execute(NS, WriteCommand::new(set_y(1))).await.expect("donor still owns low");
    assert_eq!(low.n, 1);
}

#[tokio::test]
async fn shard_rejects_an_old_version_as_retryable_stale_config() {
    let dir = tempdir().expect("tempdir");
    let (cluster, router) = moved_cluster(dir.path()).await;
    let old = router.routing_table(NS).expect("cached").version;
    let donor = cluster.shard("shard0").expect("shard0");

    let err = donor
        .execute_write(ShardWriteRequest {
            ns: NS.to_string(),
            session: None,
            op: set_y(1),
            version: old,
        })
        .await
        .expect_err("old version");
    assert_eq!(err.code_str(), "stale_config");
    assert!(err.is_retryable());
    let filter = to_document(json!({"_id": 1})).expect("filter");
    assert_eq!(donor.find(NS, &filter)[0].get("y"), None);
}

#[tokio::test]
async fn current_version_for_a_moved_key_is_still_stale_on_the_donor() {
    let dir = tempdir().expect("tempdir");
    let (cluster, _router) = moved_cluster(dir.path()).await;
    let current = cluster.catalog().routing_table(NS).expect("table").version;
    let donor = cluster.shard("shard0").expect("shard0");

    let err = donor
        .execute_write(ShardWriteRequest {
            ns: NS.to_string(),
            session: None,
            op: WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 3, "x": 30})).expect("doc")],
            },
            version: current,
        })
        .await
        .expect_err("donor no longer owns x:30");
    assert_eq!(err.code_str(), "stale_config");
    assert_eq!(donor.count(NS), 1);

    let ok = donor
        .execute_write(ShardWriteRequest {
            ns: NS.to_string(),
            session: None,
            op: WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 4, "x": 4})).expect("doc")],
            },
            version: current,
        })
        .await
        .expect("donor owns x:4");
    assert_eq!(ok.n, 1);
}
