use docshard::config::ClusterConfig;
use docshard::document::to_document;
use docshard::{Cluster, KeyValue};
use serde_json::json;
use tempfile::tempdir;

fn record_id_of(cluster: &Cluster, ns: &str, id: i64) -> Option<i64> {
    cluster
        .shard("shard0")
        .expect("shard0")
        .with_storage(|s| s.collection(ns).and_then(|c| c.record_id(&KeyValue::number(id as f64))))
}

#[tokio::test]
async fn rid_is_ignored_without_replicated_record_ids() {
    let dir = tempdir().expect("tempdir");
    let cluster = Cluster::open(dir.path(), ClusterConfig::testing(), &["shard0"]).expect("open");
    cluster.enable_sharding("test", Some("shard0")).expect("db");
    cluster.create_collection("test.plain").expect("create");

    let applied = cluster
        .apply_ops(
            "test",
            vec![
                json!({"op": "i", "ns": "test.plain", "o": {"_id": 1, "a": 1}, "rid": 42}),
                json!({"op": "u", "ns": "test.plain", "o": {"$set": {"a": 2}}, "o2": {"_id": 1}, "rid": 42}),
            ],
        )
        .await
        .expect("applyOps must not fail on rid");
    assert_eq!(applied, 2);

    let shard = cluster.shard("shard0").expect("shard0");
    let docs = shard.find("test.plain", &to_document(json!({"_id": 1})).expect("filter"));
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get("a"), Some(&json!(2)));
    assert_eq!(docs[0].get("rid"), None);
    assert_eq!(record_id_of(&cluster, "test.plain", 1), None);
}

#[tokio::test]
async fn rid_is_kept_when_collection_replicates_record_ids() {
    let dir = tempdir().expect("tempdir");
    let config = ClusterConfig {
        replicated_record_ids_enabled: true,
        ..ClusterConfig::testing()
    };
    let cluster = Cluster::open(dir.path(), config, &["shard0"]).expect("open");
    cluster.enable_sharding("test", Some("shard0")).expect("db");
    cluster.create_collection_with("test.rid", true).expect("create");
    cluster
        .apply_ops(
            "test",
            vec![json!({"op": "i", "ns": "test.rid", "o": {"_id": 1}, "rid": 7})],
        )
        .await
        .expect("applyOps");
    assert_eq!(record_id_of(&cluster, "test.rid", 1), Some(7));
}

#[tokio::test]
async fn failing_apply_ops_batch_changes_nothing() {
    let dir = tempdir().expect("tempdir");
    let cluster = Cluster::open(dir.path(), ClusterConfig::testing(), &["shard0"]).expect("open");
    cluster.enable_sharding("test", Some("shard0")).expect("db");
    cluster.create_collection("test.plain").expect("create");
    let shard = cluster.shard("shard0").expect("shard0");
    let logged = shard.oplog().len();

    let result = cluster
        .apply_ops(
            "test",
            vec![
                json!({"op": "i", "ns": "test.plain", "o": {"_id": 1}}),
                json!({"op": "u", "ns": "test.plain", "o": {"$set": {"a": 1}}, "o2": {"_id": 99}}),
            ],
        )
        .await;
    assert!(result.is_err());
    assert_eq!(shard.count("test.plain"), 0);
    assert_eq!(shard.oplog().len(), logged);
}
