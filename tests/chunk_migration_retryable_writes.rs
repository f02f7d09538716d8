use docshard::config::ClusterConfig;
use docshard::document::to_document;
use docshard::migration::{FetchControl, MigrationHooks, MigrationPhase, PausePoint};
use docshard::shard::ShardWriteRequest;
use docshard::{Cluster, KeyValue, SessionId, WriteCommand, WriteOp};
use serde_json::json;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::Instant;

const NS: &str = "test.retryable";

fn sharded_cluster(dir: &std::path::Path) -> Cluster {
    let cluster = Cluster::open(dir, ClusterConfig::testing(), &["shard0", "shard1"]).expect("open");
    cluster.enable_sharding("test", Some("shard0")).expect("db");
    cluster.create_collection(NS).expect("create");
    cluster.shard_collection(NS, "x").expect("shard");
    cluster.split_chunk(NS, KeyValue::number(1.0)).expect("split");
    cluster
}

fn find_and_inc() -> WriteOp {
    WriteOp::FindAndModify {
        query: to_document(json!({"_id": 1})).expect("query"),
        update: Some(json!({"$inc": {"counter": 1}})),
        remove: false,
        upsert: false,
        return_new: true,
    }
}

#[tokio::test]
async fn retried_find_and_modify_after_migration_is_not_reapplied() {
    let dir = tempdir().expect("tempdir");
    let cluster = sharded_cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 1, "x": 1})).expect("doc")],
            }),
        )
        .await
        .expect("insert");

    let fetch = FetchControl::paused();
    let hooks = MigrationHooks {
        session_fetch: Some(fetch.clone()),
        ..MigrationHooks::default()
    };
    let migration = cluster
        .start_migration(NS, &KeyValue::number(1.0), "shard1", &hooks)
        .expect("start");
    migration.clone_range().await.expect("clone");
    migration.catch_up().await.expect("catch up");

    let session = SessionId::new();
    let first = router
        .execute(NS, WriteCommand::retryable(session, 0, find_and_inc()))
        .await
        .expect("first attempt");
    assert_eq!(first.value.as_ref().and_then(|v| v.get("counter")), Some(&json!(1)));

    fetch.resume();
    let counter = migration.enter_critical_section().await.expect("critical section");
    assert_eq!(counter, 1);
    assert_eq!(
        cluster
            .chunk_cache_document("shard0", NS)
            .expect("cache doc")
            .enter_critical_section_counter,
        1
    );
    migration.commit().await.expect("commit");
    assert_eq!(migration.phase(), MigrationPhase::Committed);

    let retried = router
        .execute(NS, WriteCommand::retryable(session, 0, find_and_inc()))
        .await
        .expect("retry");
    assert_eq!(retried, first);

    let recipient = cluster.shard("shard1").expect("shard1");
    let docs = recipient.find(NS, &to_document(json!({"_id": 1})).expect("filter"));
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get("counter"), Some(&json!(1)));
    assert!(
        cluster
            .shard("shard0")
            .expect("shard0")
            .find_raw(NS, &to_document(json!({"_id": 1})).expect("filter"))
            .is_empty()
    );
}

#[tokio::test]
async fn write_parked_by_critical_section_fails_stale_after_commit() {
    let dir = tempdir().expect("tempdir");
    let cluster = sharded_cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 7, "x": 5})).expect("doc")],
            }),
        )
        .await
        .expect("insert");
    let version = router.routing_table(NS).expect("table").version;

    let migration = cluster
        .start_migration(NS, &KeyValue::number(5.0), "shard1", &MigrationHooks::default())
        .expect("start");
    migration.clone_range().await.expect("clone");
    migration.catch_up().await.expect("catch up");
    migration.enter_critical_section().await.expect("critical section");

    let donor = cluster.shard("shard0").expect("shard0");
    let parked = donor.execute_write(ShardWriteRequest {
        ns: NS.to_string(),
        session: None,
        op: WriteOp::Update {
            filter: to_document(json!({"x": 5})).expect("filter"),
            update: json!({"$set": {"y": 1}}),
            upsert: false,
        },
        version,
    });
    let committing = async {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(donor.gates().inflight(NS), 0);
        migration.commit().await
    };
    let (write, commit) = tokio::join!(parked, committing);
    commit.expect("commit");
    let err = write.expect_err("parked write must not apply on the old owner");
    assert_eq!(err.code_str(), "stale_config");
    assert!(err.is_retryable());

    let recipient = cluster.shard("shard1").expect("shard1");
    let docs = recipient.find(NS, &to_document(json!({"_id": 7})).expect("filter"));
    assert_eq!(docs[0].get("y"), None);
}

#[tokio::test]
async fn abort_restores_donor_ownership_and_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let cluster = sharded_cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 3, "x": 9})).expect("doc")],
            }),
        )
        .await
        .expect("insert");
    let before = router.routing_table(NS).expect("table");

    let migration = cluster
        .start_migration(NS, &KeyValue::number(9.0), "shard1", &MigrationHooks::default())
        .expect("start");
    let again = cluster.start_migration(NS, &KeyValue::number(9.0), "shard1", &MigrationHooks::default());
    assert_eq!(again.err().map(|e| e.code_str()), Some("already_migrating"));

    migration.clone_range().await.expect("clone");
    migration.catch_up().await.expect("catch up");
    migration.enter_critical_section().await.expect("critical section");
    assert_eq!(migration.abort("operator request").await.expect("abort"), MigrationPhase::Aborted);
    assert_eq!(migration.abort("again").await.expect("abort"), MigrationPhase::Aborted);
    assert_eq!(migration.commit().await.err().map(|e| e.code_str()), Some("migration_aborted"));

    let after = router.refresh(NS).expect("table");
    assert_eq!(after.chunks, before.chunks);
    assert!(cluster.catalog().active_migrations().is_empty());
    assert_eq!(cluster.shard("shard1").expect("shard1").count(NS), 0);

    let reply = router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Update {
                filter: to_document(json!({"x": 9})).expect("filter"),
                update: json!({"$set": {"after": true}}),
                upsert: false,
            }),
        )
        .await
        .expect("write after abort");
    assert_eq!(reply.n, 1);
}

#[tokio::test]
async fn move_chunk_keeps_session_fetch_paused_through_the_critical_section() {
    let dir = tempdir().expect("tempdir");
    let cluster = sharded_cluster(dir.path());
    let router = cluster.new_router("router0");
    router
        .execute(
            NS,
            WriteCommand::new(WriteOp::Insert {
                documents: vec![to_document(json!({"_id": 1, "x": 1})).expect("doc")],
            }),
        )
        .await
        .expect("insert");

    let pause = PausePoint::new();
    let fetch = FetchControl::paused();
    let hooks = MigrationHooks {
        before_critical_section: Some(pause.clone()),
        session_fetch: Some(fetch.clone()),
    };
    let session = SessionId::new();
    let split_key = KeyValue::number(1.0);
    let moving = cluster.move_chunk(NS, &split_key, "shard1", hooks);
    let driving = async {
        pause.wait_reached().await;
        let first = router
            .execute(NS, WriteCommand::retryable(session, 0, find_and_inc()))
            .await
            .expect("first attempt");
        pause.release();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let counter = cluster
                .chunk_cache_document("shard0", NS)
                .expect("cache doc")
                .enter_critical_section_counter;
            if counter == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "critical section never entered");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(fetch.is_paused());
        fetch.resume();
        first
    };
    let (moved, first) = tokio::join!(moving, driving);
    moved.expect("move");
    assert_eq!(first.value.as_ref().and_then(|v| v.get("counter")), Some(&json!(1)));

    let retried = router
        .execute(NS, WriteCommand::retryable(session, 0, find_and_inc()))
        .await
        .expect("retry");
    assert_eq!(retried, first);
    assert_eq!(
        cluster
            .chunk_cache_document("shard0", NS)
            .expect("cache doc")
            .enter_critical_section_counter,
        1
    );
    let docs = cluster
        .shard("shard1")
        .expect("shard1")
        .find(NS, &to_document(json!({"_id": 1})).expect("filter"));
    assert_eq!(docs[0].get("counter"), Some(&json!(1)));
}

#[tokio::test]
async fn apply_ops_on_the_migrating_range_waits_for_the_critical_section() {
    let dir = tempdir().expect("tempdir");
    let cluster = sharded_cluster(dir.path());
    let migration = cluster
        .start_migration(NS, &KeyValue::number(5.0), "shard1", &MigrationHooks::default())
        .expect("start");
    migration.clone_range().await.expect("clone");
    migration.catch_up().await.expect("catch up");
    migration.enter_critical_section().await.expect("critical section");

    let outside = cluster
        .apply_ops(
            "test",
            vec![json!({"op": "i", "ns": NS, "o": {"_id": 60, "x": -5}})],
        )
        .await
        .expect("range below the migrating chunk is not blocked");
    assert_eq!(outside, 1);

    let parked = cluster.apply_ops(
        "test",
        vec![json!({"op": "i", "ns": NS, "o": {"_id": 50, "x": 6}})],
    );
    let committing = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        migration.commit().await
    };
    let (applied, commit) = tokio::join!(parked, committing);
    commit.expect("commit");
    let err = applied.expect_err("the donor no longer owns x:6");
    assert_eq!(err.code_str(), "stale_config");

    let filter = to_document(json!({"_id": 50})).expect("filter");
    assert!(cluster.shard("shard0").expect("shard0").find_raw(NS, &filter).is_empty());
    assert!(cluster.shard("shard1").expect("shard1").find_raw(NS, &filter).is_empty());
    assert_eq!(cluster.shard("shard0").expect("shard0").count(NS), 1);
}

#[tokio::test]
async fn multi_collection_apply_ops_during_clone_reaches_the_recipient() {
    let dir = tempdir().expect("tempdir");
    let cluster = sharded_cluster(dir.path());
    cluster.create_collection("test.other").expect("other");
    let migration = cluster
        .start_migration(NS, &KeyValue::number(5.0), "shard1", &MigrationHooks::default())
        .expect("start");
    migration.clone_range().await.expect("clone");

    cluster
        .apply_ops(
            "test",
            vec![
                json!({"op": "i", "ns": "test.other", "o": {"_id": 1}}),
                json!({"op": "i", "ns": NS, "o": {"_id": 5, "x": 5}}),
            ],
        )
        .await
        .expect("applyOps");

    migration.catch_up().await.expect("catch up");
    migration.enter_critical_section().await.expect("critical section");
    migration.commit().await.expect("commit");

    let filter = to_document(json!({"_id": 5})).expect("filter");
    assert_eq!(cluster.shard("shard1").expect("shard1").find(NS, &filter).len(), 1);
    assert!(cluster.shard("shard0").expect("shard0").find_raw(NS, &filter).is_empty());
    assert_eq!(cluster.shard("shard0").expect("shard0").count("test.other"), 1);
}
