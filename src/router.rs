use crate::catalog::{Catalog, RoutingTable, ShardId};
use crate::document::{Document, KeyValue};
use crate::error::{ErrorCode, ResourceType, ShardError};
use crate::pool::{ConnectionLease, PoolAccountant};
use crate::session::{SessionId, TxnNumber, WriteReply};
use crate::settings::{QueryShape, QuerySettingsStore};
use crate::shard::{Shard, ShardWriteRequest, WriteOp};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A client write as received by a router.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteCommand {
    pub session: Option<(SessionId, TxnNumber)>,
    pub operation: WriteOp,
}

impl WriteCommand {
    pub fn new(operation: WriteOp) -> Self {
        Self {
            session: None,
            operation,
        }
    }

    pub fn retryable(session: SessionId, txn_number: TxnNumber, operation: WriteOp) -> Self {
        Self {
            session: Some((session, txn_number)),
            operation,
        }
    }
}

/// Routes commands to shards using a cached copy of the routing table.
pub struct Router {
    name: String,
    catalog: Arc<Catalog>,
    shards: Arc<BTreeMap<ShardId, Arc<Shard>>>,
    pool: Arc<PoolAccountant>,
    settings: Arc<QuerySettingsStore>,
    cache: RwLock<HashMap<String, RoutingTable>>,
    max_stale_retries: usize,
}

impl Router {
    pub fn new(
        name: impl Into<String>,
        catalog: Arc<Catalog>,
        shards: Arc<BTreeMap<ShardId, Arc<Shard>>>,
        pool: Arc<PoolAccountant>,
        settings: Arc<QuerySettingsStore>,
        max_stale_retries: usize,
    ) -> Self {
        Self {
            name: name.into(),
            catalog,
            shards,
            pool,
            settings,
            cache: RwLock::new(HashMap::new()),
            max_stale_retries,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cached routing table of `ns`, loaded on first use.
    pub fn routing_table(&self, ns: &str) -> Result<RoutingTable, ShardError> {
        if let Some(table) = self.cache.read().get(ns) {
            return Ok(table.clone());
        }
        self.refresh(ns)
    }

    pub fn refresh(&self, ns: &str) -> Result<RoutingTable, ShardError> {
        let table = self.catalog.routing_table(ns)?;
        self.cache.write().insert(ns.to_string(), table.clone());
        Ok(table)
    }

    pub fn invalidate(&self, ns: &str) {
        self.cache.write().remove(ns);
    }

    fn shard(&self, id: &str) -> Result<&Arc<Shard>, ShardError> {
        self.shards.get(id).ok_or_else(|| ShardError::NotFound {
            resource_type: ResourceType::Shard,
            resource_id: id.to_string(),
        })
    }

    fn host_of(&self, id: &str) -> String {
        self.catalog
            .shards()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.host)
            .unwrap_or_else(|| id.to_string())
    }

    /// Executes a write, retrying against refreshed routing when a shard
    /// reports that the cached placement is stale.
    pub async fn execute(&self, ns: &str, command: WriteCommand) -> Result<WriteReply, ShardError> {
        let shape = QueryShape::new(ns, command.operation.kind(), command.operation.filter());
        self.settings.check(&shape)?;
        let mut attempt = 0;
        loop {
            let table = self.routing_table(ns)?;
            let target = self.target(&table, ns, &command.operation)?;
            let request = ShardWriteRequest {
                ns: ns.to_string(),
                session: command.session,
                op: command.operation.clone(),
                version: table.key_pattern.as_ref().and(table.version),
            };
            let result = self.send(&target, request).await;
            match result {
                Err(err) if err.code() == ErrorCode::StaleConfig && attempt < self.max_stale_retries => {
                    attempt += 1;
                    debug!(router = %self.name, ns, shard = %target, attempt, error = %err, "retrying write after stale routing");
                    self.invalidate(ns);
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(router = %self.name, ns, shard = %target, error = %err, "write failed with retryable error");
                    }
                    return Err(err);
                }
                Ok(reply) => return Ok(reply),
            }
        }
    }

    async fn send(&self, target: &str, request: ShardWriteRequest) -> Result<WriteReply, ShardError> {
        let shard = Arc::clone(self.shard(target)?);
        let host = self.host_of(target);
        let started = Instant::now();
        let lease = ConnectionLease::acquire(&self.pool, &host, &self.name, Duration::ZERO)?;
        let result = shard.execute_write(request).await;
        drop(lease);
        debug!(router = %self.name, shard = %target, elapsed_us = started.elapsed().as_micros() as u64, "shard write returned");
        result
    }

    /// The shard a single-document write goes to.
    fn target(&self, table: &RoutingTable, ns: &str, op: &WriteOp) -> Result<ShardId, ShardError> {
        let Some(pattern) = &table.key_pattern else {
            return Ok(table.primary_shard.clone());
        };
        let owner_of = |key: &KeyValue| {
            table
                .owner_of(key)
                .map(|c| c.shard.clone())
                .ok_or_else(|| ShardError::ChunkNotFound {
                    ns: ns.to_string(),
                    key: key.to_string(),
                })
        };
        if let WriteOp::Insert { documents } = op {
            let mut target: Option<ShardId> = None;
            for doc in documents {
                let key = pattern
                    .extract(doc)
                    .ok_or_else(|| ShardError::ShardKeyNotFound { ns: ns.to_string() })?;
                let owner = owner_of(&key)?;
                match &target {
                    Some(t) if *t != owner => {
                        return Err(ShardError::Validation(format!(
                            "insert batch on '{ns}' spans shards {t} and {owner}"
                        )));
                    }
                    Some(_) => {}
                    None => target = Some(owner),
                }
            }
            return target.ok_or_else(|| ShardError::Validation("empty insert batch".into()));
        }
        let filter = op.filter().cloned().unwrap_or_default();
        if let Some(key) = pattern.extract_from_filter(&filter) {
            return owner_of(&key);
        }
        if let Some(found) = self.locate_by_id(table, ns, &filter) {
            return Ok(found);
        }
        let shards = table.shards();
        match shards.as_slice() {
            [only] => Ok(only.clone()),
            _ => Err(ShardError::ShardKeyNotFound { ns: ns.to_string() }),
        }
    }

    /// Asks every shard holding chunks which one owns the document an
    /// `_id`-only filter matches.
    fn locate_by_id(&self, table: &RoutingTable, ns: &str, filter: &Document) -> Option<ShardId> {
        table.shards().into_iter().find(|id| {
            self.shards
                .get(id)
                .and_then(|shard| shard.locate(ns, filter))
                .is_some_and(|key| table.owner_of(&key).is_some_and(|c| &c.shard == id))
        })
    }

    /// Scatter-gather read of owned documents.
    pub fn find(&self, ns: &str, filter: &Document) -> Result<Vec<Document>, ShardError> {
        self.settings.check(&QueryShape::new(ns, "find", Some(filter)))?;
        let table = self.routing_table(ns)?;
        let mut out = Vec::new();
        for id in table.shards() {
            out.extend(self.shard(&id)?.find(ns, filter));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::{Router, WriteCommand};
    use crate::catalog::{Catalog, CollectionKind};
    use crate::config::ClusterConfig;
    use crate::document::{ShardKeyPattern, to_document};
    use crate::pool::PoolAccountant;
    use crate::settings::{QueryShape, QuerySettings, QuerySettingsStore};
    use crate::shard::{Shard, WriteOp};
    use crate::storage::CollectionOptions;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn router_over_one_shard(dir: &std::path::Path) -> (Router, Arc<QuerySettingsStore>, Arc<PoolAccountant>) {
        let catalog = Arc::new(Catalog::in_memory());
        catalog.add_shard("shard0", "h0:27018").expect("shard");
        catalog.enable_sharding("db", Some("shard0")).expect("db");
        let entry = catalog
            .create_collection("db.c", CollectionKind::Collection, None)
            .expect("create");
        let shard = Shard::open("shard0", dir.join("s0"), ClusterConfig::testing(), catalog.clone())
            .expect("open");
        shard
            .create_local_collection("db.c", CollectionOptions::new(entry.uuid))
            .expect("local");
        catalog.shard_collection("db.c", ShardKeyPattern::new("x")).expect("shard");
        shard.refresh_metadata("db.c");
        let mut shards = BTreeMap::new();
        shards.insert("shard0".to_string(), shard);
        let settings = Arc::new(QuerySettingsStore::new());
        let pool = Arc::new(PoolAccountant::new(None));
        let router = Router::new("router0", catalog, Arc::new(shards), pool.clone(), settings.clone(), 3);
        (router, settings, pool)
    }

    #[tokio::test]
    async fn writes_lease_a_connection_per_shard_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (router, _, pool) = router_over_one_shard(dir.path());
        let doc = to_document(json!({"_id": 1, "x": 5})).expect("doc");
        let reply = router
            .execute("db.c", WriteCommand::new(WriteOp::Insert { documents: vec![doc] }))
            .await
            .expect("insert");
        assert_eq!(reply.n, 1);
        let stats = pool.snapshot().expect("stats");
        assert_eq!(stats.total_executed, 1);
        assert_eq!(stats.total_in_use, 0);
        assert_eq!(stats.hosts["h0:27018"].pool_state["router0"].available, 1);
    }

    #[tokio::test]
    async fn rejected_shape_never_reaches_a_shard() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (router, settings, pool) = router_over_one_shard(dir.path());
        let filter = to_document(json!({"x": 5})).expect("filter");
        settings
            .set(QueryShape::new("db.c", "delete", Some(&filter)), QuerySettings { reject: true })
            .expect("set");
        let err = router
            .execute("db.c", WriteCommand::new(WriteOp::Delete { filter }))
            .await
            .expect_err("rejected");
        assert_eq!(err.code_str(), "query_rejected_by_settings");
        assert_eq!(pool.snapshot().expect("stats").total_connection_acquisition_requests, 0);
    }
}
