use crate::catalog::{
    Catalog, ChunkVersion, CollectionEntry, CollectionKind, DatabaseEntry, ShardId, db_name,
};
use crate::config::ClusterConfig;
use crate::consistency::{
    CheckOptions, CheckScope, ClusterView, Inconsistency, InconsistencyFilter, LocalShardView,
    check_metadata_consistency,
};
use crate::document::{KeyValue, ShardKeyPattern};
use crate::error::{ResourceType, ShardError};
use crate::migration::{MigrationCoordinator, MigrationHooks};
use crate::pool::{ConnPoolStats, PoolAccountant};
use crate::router::Router;
use crate::settings::QuerySettingsStore;
use crate::shard::{ChunkCacheDocument, CollectionMetadata, Shard};
use crate::storage::{CollectionOptions, TimeseriesOptions};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const CATALOG_FILE: &str = "config.json";
const BUCKETS_PREFIX: &str = "system.buckets.";

/// A config catalog plus a fixed set of shards sharing one directory.
pub struct Cluster {
    dir: PathBuf,
    config: ClusterConfig,
    catalog: Arc<Catalog>,
    shards: Arc<BTreeMap<ShardId, Arc<Shard>>>,
    pool: Arc<PoolAccountant>,
    settings: Arc<QuerySettingsStore>,
}

impl Cluster {
    /// Opens (or creates) the catalog at `dir/config.json` and one shard per
    /// id under `dir/<id>`.
    pub fn open(dir: impl Into<PathBuf>, config: ClusterConfig, shard_ids: &[&str]) -> Result<Self, ShardError> {
        config.validate()?;
        if shard_ids.is_empty() {
            return Err(ShardError::Validation("a cluster needs at least one shard".into()));
        }
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let catalog = Arc::new(Catalog::open(dir.join(CATALOG_FILE))?);
        let mut shards = BTreeMap::new();
        for id in shard_ids {
            if !catalog.has_shard(id) {
                catalog.add_shard(id, &format!("{id}.local:27018"))?;
            }
            let shard = Shard::open(*id, dir.join(id), config.clone(), Arc::clone(&catalog))?;
            shards.insert(id.to_string(), shard);
        }
        info!(dir = %dir.display(), shards = shards.len(), "cluster opened");
        Ok(Self {
            dir,
            pool: Arc::new(PoolAccountant::new(config.pool_hard_cap)),
            config,
            catalog,
            shards: Arc::new(shards),
            settings: Arc::new(QuerySettingsStore::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn shard(&self, id: &str) -> Option<Arc<Shard>> {
        self.shards.get(id).cloned()
    }

    pub fn shards(&self) -> impl Iterator<Item = &Arc<Shard>> {
        self.shards.values()
    }

    pub fn pool(&self) -> &Arc<PoolAccountant> {
        &self.pool
    }

    pub fn settings(&self) -> &Arc<QuerySettingsStore> {
        &self.settings
    }

    /// A router with an empty routing cache, accounted under pool `name`.
    pub fn new_router(&self, name: &str) -> Router {
        Router::new(
            name,
            Arc::clone(&self.catalog),
            Arc::clone(&self.shards),
            Arc::clone(&self.pool),
            Arc::clone(&self.settings),
            self.config.router_max_stale_retries,
        )
    }

    fn require_shard(&self, id: &str) -> Result<&Arc<Shard>, ShardError> {
        self.shards.get(id).ok_or_else(|| ShardError::NotFound {
            resource_type: ResourceType::Shard,
            resource_id: id.to_string(),
        })
    }

    fn primary_of(&self, ns: &str) -> Result<&Arc<Shard>, ShardError> {
        let db = db_name(ns);
        let entry = self.catalog.database(db).ok_or_else(|| ShardError::NotFound {
            resource_type: ResourceType::Database,
            resource_id: db.to_string(),
        })?;
        self.require_shard(&entry.primary_shard)
    }

    fn refresh_everywhere(&self, ns: &str) {
        for shard in self.shards.values() {
            shard.refresh_metadata(ns);
        }
    }

    // DDL. Every operation holds the in-flight DDL registration for its
    // resource until it returns.

    pub fn enable_sharding(&self, db: &str, primary: Option<&str>) -> Result<DatabaseEntry, ShardError> {
        let _ddl = self.catalog.begin_ddl(db)?;
        if let Some(id) = primary {
            self.require_shard(id)?;
        }
        self.catalog.enable_sharding(db, primary)
    }

    pub fn create_collection(&self, ns: &str) -> Result<CollectionEntry, ShardError> {
        self.create_collection_with(ns, false)
    }

    /// Creates `ns` in the catalog and on the database primary. A local
    /// failure removes the catalog entry again.
    pub fn create_collection_with(&self, ns: &str, record_ids_replicated: bool) -> Result<CollectionEntry, ShardError> {
        let _ddl = self.catalog.begin_ddl(ns)?;
        let entry = self.catalog.create_collection(ns, CollectionKind::Collection, None)?;
        let mut options = CollectionOptions::new(entry.uuid);
        options.record_ids_replicated = record_ids_replicated;
        self.create_on_primary(&entry, options)?;
        info!(ns, uuid = %entry.uuid, "collection created");
        Ok(entry)
    }

    fn create_on_primary(&self, entry: &CollectionEntry, options: CollectionOptions) -> Result<(), ShardError> {
        let created = self
            .primary_of(&entry.ns)
            .and_then(|primary| primary.create_local_collection(&entry.ns, options));
        if let Err(err) = created {
            warn!(ns = %entry.ns, error = %err, "local create failed; removing catalog entry");
            self.catalog.drop_collection(&entry.ns)?;
            return Err(err);
        }
        Ok(())
    }

    /// Creates the view `ns` over the buckets collection
    /// `<db>.system.buckets.<coll>`. Returns the buckets entry.
    pub fn create_timeseries_collection(
        &self,
        ns: &str,
        options: TimeseriesOptions,
    ) -> Result<CollectionEntry, ShardError> {
        let _ddl = self.catalog.begin_ddl(ns)?;
        if options.time_field.is_empty() {
            return Err(ShardError::Validation("timeseries collections need a timeField".into()));
        }
        let (db, coll) = ns
            .split_once('.')
            .ok_or_else(|| ShardError::Validation(format!("invalid namespace '{ns}'")))?;
        let buckets_ns = format!("{db}.{BUCKETS_PREFIX}{coll}");
        let buckets = self.catalog.create_collection(
            &buckets_ns,
            CollectionKind::TimeseriesBuckets,
            Some(options.clone()),
        )?;
        let mut local = CollectionOptions::new(buckets.uuid);
        local.timeseries = Some(options);
        self.create_on_primary(&buckets, local)?;
        if let Err(err) = self.catalog.create_collection(
            ns,
            CollectionKind::View {
                view_on: format!("{BUCKETS_PREFIX}{coll}"),
            },
            None,
        ) {
            self.primary_of(&buckets_ns)?.drop_local_collection(&buckets_ns)?;
            self.catalog.drop_collection(&buckets_ns)?;
            return Err(err);
        }
        info!(ns, buckets = %buckets_ns, "timeseries collection created");
        Ok(buckets)
    }

    /// Shards `ns` on `field`, building the shard key index on the primary
    /// first when the key is not `_id`.
    pub fn shard_collection(&self, ns: &str, field: &str) -> Result<CollectionEntry, ShardError> {
        let _ddl = self.catalog.begin_ddl(ns)?;
        let pattern = ShardKeyPattern::new(field);
        if field != "_id" {
            self.primary_of(ns)?
                .create_local_index(ns, &pattern.index_name(), json!({ field: 1 }))?;
        }
        let entry = self.catalog.shard_collection(ns, pattern)?;
        self.refresh_everywhere(ns);
        Ok(entry)
    }

    pub fn split_chunk(&self, ns: &str, at: KeyValue) -> Result<(), ShardError> {
        let _ddl = self.catalog.begin_ddl(ns)?;
        self.catalog.split_chunk(ns, at)?;
        self.refresh_everywhere(ns);
        Ok(())
    }

    /// Drops `ns` from the catalog and every shard. Returns whether the
    /// catalog knew the collection.
    pub fn drop_collection(&self, ns: &str) -> Result<bool, ShardError> {
        let _ddl = self.catalog.begin_ddl(ns)?;
        let dropped = self.catalog.drop_collection(ns)?;
        for shard in self.shards.values() {
            shard.drop_local_collection(ns)?;
        }
        Ok(dropped.is_some())
    }

    pub fn drop_database(&self, db: &str) -> Result<usize, ShardError> {
        let _ddl = self.catalog.begin_ddl(db)?;
        let dropped = self.catalog.drop_database(db)?;
        for shard in self.shards.values() {
            shard.drop_local_database(db)?;
        }
        info!(db, collections = dropped.len(), "database dropped");
        Ok(dropped.len())
    }

    /// User `applyOps` against the primary of `db`.
    pub async fn apply_ops(&self, db: &str, ops: Vec<Value>) -> Result<usize, ShardError> {
        self.primary_of(&format!("{db}.$cmd"))?.apply_ops(db, ops).await
    }

    // Migrations.

    pub fn start_migration(
        &self,
        ns: &str,
        find_key: &KeyValue,
        to: &str,
        hooks: &MigrationHooks,
    ) -> Result<Arc<MigrationCoordinator>, ShardError> {
        MigrationCoordinator::start(self, ns, find_key, to, hooks)
    }

    /// Moves the chunk containing `find_key` to `to`, running every phase.
    /// Any failure aborts the migration before it is returned.
    pub async fn move_chunk(
        &self,
        ns: &str,
        find_key: &KeyValue,
        to: &str,
        hooks: MigrationHooks,
    ) -> Result<ChunkVersion, ShardError> {
        let migration = self.start_migration(ns, find_key, to, &hooks)?;
        let result = drive(&migration, &hooks).await;
        if let Err(err) = &result {
            migration.abort(&err.to_string()).await?;
        }
        result
    }

    // Diagnostics.

    /// Snapshots the catalog and every shard's local catalog, then checks them.
    pub fn check_metadata_consistency(
        &self,
        scope: &CheckScope,
        options: CheckOptions,
        filters: &[&dyn InconsistencyFilter],
    ) -> Vec<Inconsistency> {
        let catalog = self.catalog.state();
        let ddl_in_flight = self.catalog.ddl_in_flight();
        let sharded: Vec<&String> = catalog
            .collections
            .values()
            .filter(|c| c.is_sharded())
            .map(|c| &c.ns)
            .collect();
        let shards = self
            .shards
            .iter()
            .map(|(id, shard)| {
                let collections = shard
                    .local_catalog()
                    .into_iter()
                    .map(|info| (info.ns.clone(), info))
                    .collect();
                let thinks_unsharded = sharded
                    .iter()
                    .filter(|ns| matches!(shard.cached_metadata(ns), Some(CollectionMetadata::Unsharded)))
                    .map(|ns| ns.to_string())
                    .collect();
                (
                    id.clone(),
                    LocalShardView {
                        collections,
                        thinks_unsharded,
                    },
                )
            })
            .collect();
        let view = ClusterView {
            catalog,
            ddl_in_flight,
            shards,
        };
        check_metadata_consistency(&view, scope, options, filters)
    }

    pub fn conn_pool_stats(&self) -> Result<ConnPoolStats, ShardError> {
        self.pool.snapshot()
    }

    pub fn chunk_cache_document(&self, shard: &str, ns: &str) -> Result<ChunkCacheDocument, ShardError> {
        Ok(self.require_shard(shard)?.chunk_cache_document(ns))
    }
}

async fn drive(migration: &MigrationCoordinator, hooks: &MigrationHooks) -> Result<ChunkVersion, ShardError> {
    migration.clone_range().await?;
    migration.catch_up().await?;
    if let Some(pause) = &hooks.before_critical_section {
        pause.pass().await;
    }
    migration.enter_critical_section().await?;
    migration.commit().await
}
