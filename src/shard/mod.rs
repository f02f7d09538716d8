pub mod gates;
pub mod metadata;
mod transfer;
mod write;

pub use gates::{Admission, GateOutcome, InflightGuard, WriteGates};
pub use metadata::{ChunkCache, ChunkCacheDocument, CollectionMetadata};
pub use transfer::{RangeSnapshot, TransferMod};
pub use write::{ShardWriteRequest, WriteOp};

use crate::catalog::{Catalog, ShardId};
use crate::config::ClusterConfig;
use crate::document::{Document, KeyValue, id_only_filter};
use crate::error::{ResourceType, ShardError};
use crate::oplog::{AppendedWrite, OpKind, Oplog, OplogEntry};
use crate::session::{SessionStore, SessionWriteRecord};
use crate::storage::{CollectionOptions, LocalCollectionInfo, Storage};
use parking_lot::RwLock;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// One shard: its storage, oplog, session table and placement view.
pub struct Shard {
    id: ShardId,
    dir: PathBuf,
    config: ClusterConfig,
    catalog: Arc<Catalog>,
    oplog: Oplog,
    storage: RwLock<Storage>,
    sessions: SessionStore,
    metadata: RwLock<HashMap<String, CollectionMetadata>>,
    gates: Arc<WriteGates>,
    chunk_cache: ChunkCache,
}

impl Shard {
    /// Opens the shard at `dir`, rebuilding storage and the session table by
    /// replaying its oplog.
    pub fn open(
        id: impl Into<ShardId>,
        dir: impl Into<PathBuf>,
        config: ClusterConfig,
        catalog: Arc<Catalog>,
    ) -> Result<Arc<Self>, ShardError> {
        config.validate()?;
        let id = id.into();
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let oplog = Oplog::open(&dir, &config)?;
        let mut storage = Storage::new(config.replicated_record_ids_enabled);
        let mut records = Vec::new();
        let writes = oplog.assembled_writes()?;
        for write in &writes {
            if write.entry.op != OpKind::Noop {
                storage.apply_entry(&write.entry)?;
            }
            if let (Some(session), Some(record)) =
                (write.entry.lsid, SessionWriteRecord::from_write(write))
            {
                records.push((session, record));
            }
        }
        if !writes.is_empty() {
            info!(
                shard = %id,
                writes = writes.len(),
                sessions = records.len(),
                "shard state rebuilt from oplog"
            );
        }
        let shard = Arc::new(Self {
            id,
            dir,
            config,
            catalog,
            oplog,
            storage: RwLock::new(storage),
            sessions: SessionStore::from_records(records),
            metadata: RwLock::new(HashMap::new()),
            gates: WriteGates::new(),
            chunk_cache: ChunkCache::default(),
        });
        let namespaces: Vec<String> = shard.storage.read().namespaces().cloned().collect();
        for ns in namespaces {
            shard.refresh_metadata(&ns);
        }
        Ok(shard)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn oplog(&self) -> &Oplog {
        &self.oplog
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn gates(&self) -> &Arc<WriteGates> {
        &self.gates
    }

    pub fn chunk_cache(&self) -> &ChunkCache {
        &self.chunk_cache
    }

    /// Reloads this shard's placement view of `ns` from the catalog.
    pub fn refresh_metadata(&self, ns: &str) -> Option<CollectionMetadata> {
        let state = self.catalog.state();
        let metadata = CollectionMetadata::from_catalog(&state, ns, &self.id);
        let mut cache = self.metadata.write();
        match &metadata {
            Some(m) => {
                self.chunk_cache.note_refresh(ns, m);
                debug!(shard = %self.id, ns, version = ?m.collection_version(), "filtering metadata refreshed");
                cache.insert(ns.to_string(), m.clone());
            }
            None => {
                cache.remove(ns);
            }
        }
        metadata
    }

    pub fn metadata(&self, ns: &str) -> Option<CollectionMetadata> {
        if let Some(m) = self.metadata.read().get(ns) {
            return Some(m.clone());
        }
        self.refresh_metadata(ns)
    }

    /// Placement view as currently cached, without refreshing.
    pub fn cached_metadata(&self, ns: &str) -> Option<CollectionMetadata> {
        self.metadata.read().get(ns).cloned()
    }

    /// Validates `entry` against a copy of storage, logs it, then installs
    /// the result. Used for commands that may legitimately fail.
    fn log_command(&self, entry: OplogEntry) -> Result<AppendedWrite, ShardError> {
        let mut storage = self.storage.write();
        let staged = storage.with_batch(std::slice::from_ref(&entry))?;
        let appended = self.oplog.append_write(entry)?;
        *storage = staged;
        Ok(appended)
    }

    /// Logs an entry whose application cannot fail, then applies it.
    fn log_then_apply(storage: &mut Storage, oplog: &Oplog, entry: OplogEntry) -> Result<AppendedWrite, ShardError> {
        let appended = oplog.append_write(entry.clone())?;
        let mut applied = entry;
        applied.ts = appended.ts;
        storage.apply_entry(&applied)?;
        Ok(appended)
    }

    pub fn create_local_collection(&self, ns: &str, options: CollectionOptions) -> Result<(), ShardError> {
        let (db, coll) = split_ns(ns)?;
        let mut cmd = json!({
            "create": coll,
            "uuid": options.uuid.to_string(),
        });
        if options.record_ids_replicated {
            cmd["recordIdsReplicated"] = Value::Bool(true);
        }
        if let Some(ts) = &options.timeseries {
            cmd["timeseries"] = serde_json::to_value(ts).map_err(ShardError::encode)?;
        }
        if self
            .storage
            .read()
            .collection(ns)
            .is_some_and(|c| c.options.uuid == options.uuid)
        {
            return Ok(());
        }
        self.log_command(OplogEntry::command(format!("{db}.$cmd"), cmd))?;
        self.refresh_metadata(ns);
        Ok(())
    }

    pub fn create_local_index(&self, ns: &str, name: &str, key: Value) -> Result<(), ShardError> {
        let (db, coll) = split_ns(ns)?;
        self.log_command(OplogEntry::command(
            format!("{db}.$cmd"),
            json!({"createIndexes": coll, "indexes": [{"name": name, "key": key}]}),
        ))?;
        Ok(())
    }

    pub fn drop_local_collection(&self, ns: &str) -> Result<bool, ShardError> {
        if !self.storage.read().has_collection(ns) {
            self.metadata.write().remove(ns);
            return Ok(false);
        }
        let (db, coll) = split_ns(ns)?;
        self.log_command(OplogEntry::command(format!("{db}.$cmd"), json!({"drop": coll})))?;
        self.metadata.write().remove(ns);
        Ok(true)
    }

    pub fn drop_local_database(&self, db: &str) -> Result<(), ShardError> {
        self.log_command(OplogEntry::command(format!("{db}.$cmd"), json!({"dropDatabase": 1})))?;
        let prefix = format!("{db}.");
        self.metadata.write().retain(|ns, _| !ns.starts_with(&prefix));
        Ok(())
    }

    /// Documents of `ns` matching `filter` that this shard owns.
    pub fn find(&self, ns: &str, filter: &Document) -> Vec<Document> {
        let metadata = self.metadata(ns);
        let pattern = metadata.as_ref().and_then(|m| m.key_pattern().cloned());
        self.storage
            .read()
            .find(ns, filter)
            .into_iter()
            .filter(|doc| match (&metadata, &pattern) {
                (Some(m), Some(p)) => p.extract(doc).is_some_and(|k| m.owns(&k)),
                _ => true,
            })
            .collect()
    }

    /// Every stored document of `ns`, owned or not.
    pub fn find_raw(&self, ns: &str, filter: &Document) -> Vec<Document> {
        self.storage.read().find(ns, filter)
    }

    /// Shard key of the owned document matched by an `_id`-only filter.
    pub fn locate(&self, ns: &str, filter: &Document) -> Option<KeyValue> {
        let id = id_only_filter(filter)?;
        let metadata = self.metadata(ns)?;
        let pattern = metadata.key_pattern()?.clone();
        let storage = self.storage.read();
        let key = pattern.extract(storage.collection(ns)?.get(&id)?)?;
        metadata.owns(&key).then_some(key)
    }

    pub fn local_catalog(&self) -> Vec<LocalCollectionInfo> {
        self.storage.read().local_catalog()
    }

    pub fn count(&self, ns: &str) -> usize {
        self.storage.read().count(ns)
    }

    pub fn with_storage<T>(&self, f: impl FnOnce(&Storage) -> T) -> T {
        f(&self.storage.read())
    }

    pub fn chunk_cache_document(&self, ns: &str) -> ChunkCacheDocument {
        self.chunk_cache.document(ns)
    }
}

fn split_ns(ns: &str) -> Result<(&str, &str), ShardError> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(ShardError::Validation(format!("invalid namespace '{ns}'"))),
    }
}

pub(crate) fn require_collection(storage: &Storage, ns: &str) -> Result<(), ShardError> {
    if storage.has_collection(ns) {
        return Ok(());
    }
    Err(ShardError::NotFound {
        resource_type: ResourceType::Collection,
        resource_id: ns.to_string(),
    })
}
