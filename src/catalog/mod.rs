pub mod persist;
pub mod types;

pub use types::{
    CatalogState, Chunk, ChunkHistoryEntry, ChunkVersion, CollectionEntry, CollectionKind,
    DatabaseEntry, MigrationRecord, RoutingTable, ShardEntry, ShardId, db_name,
};

use crate::document::{KeyRange, KeyValue, ShardKeyPattern};
use crate::error::{ResourceType, ShardError};
use crate::oplog::Timestamp;
use crate::session::SessionId;
use crate::storage::TimeseriesOptions;
use parking_lot::{Mutex, RwLock};
use persist::{load_state, write_state_atomic};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;
use uuid::Uuid;

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

fn tick(state: &mut CatalogState) -> Timestamp {
    state.cluster_time = state.cluster_time.successor(now_secs());
    state.cluster_time
}

fn not_found(resource_type: ResourceType, id: &str) -> ShardError {
    ShardError::NotFound {
        resource_type,
        resource_id: id.to_string(),
    }
}

fn conflicts(a: &str, b: &str) -> bool {
    a == b
        || a.strip_prefix(b).is_some_and(|rest| rest.starts_with('.'))
        || b.strip_prefix(a).is_some_and(|rest| rest.starts_with('.'))
}

/// Marks a database or namespace as having DDL in flight until dropped.
pub struct DdlGuard<'a> {
    catalog: &'a Catalog,
    resource: String,
}

impl Drop for DdlGuard<'_> {
    fn drop(&mut self) {
        self.catalog.ddl_in_flight.lock().remove(&self.resource);
    }
}

/// Authoritative cluster metadata (the config server).
pub struct Catalog {
    state: RwLock<CatalogState>,
    ddl_in_flight: Mutex<BTreeSet<String>>,
    path: Option<PathBuf>,
}

impl Catalog {
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(CatalogState::default()),
            ddl_in_flight: Mutex::new(BTreeSet::new()),
            path: None,
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ShardError> {
        let path = path.into();
        let state = load_state(&path)?.unwrap_or_default();
        Ok(Self {
            state: RwLock::new(state),
            ddl_in_flight: Mutex::new(BTreeSet::new()),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` on a copy of the state and installs it once persisted.
    fn mutate<T>(&self, f: impl FnOnce(&mut CatalogState) -> Result<T, ShardError>) -> Result<T, ShardError> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            write_state_atomic(&next, path)?;
        }
        *state = next;
        Ok(out)
    }

    pub fn state(&self) -> CatalogState {
        self.state.read().clone()
    }

    pub fn begin_ddl(&self, resource: &str) -> Result<DdlGuard<'_>, ShardError> {
        let mut in_flight = self.ddl_in_flight.lock();
        if let Some(other) = in_flight.iter().find(|r| conflicts(r, resource)) {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "DDL on '{other}' is in progress"
            )));
        }
        in_flight.insert(resource.to_string());
        Ok(DdlGuard {
            catalog: self,
            resource: resource.to_string(),
        })
    }

    pub fn ddl_in_flight(&self) -> BTreeSet<String> {
        self.ddl_in_flight.lock().clone()
    }

    pub fn add_shard(&self, id: &str, host: &str) -> Result<ShardEntry, ShardError> {
        self.mutate(|state| {
            if state.shards.contains_key(id) {
                return Err(ShardError::AlreadyExists {
                    resource_type: ResourceType::Shard,
                    resource_id: id.to_string(),
                });
            }
            let entry = ShardEntry {
                id: id.to_string(),
                host: host.to_string(),
            };
            state.shards.insert(id.to_string(), entry.clone());
            Ok(entry)
        })
    }

    pub fn shards(&self) -> Vec<ShardEntry> {
        self.state.read().shards.values().cloned().collect()
    }

    pub fn has_shard(&self, id: &str) -> bool {
        self.state.read().shards.contains_key(id)
    }

    /// Creates the database if needed. Without an explicit primary the shard
    /// holding the fewest databases is chosen.
    pub fn enable_sharding(&self, db: &str, primary: Option<&str>) -> Result<DatabaseEntry, ShardError> {
        self.mutate(|state| ensure_database(state, db, primary))
    }

    pub fn database(&self, db: &str) -> Option<DatabaseEntry> {
        self.state.read().databases.get(db).cloned()
    }

    pub fn create_collection(
        &self,
        ns: &str,
        kind: CollectionKind,
        timeseries: Option<TimeseriesOptions>,
    ) -> Result<CollectionEntry, ShardError> {
        self.mutate(|state| {
            ensure_database(state, db_name(ns), None)?;
            if state.collections.contains_key(ns) {
                return Err(ShardError::AlreadyExists {
                    resource_type: ResourceType::Collection,
                    resource_id: ns.to_string(),
                });
            }
            let entry = CollectionEntry {
                ns: ns.to_string(),
                uuid: Uuid::new_v4(),
                kind,
                key_pattern: None,
                epoch: None,
                timeseries,
            };
            state.collections.insert(ns.to_string(), entry.clone());
            Ok(entry)
        })
    }

    pub fn collection(&self, ns: &str) -> Option<CollectionEntry> {
        self.state.read().collections.get(ns).cloned()
    }

    /// Shards an existing collection with a single chunk on the database primary.
    pub fn shard_collection(&self, ns: &str, pattern: ShardKeyPattern) -> Result<CollectionEntry, ShardError> {
        let entry = self.mutate(|state| {
            let primary = state
                .databases
                .get(db_name(ns))
                .map(|d| d.primary_shard.clone())
                .ok_or_else(|| not_found(ResourceType::Database, db_name(ns)))?;
            let valid_after = tick(state);
            let coll = state
                .collections
                .get_mut(ns)
                .ok_or_else(|| not_found(ResourceType::Collection, ns))?;
            if let CollectionKind::View { .. } = coll.kind {
                return Err(ShardError::Validation(format!("cannot shard view '{ns}'")));
            }
            if let Some(existing) = &coll.key_pattern {
                if *existing == pattern {
                    return Ok(coll.clone());
                }
                return Err(ShardError::Validation(format!(
                    "'{ns}' is already sharded on '{}'",
                    existing.field
                )));
            }
            let epoch = Uuid::new_v4();
            coll.key_pattern = Some(pattern.clone());
            coll.epoch = Some(epoch);
            let entry = coll.clone();
            state.chunks.insert(
                ns.to_string(),
                vec![Chunk {
                    range: KeyRange::full(),
                    key_field: pattern.field.clone(),
                    shard: primary.clone(),
                    version: ChunkVersion::new(epoch, 1, 0),
                    history: vec![ChunkHistoryEntry {
                        valid_after,
                        shard: primary,
                    }],
                }],
            );
            Ok(entry)
        })?;
        info!(ns, key = %pattern.field, "collection sharded");
        Ok(entry)
    }

    /// Splits the chunk containing `at` into `[min, at)` and `[at, max)`.
    pub fn split_chunk(&self, ns: &str, at: KeyValue) -> Result<(), ShardError> {
        self.mutate(|state| {
            let max = state
                .collection_version(ns)
                .ok_or_else(|| ShardError::ChunkNotFound {
                    ns: ns.to_string(),
                    key: at.to_string(),
                })?;
            let chunks = state.chunks.entry(ns.to_string()).or_default();
            let pos = chunks
                .iter()
                .position(|c| c.range.contains(&at))
                .ok_or_else(|| ShardError::ChunkNotFound {
                    ns: ns.to_string(),
                    key: at.to_string(),
                })?;
            if chunks[pos].range.min == at {
                return Err(ShardError::Validation(format!(
                    "split point {at} is already a chunk boundary"
                )));
            }
            let mut right = chunks[pos].clone();
            let left = &mut chunks[pos];
            right.range.min = at.clone();
            left.range.max = at;
            left.version = ChunkVersion::new(max.epoch, max.major, max.minor + 1);
            right.version = ChunkVersion::new(max.epoch, max.major, max.minor + 2);
            chunks.insert(pos + 1, right);
            Ok(())
        })
    }

    /// Chunk of `ns` that contains `key`.
    pub fn chunk_containing(&self, ns: &str, key: &KeyValue) -> Result<Chunk, ShardError> {
        let state = self.state.read();
        if !state.collections.contains_key(ns) {
            return Err(not_found(ResourceType::Collection, ns));
        }
        state
            .chunks_for(ns)
            .iter()
            .find(|c| c.range.contains(key))
            .cloned()
            .ok_or_else(|| ShardError::ChunkNotFound {
                ns: ns.to_string(),
                key: key.to_string(),
            })
    }

    pub fn routing_table(&self, ns: &str) -> Result<RoutingTable, ShardError> {
        let state = self.state.read();
        let coll = state
            .collections
            .get(ns)
            .ok_or_else(|| not_found(ResourceType::Collection, ns))?;
        let primary_shard = state
            .databases
            .get(db_name(ns))
            .map(|d| d.primary_shard.clone())
            .ok_or_else(|| not_found(ResourceType::Database, db_name(ns)))?;
        let mut chunks = state.chunks_for(ns).to_vec();
        chunks.sort_by(|a, b| a.range.min.cmp(&b.range.min));
        Ok(RoutingTable {
            ns: ns.to_string(),
            key_pattern: coll.key_pattern.clone(),
            version: state.collection_version(ns),
            chunks,
            primary_shard,
        })
    }

    pub fn register_migration(&self, record: MigrationRecord) -> Result<(), ShardError> {
        self.mutate(|state| {
            if let Some(active) = state
                .active_migrations
                .iter()
                .find(|m| m.ns == record.ns && m.range.overlaps(&record.range))
            {
                return Err(ShardError::AlreadyMigrating {
                    ns: record.ns.clone(),
                    range: active.range.to_string(),
                });
            }
            state.active_migrations.push(record);
            Ok(())
        })
    }

    pub fn update_migration_cursors(
        &self,
        ns: &str,
        range: &KeyRange,
        cursors: &BTreeMap<SessionId, Timestamp>,
    ) -> Result<(), ShardError> {
        self.mutate(|state| {
            if let Some(record) = state
                .active_migrations
                .iter_mut()
                .find(|m| m.ns == ns && m.range == *range)
            {
                record.session_cursors = cursors.clone();
            }
            Ok(())
        })
    }

    pub fn unregister_migration(&self, ns: &str, range: &KeyRange) -> Result<bool, ShardError> {
        self.mutate(|state| {
            let before = state.active_migrations.len();
            state
                .active_migrations
                .retain(|m| !(m.ns == ns && m.range == *range));
            Ok(state.active_migrations.len() != before)
        })
    }

    pub fn active_migrations(&self) -> Vec<MigrationRecord> {
        self.state.read().active_migrations.clone()
    }

    /// Moves ownership of the chunk `range` from `from` to `to`. The moved
    /// chunk gets a new major version and a history entry; one chunk left on
    /// the donor gets the same major with minor 1.
    pub fn commit_chunk_migration(
        &self,
        ns: &str,
        range: &KeyRange,
        from: &str,
        to: &str,
    ) -> Result<ChunkVersion, ShardError> {
        self.mutate(|state| {
            if !state.shards.contains_key(to) {
                return Err(not_found(ResourceType::Shard, to));
            }
            let max = state
                .collection_version(ns)
                .ok_or_else(|| not_found(ResourceType::Collection, ns))?;
            let valid_after = tick(state);
            let chunks = state.chunks.entry(ns.to_string()).or_default();
            let moved = chunks
                .iter_mut()
                .find(|c| c.range == *range)
                .ok_or_else(|| ShardError::ChunkNotFound {
                    ns: ns.to_string(),
                    key: range.to_string(),
                })?;
            if moved.shard != from {
                return Err(ShardError::StaleConfig {
                    ns: ns.to_string(),
                    received: format!("{range} on {from}"),
                    wanted: format!("{range} on {}", moved.shard),
                });
            }
            let major = max.major + 1;
            moved.shard = to.to_string();
            moved.version = ChunkVersion::new(max.epoch, major, 0);
            moved.history.insert(
                0,
                ChunkHistoryEntry {
                    valid_after,
                    shard: to.to_string(),
                },
            );
            let version = moved.version;
            if let Some(donor_chunk) = chunks.iter_mut().find(|c| c.shard == from) {
                donor_chunk.version = ChunkVersion::new(max.epoch, major, 1);
            }
            Ok(version)
        })
    }

    pub fn drop_collection(&self, ns: &str) -> Result<Option<CollectionEntry>, ShardError> {
        self.mutate(|state| {
            state.chunks.remove(ns);
            state.active_migrations.retain(|m| m.ns != ns);
            Ok(state.collections.remove(ns))
        })
    }

    pub fn drop_database(&self, db: &str) -> Result<Vec<CollectionEntry>, ShardError> {
        self.mutate(|state| {
            let dropped: Vec<CollectionEntry> = state
                .collections
                .values()
                .filter(|c| c.db() == db)
                .cloned()
                .collect();
            for coll in &dropped {
                state.collections.remove(&coll.ns);
                state.chunks.remove(&coll.ns);
            }
            state.active_migrations.retain(|m| db_name(&m.ns) != db);
            state.databases.remove(db);
            Ok(dropped)
        })
    }

    /// Direct edit of the catalog documents, bypassing every DDL check.
    /// Used to repair (or deliberately damage) metadata.
    pub fn update_raw(&self, f: impl FnOnce(&mut CatalogState)) -> Result<(), ShardError> {
        self.mutate(|state| {
            f(state);
            Ok(())
        })
    }
}

fn ensure_database(
    state: &mut CatalogState,
    db: &str,
    primary: Option<&str>,
) -> Result<DatabaseEntry, ShardError> {
    if let Some(existing) = state.databases.get(db) {
        return Ok(existing.clone());
    }
    let primary = match primary {
        Some(shard) if state.shards.contains_key(shard) => shard.to_string(),
        Some(shard) => return Err(not_found(ResourceType::Shard, shard)),
        None => state
            .shards
            .keys()
            .min_by_key(|id| {
                state
                    .databases
                    .values()
                    .filter(|d| &d.primary_shard == *id)
                    .count()
            })
            .cloned()
            .ok_or_else(|| not_found(ResourceType::Shard, "<any>"))?,
    };
    let entry = DatabaseEntry {
        name: db.to_string(),
        primary_shard: primary,
        version: 1,
    };
    state.databases.insert(db.to_string(), entry.clone());
    Ok(entry)
}
