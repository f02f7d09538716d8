use crate::document::{KeyRange, ShardKeyPattern};
use crate::oplog::Timestamp;
use crate::session::SessionId;
use crate::storage::TimeseriesOptions;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use uuid::Uuid;

pub type ShardId = String;

/// Placement version of a chunk or collection: `major|minor||epoch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkVersion {
    pub epoch: Uuid,
    pub major: u32,
    pub minor: u32,
}

impl ChunkVersion {
    pub fn new(epoch: Uuid, major: u32, minor: u32) -> Self {
        Self {
            epoch,
            major,
            minor,
        }
    }

    /// Ordering of two versions of the same placement history. Versions from
    /// different epochs (the collection was dropped and recreated, or
    /// resharded) are not comparable.
    pub fn compare_placement(&self, other: &ChunkVersion) -> Option<Ordering> {
        if self.epoch != other.epoch {
            return None;
        }
        Some((self.major, self.minor).cmp(&(other.major, other.minor)))
    }
}

impl std::fmt::Display for ChunkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}||{}", self.major, self.minor, self.epoch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHistoryEntry {
    pub valid_after: Timestamp,
    pub shard: ShardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub range: KeyRange,
    /// Field the bounds are expressed in; must match the collection's key.
    pub key_field: String,
    pub shard: ShardId,
    pub version: ChunkVersion,
    /// Owners, newest first.
    pub history: Vec<ChunkHistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardEntry {
    pub id: ShardId,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEntry {
    pub name: String,
    pub primary_shard: ShardId,
    pub version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum CollectionKind {
    Collection,
    TimeseriesBuckets,
    View { view_on: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionEntry {
    pub ns: String,
    pub uuid: Uuid,
    pub kind: CollectionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pattern: Option<ShardKeyPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeseries: Option<TimeseriesOptions>,
}

impl CollectionEntry {
    pub fn is_sharded(&self) -> bool {
        self.key_pattern.is_some()
    }

    pub fn db(&self) -> &str {
        db_name(&self.ns)
    }
}

pub fn db_name(ns: &str) -> &str {
    ns.split_once('.').map(|(db, _)| db).unwrap_or(ns)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationRecord {
    pub ns: String,
    pub range: KeyRange,
    pub from: ShardId,
    pub to: ShardId,
    /// Last donor timestamp imported per session.
    #[serde(default)]
    pub session_cursors: BTreeMap<SessionId, Timestamp>,
}

/// Everything the config server knows; persisted as one JSON document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CatalogState {
    pub shards: BTreeMap<ShardId, ShardEntry>,
    pub databases: BTreeMap<String, DatabaseEntry>,
    pub collections: BTreeMap<String, CollectionEntry>,
    pub chunks: BTreeMap<String, Vec<Chunk>>,
    pub active_migrations: Vec<MigrationRecord>,
    pub cluster_time: Timestamp,
}

impl CatalogState {
    pub fn chunks_for(&self, ns: &str) -> &[Chunk] {
        self.chunks.get(ns).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Highest chunk version of `ns`.
    pub fn collection_version(&self, ns: &str) -> Option<ChunkVersion> {
        self.chunks_for(ns)
            .iter()
            .map(|c| c.version)
            .max_by_key(|v| (v.major, v.minor))
    }

    /// Highest version among the chunks `shard` owns for `ns`.
    pub fn shard_version(&self, ns: &str, shard: &str) -> Option<ChunkVersion> {
        self.chunks_for(ns)
            .iter()
            .filter(|c| c.shard == shard)
            .map(|c| c.version)
            .max_by_key(|v| (v.major, v.minor))
    }
}

/// Routing information for one collection as cached by routers.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    pub ns: String,
    pub key_pattern: Option<ShardKeyPattern>,
    pub version: Option<ChunkVersion>,
    /// Sorted by range.
    pub chunks: Vec<Chunk>,
    pub primary_shard: ShardId,
}

impl RoutingTable {
    pub fn owner_of(&self, key: &crate::document::KeyValue) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.range.contains(key))
    }

    pub fn shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.chunks.iter().map(|c| c.shard.clone()).collect();
        if shards.is_empty() {
            shards.push(self.primary_shard.clone());
        }
        shards.sort();
        shards.dedup();
        shards
    }
}

#[cfg(test)]
mod tests {
    use super::ChunkVersion;
    use std::cmp::Ordering;
    use uuid::Uuid;

    #[test]
    fn versions_compare_only_within_an_epoch() {
        let epoch = Uuid::new_v4();
        let a = ChunkVersion::new(epoch, 2, 0);
        let b = ChunkVersion::new(epoch, 2, 1);
        assert_eq!(a.compare_placement(&b), Some(Ordering::Less));
        let other = ChunkVersion::new(Uuid::new_v4(), 9, 0);
        assert_eq!(a.compare_placement(&other), None);
        assert!(a.to_string().starts_with("2|0||"));
    }
}
