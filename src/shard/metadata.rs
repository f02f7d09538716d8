use crate::catalog::{CatalogState, ChunkVersion};
use crate::document::{KeyRange, KeyValue, ShardKeyPattern};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// What one shard believes about a collection's placement.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionMetadata {
    Unsharded,
    Sharded {
        key_pattern: ShardKeyPattern,
        collection_version: ChunkVersion,
        shard_version: Option<ChunkVersion>,
        owned: Vec<KeyRange>,
    },
}

impl CollectionMetadata {
    /// Builds the filtering metadata of `shard` for `ns`; `None` if the
    /// catalog does not know the collection.
    pub fn from_catalog(state: &CatalogState, ns: &str, shard: &str) -> Option<Self> {
        let coll = state.collections.get(ns)?;
        let Some(key_pattern) = coll.key_pattern.clone() else {
            return Some(CollectionMetadata::Unsharded);
        };
        let collection_version = state.collection_version(ns)?;
        let owned = state
            .chunks_for(ns)
            .iter()
            .filter(|c| c.shard == shard)
            .map(|c| c.range.clone())
            .collect();
        Some(CollectionMetadata::Sharded {
            key_pattern,
            collection_version,
            shard_version: state.shard_version(ns, shard),
            owned,
        })
    }

    pub fn key_pattern(&self) -> Option<&ShardKeyPattern> {
        match self {
            CollectionMetadata::Unsharded => None,
            CollectionMetadata::Sharded { key_pattern, .. } => Some(key_pattern),
        }
    }

    pub fn collection_version(&self) -> Option<ChunkVersion> {
        match self {
            CollectionMetadata::Unsharded => None,
            CollectionMetadata::Sharded {
                collection_version, ..
            } => Some(*collection_version),
        }
    }

    pub fn owns(&self, key: &KeyValue) -> bool {
        match self {
            CollectionMetadata::Unsharded => true,
            CollectionMetadata::Sharded { owned, .. } => owned.iter().any(|r| r.contains(key)),
        }
    }
}

/// `config.cache.collections` document exposed for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkCacheDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub enter_critical_section_counter: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refreshed_collection_version: Option<String>,
}

#[derive(Default)]
struct CacheSlot {
    counter: Arc<AtomicU64>,
    epoch: Option<Uuid>,
    refreshed_version: Option<ChunkVersion>,
}

/// Per-namespace routing cache entries of one shard.
#[derive(Default)]
pub struct ChunkCache {
    slots: RwLock<HashMap<String, CacheSlot>>,
}

impl ChunkCache {
    /// Shared counter of critical-section entries for `ns`. Readers may keep
    /// the handle and load it without touching any shard lock.
    pub fn critical_section_counter(&self, ns: &str) -> Arc<AtomicU64> {
        if let Some(slot) = self.slots.read().get(ns) {
            return Arc::clone(&slot.counter);
        }
        Arc::clone(&self.slots.write().entry(ns.to_string()).or_default().counter)
    }

    pub fn bump_critical_section(&self, ns: &str) -> u64 {
        self.critical_section_counter(ns).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn note_refresh(&self, ns: &str, metadata: &CollectionMetadata) {
        let mut slots = self.slots.write();
        let slot = slots.entry(ns.to_string()).or_default();
        slot.refreshed_version = metadata.collection_version();
        slot.epoch = slot.refreshed_version.map(|v| v.epoch);
    }

    pub fn document(&self, ns: &str) -> ChunkCacheDocument {
        let slots = self.slots.read();
        let slot = slots.get(ns);
        ChunkCacheDocument {
            id: ns.to_string(),
            enter_critical_section_counter: slot
                .map(|s| s.counter.load(Ordering::SeqCst))
                .unwrap_or(0),
            epoch: slot.and_then(|s| s.epoch),
            last_refreshed_collection_version: slot
                .and_then(|s| s.refreshed_version)
                .map(|v| v.to_string()),
        }
    }
}
