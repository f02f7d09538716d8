mod apply;

pub use apply::batch_insert_entry;

use crate::document::{Document, KeyRange, KeyValue, ShardKeyPattern, id_of, matches};
use crate::error::{ResourceType, ShardError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const ID_INDEX_NAME: &str = "_id_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesOptions {
    pub time_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_max_span_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOptions {
    pub uuid: Uuid,
    #[serde(default)]
    pub record_ids_replicated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeseries: Option<TimeseriesOptions>,
}

impl CollectionOptions {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            record_ids_replicated: false,
            timeseries: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub options: CollectionOptions,
    docs: BTreeMap<KeyValue, Document>,
    indexes: BTreeMap<String, Value>,
    record_ids: BTreeMap<KeyValue, i64>,
}

impl Collection {
    fn new(options: CollectionOptions) -> Self {
        let mut indexes = BTreeMap::new();
        indexes.insert(ID_INDEX_NAME.to_string(), serde_json::json!({"_id": 1}));
        Self {
            options,
            docs: BTreeMap::new(),
            indexes,
            record_ids: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn get(&self, id: &KeyValue) -> Option<&Document> {
        self.docs.get(id)
    }

    pub fn find(&self, filter: &Document) -> Vec<&Document> {
        self.docs.values().filter(|d| matches(filter, d)).collect()
    }

    pub fn find_one(&self, filter: &Document) -> Option<&Document> {
        self.docs.values().find(|d| matches(filter, d))
    }

    pub fn indexes(&self) -> &BTreeMap<String, Value> {
        &self.indexes
    }

    pub fn record_id(&self, id: &KeyValue) -> Option<i64> {
        self.record_ids.get(id).copied()
    }

    pub fn docs(&self) -> impl Iterator<Item = &Document> {
        self.docs.values()
    }
}

/// Local summary of one collection as seen by the consistency checker.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalCollectionInfo {
    pub ns: String,
    pub uuid: Uuid,
    pub indexes: BTreeMap<String, Value>,
    pub doc_count: usize,
    pub timeseries: Option<TimeseriesOptions>,
}

/// Documents of every collection held by one shard.
#[derive(Debug, Clone, Default)]
pub struct Storage {
    collections: BTreeMap<String, Collection>,
    replicated_record_ids_enabled: bool,
}

impl Storage {
    pub fn new(replicated_record_ids_enabled: bool) -> Self {
        Self {
            collections: BTreeMap::new(),
            replicated_record_ids_enabled,
        }
    }

    pub fn create_collection(&mut self, ns: &str, options: CollectionOptions) -> Result<(), ShardError> {
        if options.record_ids_replicated && !self.replicated_record_ids_enabled {
            return Err(ShardError::CommandNotSupported(format!(
                "create '{ns}' with recordIdsReplicated: replicated record ids are not enabled"
            )));
        }
        match self.collections.get(ns) {
            Some(existing) if existing.options.uuid == options.uuid => Ok(()),
            Some(_) => Err(ShardError::AlreadyExists {
                resource_type: ResourceType::Collection,
                resource_id: ns.to_string(),
            }),
            None => {
                self.collections.insert(ns.to_string(), Collection::new(options));
                Ok(())
            }
        }
    }

    pub fn drop_collection(&mut self, ns: &str) -> bool {
        self.collections.remove(ns).is_some()
    }

    pub fn drop_database(&mut self, db: &str) -> usize {
        let prefix = format!("{db}.");
        let before = self.collections.len();
        self.collections.retain(|ns, _| !ns.starts_with(&prefix));
        before - self.collections.len()
    }

    pub fn create_index(&mut self, ns: &str, name: &str, key: Value) -> Result<(), ShardError> {
        let coll = self.collection_mut(ns)?;
        coll.indexes.insert(name.to_string(), key);
        Ok(())
    }

    pub fn drop_index(&mut self, ns: &str, name: &str) -> Result<bool, ShardError> {
        if name == ID_INDEX_NAME {
            return Err(ShardError::Validation("cannot drop the _id index".into()));
        }
        Ok(self.collection_mut(ns)?.indexes.remove(name).is_some())
    }

    pub fn collection(&self, ns: &str) -> Option<&Collection> {
        self.collections.get(ns)
    }

    pub fn has_collection(&self, ns: &str) -> bool {
        self.collections.contains_key(ns)
    }

    pub(crate) fn collection_mut(&mut self, ns: &str) -> Result<&mut Collection, ShardError> {
        self.collections.get_mut(ns).ok_or_else(|| ShardError::NotFound {
            resource_type: ResourceType::Collection,
            resource_id: ns.to_string(),
        })
    }

    pub fn find(&self, ns: &str, filter: &Document) -> Vec<Document> {
        self.collections
            .get(ns)
            .map(|c| c.find(filter).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, ns: &str) -> usize {
        self.collections.get(ns).map(Collection::len).unwrap_or(0)
    }

    /// Inserts or replaces a whole document, used by migration cloning.
    pub fn upsert_document(&mut self, ns: &str, doc: Document) -> Result<(), ShardError> {
        let id = id_of(&doc)?;
        self.collection_mut(ns)?.docs.insert(id, doc);
        Ok(())
    }

    pub fn remove_document(&mut self, ns: &str, id: &KeyValue) -> Result<Option<Document>, ShardError> {
        let coll = self.collection_mut(ns)?;
        coll.record_ids.remove(id);
        Ok(coll.docs.remove(id))
    }

    /// Documents whose shard key falls in `range`, in `_id` order.
    pub fn docs_in_range(&self, ns: &str, pattern: &ShardKeyPattern, range: &KeyRange) -> Vec<Document> {
        self.collections
            .get(ns)
            .map(|c| {
                c.docs
                    .values()
                    .filter(|d| pattern.extract(d).is_some_and(|k| range.contains(&k)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `_id`s of documents whose shard key falls in `range`.
    pub fn ids_in_range(&self, ns: &str, pattern: &ShardKeyPattern, range: &KeyRange) -> Vec<KeyValue> {
        self.collections
            .get(ns)
            .map(|c| {
                c.docs
                    .iter()
                    .filter(|(_, d)| pattern.extract(d).is_some_and(|k| range.contains(&k)))
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn local_catalog(&self) -> Vec<LocalCollectionInfo> {
        self.collections
            .iter()
            .map(|(ns, c)| LocalCollectionInfo {
                ns: ns.clone(),
                uuid: c.options.uuid,
                indexes: c.indexes.clone(),
                doc_count: c.docs.len(),
                timeseries: c.options.timeseries.clone(),
            })
            .collect()
    }

    pub fn namespaces(&self) -> impl Iterator<Item = &String> {
        self.collections.keys()
    }
}
