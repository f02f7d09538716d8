mod checks;
pub mod filter;

pub use filter::{IgnoreTypes, InconsistencyFilter, ignore_transient, multiversion, stepdown};

use crate::catalog::{CatalogState, ShardId, db_name};
use crate::storage::LocalCollectionInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InconsistencyType {
    CollectionUuidMismatch,
    MisplacedCollection,
    MissingLocalCollection,
    MissingRoutingTable,
    RoutingTableRangeGap,
    RoutingTableRangeOverlap,
    RoutingTableMissingMinKey,
    RoutingTableMissingMaxKey,
    CorruptedChunkShardKey,
    CorruptedChunkHistory,
    InconsistentIndex,
    MissingShardKeyIndex,
    MalformedTimeseriesBucketsCollection,
    ShardThinksCollectionIsUnsharded,
}

impl InconsistencyType {
    /// Types an in-flight DDL on the same namespace can produce while it is
    /// between its local and catalog steps.
    pub fn is_transient_class(self) -> bool {
        matches!(
            self,
            InconsistencyType::CollectionUuidMismatch
                | InconsistencyType::MisplacedCollection
                | InconsistencyType::MissingLocalCollection
                | InconsistencyType::MissingRoutingTable
                | InconsistencyType::InconsistentIndex
                | InconsistencyType::MissingShardKeyIndex
                | InconsistencyType::ShardThinksCollectionIsUnsharded
        )
    }
}

impl std::fmt::Display for InconsistencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inconsistency {
    #[serde(rename = "type")]
    pub kind: InconsistencyType,
    pub description: String,
    /// Always carries `namespace`; the other fields depend on the type.
    pub details: Value,
    pub severity: Severity,
}

impl Inconsistency {
    pub fn namespace(&self) -> &str {
        self.details
            .get("namespace")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckScope {
    Cluster,
    Database(String),
    Collection(String),
}

impl CheckScope {
    pub fn includes(&self, ns: &str) -> bool {
        match self {
            CheckScope::Cluster => true,
            CheckScope::Database(db) => db_name(ns) == db,
            CheckScope::Collection(target) => target == ns,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    pub check_indexes: bool,
}

/// What one shard reports about its local catalog.
#[derive(Debug, Clone, Default)]
pub struct LocalShardView {
    pub collections: BTreeMap<String, LocalCollectionInfo>,
    /// Namespaces whose cached placement says unsharded.
    pub thinks_unsharded: BTreeSet<String>,
}

/// Point-in-time view of the catalog and every shard, taken before checking.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub catalog: CatalogState,
    pub ddl_in_flight: BTreeSet<String>,
    pub shards: BTreeMap<ShardId, LocalShardView>,
}

impl ClusterView {
    fn ddl_touches(&self, ns: &str) -> bool {
        self.ddl_in_flight
            .iter()
            .any(|r| r == ns || r == db_name(ns))
    }
}

/// Scans `view` within `scope`, classifies every finding, and drops the ones
/// a filter rejects. Results are ordered by namespace, then type.
pub fn check_metadata_consistency(
    view: &ClusterView,
    scope: &CheckScope,
    options: CheckOptions,
    filters: &[&dyn InconsistencyFilter],
) -> Vec<Inconsistency> {
    let mut found: Vec<Inconsistency> = checks::scan(view, scope, options)
        .into_iter()
        .map(|finding| {
            let severity = if finding.kind.is_transient_class() && view.ddl_touches(&finding.ns) {
                Severity::Transient
            } else {
                Severity::Fatal
            };
            finding.into_inconsistency(severity)
        })
        .filter(|i| filters.iter().all(|f| f.keep(i)))
        .collect();
    found.sort_by(|a, b| {
        (a.namespace(), a.kind, &a.description).cmp(&(b.namespace(), b.kind, &b.description))
    });
    found
}
