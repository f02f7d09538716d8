use super::{CheckOptions, CheckScope, ClusterView, Inconsistency, InconsistencyType, Severity};
use crate::catalog::{Chunk, CollectionEntry, CollectionKind, ShardId};
use crate::document::{KeyValue, ShardKeyPattern};
use crate::storage::LocalCollectionInfo;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};

const BUCKETS_PREFIX: &str = "system.buckets.";

pub(super) struct Finding {
    pub kind: InconsistencyType,
    pub ns: String,
    description: String,
    details: Map<String, Value>,
}

impl Finding {
    fn new(kind: InconsistencyType, ns: &str, description: String, details: Value) -> Self {
        let details = match details {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind,
            ns: ns.to_string(),
            description,
            details,
        }
    }

    pub fn into_inconsistency(self, severity: Severity) -> Inconsistency {
        let mut details = self.details;
        details.insert("namespace".into(), Value::String(self.ns));
        Inconsistency {
            kind: self.kind,
            description: self.description,
            details: Value::Object(details),
            severity,
        }
    }
}

pub(super) fn scan(view: &ClusterView, scope: &CheckScope, options: CheckOptions) -> Vec<Finding> {
    let mut out = Vec::new();
    for coll in view.catalog.collections.values() {
        if !scope.includes(&coll.ns) {
            continue;
        }
        if let CollectionKind::View { .. } = coll.kind {
            continue;
        }
        check_holders(view, coll, &mut out);
        match &coll.key_pattern {
            Some(pattern) => {
                let chunks = view.catalog.chunks_for(&coll.ns);
                check_routing_table(&coll.ns, pattern, chunks, &mut out);
                check_sharded_placement(view, coll, pattern, chunks, options, &mut out);
            }
            None => check_unsharded_placement(view, coll, &mut out),
        }
        if coll.kind == CollectionKind::TimeseriesBuckets || is_buckets_ns(&coll.ns) {
            check_timeseries(view, coll, &mut out);
        }
    }
    check_untracked(view, scope, &mut out);
    out
}

fn is_buckets_ns(ns: &str) -> bool {
    ns.split_once('.')
        .is_some_and(|(_, coll)| coll.starts_with(BUCKETS_PREFIX))
}

fn holders<'a>(view: &'a ClusterView, ns: &str) -> Vec<(&'a ShardId, &'a LocalCollectionInfo)> {
    view.shards
        .iter()
        .filter_map(|(id, shard)| shard.collections.get(ns).map(|c| (id, c)))
        .collect()
}

fn check_holders(view: &ClusterView, coll: &CollectionEntry, out: &mut Vec<Finding>) {
    for (shard, local) in holders(view, &coll.ns) {
        if local.uuid != coll.uuid {
            out.push(Finding::new(
                InconsistencyType::CollectionUuidMismatch,
                &coll.ns,
                format!("collection uuid on {shard} differs from the catalog"),
                json!({
                    "shard": shard,
                    "localUUID": local.uuid.to_string(),
                    "uuid": coll.uuid.to_string(),
                }),
            ));
        }
    }
}

fn check_unsharded_placement(view: &ClusterView, coll: &CollectionEntry, out: &mut Vec<Finding>) {
    let Some(primary) = view.catalog.databases.get(coll.db()).map(|d| &d.primary_shard) else {
        return;
    };
    let held = holders(view, &coll.ns);
    if !held.iter().any(|(shard, _)| *shard == primary) {
        out.push(Finding::new(
            InconsistencyType::MissingLocalCollection,
            &coll.ns,
            format!("unsharded collection is missing on primary shard {primary}"),
            json!({"shard": primary}),
        ));
    }
    for (shard, local) in held.into_iter().filter(|(shard, _)| *shard != primary) {
        out.push(Finding::new(
            InconsistencyType::MisplacedCollection,
            &coll.ns,
            format!("unsharded collection found on {shard}, which is not the database primary"),
            json!({"shard": shard, "primaryShard": primary, "localUUID": local.uuid.to_string()}),
        ));
    }
}

fn check_routing_table(ns: &str, pattern: &ShardKeyPattern, chunks: &[Chunk], out: &mut Vec<Finding>) {
    if chunks.is_empty() {
        out.push(Finding::new(
            InconsistencyType::MissingRoutingTable,
            ns,
            "sharded collection has no chunks".into(),
            json!({}),
        ));
        return;
    }
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by(|a, b| a.range.min.cmp(&b.range.min));
    if let Some(first) = sorted.first()
        && first.range.min != KeyValue::MinKey
    {
        out.push(Finding::new(
            InconsistencyType::RoutingTableMissingMinKey,
            ns,
            format!("first chunk starts at {} instead of MinKey", first.range.min),
            json!({"chunk": first.range.to_string()}),
        ));
    }
    if let Some(last) = sorted.last()
        && last.range.max != KeyValue::MaxKey
    {
        out.push(Finding::new(
            InconsistencyType::RoutingTableMissingMaxKey,
            ns,
            format!("last chunk ends at {} instead of MaxKey", last.range.max),
            json!({"chunk": last.range.to_string()}),
        ));
    }
    for pair in sorted.windows(2) {
        let (prev, next) = (&pair[0].range, &pair[1].range);
        if prev.max < next.min {
            out.push(Finding::new(
                InconsistencyType::RoutingTableRangeGap,
                ns,
                format!("no chunk covers [{}, {})", prev.max, next.min),
                json!({"chunkA": prev.to_string(), "chunkB": next.to_string()}),
            ));
        } else if prev.max > next.min {
            out.push(Finding::new(
                InconsistencyType::RoutingTableRangeOverlap,
                ns,
                format!("chunks {prev} and {next} overlap"),
                json!({"chunkA": prev.to_string(), "chunkB": next.to_string()}),
            ));
        }
    }
    for chunk in &sorted {
        if chunk.key_field != pattern.field {
            out.push(Finding::new(
                InconsistencyType::CorruptedChunkShardKey,
                ns,
                format!(
                    "chunk {} is keyed on '{}' but the collection is sharded on '{}'",
                    chunk.range, chunk.key_field, pattern.field
                ),
                json!({"chunk": chunk.range.to_string(), "shardKey": pattern.field}),
            ));
        }
        if let Some(problem) = history_problem(chunk) {
            out.push(Finding::new(
                InconsistencyType::CorruptedChunkHistory,
                ns,
                format!("chunk {} has corrupted history: {problem}", chunk.range),
                json!({"chunk": chunk.range.to_string(), "shard": chunk.shard}),
            ));
        }
    }
}

fn history_problem(chunk: &Chunk) -> Option<&'static str> {
    let newest = chunk.history.first()?;
    if newest.shard != chunk.shard {
        return Some("latest history entry names another shard");
    }
    let monotonic = chunk
        .history
        .windows(2)
        .all(|pair| pair[0].valid_after > pair[1].valid_after);
    (!monotonic).then_some("validAfter is not decreasing")
}

fn check_sharded_placement(
    view: &ClusterView,
    coll: &CollectionEntry,
    pattern: &ShardKeyPattern,
    chunks: &[Chunk],
    options: CheckOptions,
    out: &mut Vec<Finding>,
) {
    let ns = &coll.ns;
    let owners: BTreeSet<&ShardId> = chunks.iter().map(|c| &c.shard).collect();
    let held: BTreeMap<&ShardId, &LocalCollectionInfo> = holders(view, ns).into_iter().collect();

    for owner in &owners {
        let Some(local) = held.get(owner) else {
            out.push(Finding::new(
                InconsistencyType::MissingLocalCollection,
                ns,
                format!("{owner} owns chunks but has no local collection"),
                json!({"shard": owner}),
            ));
            continue;
        };
        let has_key_index = local
            .indexes
            .values()
            .any(|key| key.as_object().is_some_and(|k| k.contains_key(&pattern.field)));
        if !has_key_index {
            out.push(Finding::new(
                InconsistencyType::MissingShardKeyIndex,
                ns,
                format!("{owner} has no index supporting shard key '{}'", pattern.field),
                json!({"shard": owner, "shardKey": pattern.field}),
            ));
        }
    }

    for shard in held.keys() {
        if view
            .shards
            .get(*shard)
            .is_some_and(|s| s.thinks_unsharded.contains(ns))
        {
            out.push(Finding::new(
                InconsistencyType::ShardThinksCollectionIsUnsharded,
                ns,
                format!("{shard} caches the collection as unsharded"),
                json!({"shard": shard}),
            ));
        }
    }

    if options.check_indexes {
        check_indexes(ns, &owners, &held, out);
    }
}

fn check_indexes(
    ns: &str,
    owners: &BTreeSet<&ShardId>,
    held: &BTreeMap<&ShardId, &LocalCollectionInfo>,
    out: &mut Vec<Finding>,
) {
    let owning: Vec<(&ShardId, &LocalCollectionInfo)> = owners
        .iter()
        .filter_map(|s| held.get(*s).map(|c| (*s, *c)))
        .collect();
    let names: BTreeSet<&String> = owning.iter().flat_map(|(_, c)| c.indexes.keys()).collect();
    for name in names {
        let (present, missing): (Vec<_>, Vec<_>) = owning
            .iter()
            .partition(|(_, c)| c.indexes.contains_key(name.as_str()));
        let specs: BTreeSet<String> = present
            .iter()
            .filter_map(|(_, c)| c.indexes.get(name.as_str()))
            .map(Value::to_string)
            .collect();
        if missing.is_empty() && specs.len() <= 1 {
            continue;
        }
        let present: Vec<&ShardId> = present.iter().map(|(s, _)| *s).collect();
        let missing: Vec<&ShardId> = missing.iter().map(|(s, _)| *s).collect();
        out.push(Finding::new(
            InconsistencyType::InconsistentIndex,
            ns,
            format!("index '{name}' differs across shards owning chunks"),
            json!({"index": name, "presentOn": present, "missingFrom": missing, "specs": specs}),
        ));
    }
}

fn check_timeseries(view: &ClusterView, coll: &CollectionEntry, out: &mut Vec<Finding>) {
    let ns = &coll.ns;
    let mut problems = Vec::new();
    if coll.kind != CollectionKind::TimeseriesBuckets {
        problems.push("buckets namespace is not registered as a buckets collection".to_string());
    }
    if !is_buckets_ns(ns) {
        problems.push(format!("buckets collection name lacks the '{BUCKETS_PREFIX}' prefix"));
    }
    match &coll.timeseries {
        None => problems.push("catalog entry has no timeseries options".into()),
        Some(ts) if ts.time_field.is_empty() => problems.push("timeField is empty".into()),
        Some(_) => {}
    }
    for (shard, local) in holders(view, ns) {
        if local.timeseries != coll.timeseries {
            problems.push(format!("timeseries options on {shard} differ from the catalog"));
        }
    }
    for problem in problems {
        out.push(Finding::new(
            InconsistencyType::MalformedTimeseriesBucketsCollection,
            ns,
            problem,
            json!({"options": coll.timeseries}),
        ));
    }
}

/// Local collections the catalog does not know about. On the database
/// primary these are plain unsharded collections; anywhere else they are
/// misplaced.
fn check_untracked(view: &ClusterView, scope: &CheckScope, out: &mut Vec<Finding>) {
    for (shard, local) in &view.shards {
        for (ns, info) in &local.collections {
            if !scope.includes(ns) || view.catalog.collections.contains_key(ns) {
                continue;
            }
            let primary = view
                .catalog
                .databases
                .get(crate::catalog::db_name(ns))
                .map(|d| &d.primary_shard);
            if primary == Some(shard) {
                continue;
            }
            out.push(Finding::new(
                InconsistencyType::MisplacedCollection,
                ns,
                format!("{shard} holds a collection unknown to the catalog"),
                json!({"shard": shard, "localUUID": info.uuid.to_string()}),
            ));
        }
    }
}
