use super::{Shard, require_collection};
use crate::catalog::ChunkVersion;
use crate::document::{
    Document, KeyValue, ShardKeyPattern, UpdateSpec, diff_between, id_of, id_only_filter,
};
use crate::error::{ResourceType, ShardError};
use crate::oplog::{OpKind, OplogEntry};
use crate::session::{SessionId, SessionWriteRecord, TxnNumber, WriteReply};
use crate::shard::metadata::CollectionMetadata;
use crate::storage::{Collection, Storage, batch_insert_entry};
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Single-document write operations understood by a shard.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        documents: Vec<Document>,
    },
    Update {
        filter: Document,
        update: Value,
        upsert: bool,
    },
    Delete {
        filter: Document,
    },
    FindAndModify {
        query: Document,
        update: Option<Value>,
        remove: bool,
        upsert: bool,
        /// Return the post-image instead of the pre-image.
        return_new: bool,
    },
}

impl WriteOp {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOp::Insert { .. } => "insert",
            WriteOp::Update { .. } => "update",
            WriteOp::Delete { .. } => "delete",
            WriteOp::FindAndModify { .. } => "findAndModify",
        }
    }

    pub fn filter(&self) -> Option<&Document> {
        match self {
            WriteOp::Insert { .. } => None,
            WriteOp::Update { filter, .. } | WriteOp::Delete { filter } => Some(filter),
            WriteOp::FindAndModify { query, .. } => Some(query),
        }
    }
}

/// A write as delivered to one shard by a router.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardWriteRequest {
    pub ns: String,
    pub session: Option<(SessionId, TxnNumber)>,
    pub op: WriteOp,
    /// Collection version the router targeted with; `None` for unsharded.
    pub version: Option<ChunkVersion>,
}

struct PlannedWrite {
    entry: Option<OplogEntry>,
    reply: WriteReply,
}

impl Shard {
    /// Executes one write. A retry of an already executed `(session, txn)`
    /// returns the stored reply without touching storage.
    pub async fn execute_write(&self, request: ShardWriteRequest) -> Result<WriteReply, ShardError> {
        let ShardWriteRequest {
            ns,
            session,
            op,
            version,
        } = request;
        let metadata = self.metadata(&ns).ok_or_else(|| ShardError::NotFound {
            resource_type: ResourceType::Collection,
            resource_id: ns.clone(),
        })?;
        let (keys, key_known) = self.target_keys(&ns, &metadata, &op)?;
        let deadline = Instant::now() + Duration::from_millis(self.config.write_block_timeout_ms);
        let _inflight = self.gates.admit(&ns, &keys, key_known, deadline).await?;
        let metadata = self.check_ownership(&ns, version, &keys)?;

        let checkout = match session {
            Some((session, _)) => Some(self.sessions.checkout(session).await),
            None => None,
        };
        if let (Some(checkout), Some((_, txn))) = (&checkout, session) {
            if let Some(reply) = checkout.stored_reply(txn)? {
                debug!(shard = %self.id, ns = %ns, session = %checkout.session(), txn_number = txn, "retried write answered from session table");
                return Ok(reply);
            }
            if let Some(reply) = checkout.resolve_from_oplog(&self.oplog, txn)? {
                return Ok(reply);
            }
        }

        let (reply, appended) = {
            let mut storage = self.storage.write();
            require_collection(&storage, &ns)?;
            let planned = plan_write(&storage, &ns, &metadata, &op)?;
            let entry = match (planned.entry, session) {
                (Some(entry), _) => entry,
                (None, Some(_)) => OplogEntry::noop(&ns, json!({"msg": "retryable write without effect"})),
                (None, None) => return Ok(planned.reply),
            };
            let entry = match session {
                Some((session, txn)) => entry
                    .with_session(session, txn)
                    .with_reply(planned.reply.clone()),
                None => entry,
            };
            let appended = Shard::log_then_apply(&mut storage, &self.oplog, entry)?;
            (planned.reply, appended)
        };

        let Some((session, txn)) = session else {
            return Ok(reply);
        };
        let record = SessionWriteRecord {
            txn_number: txn,
            reply,
            write_ts: appended.ts,
            op_ts: appended.first_ts,
        };
        let (_, stored) = self.sessions.record_if_absent(session, record)?;
        drop(checkout);
        Ok(stored.reply)
    }

    /// User-level `applyOps`: all operations apply or none do. Each target
    /// collection goes through the same admission and ownership checks as a
    /// single write, so a batch touching a range in its critical section
    /// parks until the gate is released.
    pub async fn apply_ops(&self, db: &str, ops: Vec<Value>) -> Result<usize, ShardError> {
        let mut entries = Vec::with_capacity(ops.len());
        for op in &ops {
            let entry: OplogEntry = serde_json::from_value(op.clone()).map_err(ShardError::decode)?;
            if entry.chain.is_some() || entry.op == OpKind::Noop && entry.lsid.is_some() {
                return Err(ShardError::Validation(
                    "applyOps may not carry chain links or session records".into(),
                ));
            }
            entries.push(entry);
        }

        let deadline = Instant::now() + Duration::from_millis(self.config.write_block_timeout_ms);
        let mut admitted = Vec::new();
        for (ns, (keys, key_known)) in self.batch_targets(&entries) {
            admitted.push(self.gates.admit(&ns, &keys, key_known, deadline).await?);
            self.check_ownership(&ns, None, &keys)?;
        }

        let applied = entries.len();
        let mut storage = self.storage.write();
        let staged = storage.with_batch(&entries)?;
        self.oplog.append_write(OplogEntry::command(
            format!("{db}.$cmd"),
            json!({"applyOps": ops}),
        ))?;
        *storage = staged;
        drop(admitted);
        info!(shard = %self.id, db, ops = applied, "applyOps applied");
        Ok(applied)
    }

    /// Shard keys per collection known to the catalog that a batch writes.
    fn batch_targets(&self, entries: &[OplogEntry]) -> BTreeMap<String, (Vec<KeyValue>, bool)> {
        let mut targets: BTreeMap<String, (Vec<KeyValue>, bool)> = BTreeMap::new();
        for op in entries.iter().flat_map(OplogEntry::data_ops) {
            if op.op == OpKind::Command {
                continue;
            }
            let Some(metadata) = self.metadata(&op.ns) else {
                continue;
            };
            let key = metadata
                .key_pattern()
                .map(|pattern| self.entry_shard_key(&op, pattern));
            let (keys, known) = targets.entry(op.ns.clone()).or_insert((Vec::new(), true));
            match key {
                Some(Some(key)) => keys.push(key),
                Some(None) => *known = false,
                None => {}
            }
        }
        targets
    }

    /// Shard key of the document a data entry writes, read from the entry or
    /// from the stored document its `_id` names.
    fn entry_shard_key(&self, entry: &OplogEntry, pattern: &ShardKeyPattern) -> Option<KeyValue> {
        let key_doc = match entry.op {
            OpKind::Insert | OpKind::Delete => entry.o.as_object()?,
            OpKind::Update => entry.o2.as_ref()?.as_object()?,
            OpKind::Command | OpKind::Noop => return None,
        };
        if let Some(key) = pattern.extract(key_doc) {
            return Some(key);
        }
        let id = KeyValue::from_json(key_doc.get("_id")?).ok()?;
        let storage = self.storage.read();
        pattern.extract(storage.collection(&entry.ns)?.get(&id)?)
    }

    /// Shard keys the write touches. `false` means the key could not be
    /// determined and every raised gate on the namespace applies.
    fn target_keys(
        &self,
        ns: &str,
        metadata: &CollectionMetadata,
        op: &WriteOp,
    ) -> Result<(Vec<KeyValue>, bool), ShardError> {
        let Some(pattern) = metadata.key_pattern() else {
            return Ok((Vec::new(), true));
        };
        if let WriteOp::Insert { documents } = op {
            let keys = documents
                .iter()
                .map(|d| {
                    pattern.extract(d).ok_or_else(|| ShardError::ShardKeyNotFound {
                        ns: ns.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok((keys, true));
        }
        let Some(filter) = op.filter() else {
            return Ok((Vec::new(), false));
        };
        if let Some(key) = pattern.extract_from_filter(filter) {
            return Ok((vec![key], true));
        }
        let stored_key = filter
            .get("_id")
            .and_then(|id| KeyValue::from_json(id).ok())
            .and_then(|id| {
                let storage = self.storage.read();
                pattern.extract(storage.collection(ns)?.get(&id)?)
            });
        Ok(match stored_key {
            Some(key) => (vec![key], true),
            None => (Vec::new(), false),
        })
    }

    fn check_ownership(
        &self,
        ns: &str,
        received: Option<ChunkVersion>,
        keys: &[KeyValue],
    ) -> Result<CollectionMetadata, ShardError> {
        let not_found = || ShardError::NotFound {
            resource_type: ResourceType::Collection,
            resource_id: ns.to_string(),
        };
        let mut metadata = self.metadata(ns).ok_or_else(not_found)?;
        if let Some(received) = received
            && metadata.collection_version() != Some(received)
        {
            metadata = self.refresh_metadata(ns).ok_or_else(not_found)?;
            let wanted = metadata.collection_version();
            if wanted != Some(received) {
                warn!(shard = %self.id, ns, received = %received, wanted = ?wanted, "rejecting write with stale routing version");
                return Err(ShardError::StaleConfig {
                    ns: ns.to_string(),
                    received: received.to_string(),
                    wanted: wanted
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "UNSHARDED".into()),
                });
            }
        }
        if let Some(key) = keys.iter().find(|k| !metadata.owns(k)) {
            warn!(shard = %self.id, ns, key = %key, "rejecting write for a range this shard does not own");
            return Err(ShardError::StaleConfig {
                ns: ns.to_string(),
                received: received
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "none".into()),
                wanted: format!("owner of {key}"),
            });
        }
        Ok(metadata)
    }
}

fn owned(metadata: &CollectionMetadata, doc: &Document) -> bool {
    match metadata.key_pattern() {
        Some(pattern) => pattern.extract(doc).is_some_and(|k| metadata.owns(&k)),
        None => true,
    }
}

fn find_owned<'a>(
    coll: &'a Collection,
    metadata: &CollectionMetadata,
    filter: &Document,
) -> Option<&'a Document> {
    if let Some(id) = id_only_filter(filter) {
        return coll.get(&id).filter(|d| owned(metadata, d));
    }
    coll.find(filter).into_iter().find(|d| owned(metadata, d))
}

/// `{_id, <shard key>}` of a stored document.
pub(crate) fn document_key(pattern: Option<&ShardKeyPattern>, doc: &Document) -> Value {
    let mut key = Map::new();
    if let Some(id) = doc.get("_id") {
        key.insert("_id".into(), id.clone());
    }
    if let Some(pattern) = pattern
        && let Some(v) = doc.get(&pattern.field)
    {
        key.insert(pattern.field.clone(), v.clone());
    }
    Value::Object(key)
}

fn plan_write(
    storage: &Storage,
    ns: &str,
    metadata: &CollectionMetadata,
    op: &WriteOp,
) -> Result<PlannedWrite, ShardError> {
    let coll = storage.collection(ns).ok_or_else(|| ShardError::NotFound {
        resource_type: ResourceType::Collection,
        resource_id: ns.to_string(),
    })?;
    let pattern = metadata.key_pattern();
    match op {
        WriteOp::Insert { documents } => plan_insert(coll, ns, documents),
        WriteOp::Update {
            filter,
            update,
            upsert,
        } => {
            let (entry, reply, _) = plan_modify(coll, ns, metadata, filter, update, *upsert)?;
            Ok(PlannedWrite { entry, reply })
        }
        WriteOp::Delete { filter } => Ok(match find_owned(coll, metadata, filter) {
            Some(doc) => PlannedWrite {
                entry: Some(OplogEntry::delete(ns, document_key(pattern, doc))),
                reply: WriteReply {
                    n: 1,
                    ..WriteReply::default()
                },
            },
            None => PlannedWrite {
                entry: None,
                reply: WriteReply::default(),
            },
        }),
        WriteOp::FindAndModify {
            query,
            update,
            remove,
            upsert,
            return_new,
        } => {
            if *remove {
                return Ok(match find_owned(coll, metadata, query) {
                    Some(doc) => PlannedWrite {
                        entry: Some(OplogEntry::delete(ns, document_key(pattern, doc))),
                        reply: WriteReply {
                            n: 1,
                            value: Some(Value::Object(doc.clone())),
                            ..WriteReply::default()
                        },
                    },
                    None => PlannedWrite {
                        entry: None,
                        reply: WriteReply::default(),
                    },
                });
            }
            let update = update.as_ref().ok_or_else(|| {
                ShardError::Validation("findAndModify requires either update or remove".into())
            })?;
            let (entry, mut reply, images) = plan_modify(coll, ns, metadata, query, update, *upsert)?;
            reply.value = match images {
                Some((_, after)) if *return_new => Some(Value::Object(after)),
                Some((Some(before), _)) => Some(Value::Object(before)),
                _ => None,
            };
            Ok(PlannedWrite { entry, reply })
        }
    }
}

fn plan_insert(coll: &Collection, ns: &str, documents: &[Document]) -> Result<PlannedWrite, ShardError> {
    if documents.is_empty() {
        return Err(ShardError::Validation("insert requires at least one document".into()));
    }
    let mut docs = Vec::with_capacity(documents.len());
    let mut seen = BTreeSet::new();
    for doc in documents {
        let mut doc = doc.clone();
        if !doc.contains_key("_id") {
            doc.insert("_id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        let id = id_of(&doc)?;
        if coll.get(&id).is_some() || !seen.insert(id.clone()) {
            return Err(ShardError::DuplicateKey {
                ns: ns.to_string(),
                key: id.to_string(),
            });
        }
        docs.push(doc);
    }
    let entry = match docs.as_slice() {
        [doc] => OplogEntry::insert(ns, Value::Object(doc.clone())),
        _ => batch_insert_entry(ns, &docs),
    };
    Ok(PlannedWrite {
        entry: Some(entry),
        reply: WriteReply {
            n: docs.len() as u64,
            ..WriteReply::default()
        },
    })
}

type Images = Option<(Option<Document>, Document)>;

/// Plans an update or upsert. Also returns `(pre-image, post-image)` when a
/// document was written.
fn plan_modify(
    coll: &Collection,
    ns: &str,
    metadata: &CollectionMetadata,
    filter: &Document,
    update: &Value,
    upsert: bool,
) -> Result<(Option<OplogEntry>, WriteReply, Images), ShardError> {
    let spec = UpdateSpec::parse(update)?;
    let pattern = metadata.key_pattern();
    if let Some(before) = find_owned(coll, metadata, filter) {
        let mut after = before.clone();
        spec.apply(&mut after)?;
        if let Some(pattern) = pattern
            && pattern.extract(before) != pattern.extract(&after)
        {
            return Err(ShardError::Validation(format!(
                "shard key field '{}' is immutable",
                pattern.field
            )));
        }
        let entry = if after == *before {
            OplogEntry {
                o2: Some(document_key(pattern, before)),
                ..OplogEntry::noop(ns, json!({"msg": "update without changes"}))
            }
        } else {
            OplogEntry::update(ns, diff_between(before, &after), document_key(pattern, before))
        };
        let reply = WriteReply {
            n: 1,
            updated_existing: true,
            ..WriteReply::default()
        };
        return Ok((Some(entry), reply, Some((Some(before.clone()), after))));
    }
    if !upsert {
        return Ok((None, WriteReply::default(), None));
    }

    let mut doc = match &spec {
        UpdateSpec::Replacement(_) => filter
            .get("_id")
            .map(|id| Map::from_iter([("_id".to_string(), id.clone())]))
            .unwrap_or_default(),
        _ => filter
            .iter()
            .filter(|(k, v)| !k.starts_with('$') && !is_operator_expression(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    spec.apply(&mut doc)?;
    if let Some(field) = pattern.map(|p| &p.field)
        && !doc.contains_key(field)
        && let Some(v) = filter.get(field)
    {
        doc.insert(field.clone(), v.clone());
    }
    if !doc.contains_key("_id") {
        doc.insert("_id".into(), Value::String(Uuid::new_v4().to_string()));
    }
    if let Some(pattern) = pattern {
        match pattern.extract(&doc) {
            Some(key) if metadata.owns(&key) => {}
            Some(key) => {
                return Err(ShardError::StaleConfig {
                    ns: ns.to_string(),
                    received: "upsert".into(),
                    wanted: format!("owner of {key}"),
                });
            }
            None => return Err(ShardError::ShardKeyNotFound { ns: ns.to_string() }),
        }
    }
    let id = id_of(&doc)?;
    if coll.get(&id).is_some() {
        return Err(ShardError::DuplicateKey {
            ns: ns.to_string(),
            key: id.to_string(),
        });
    }
    let reply = WriteReply {
        n: 1,
        upserted: doc.get("_id").cloned(),
        ..WriteReply::default()
    };
    let entry = OplogEntry::insert(ns, Value::Object(doc.clone()));
    Ok((Some(entry), reply, Some((None, doc))))
}

fn is_operator_expression(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|m| m.keys().any(|k| k.starts_with('$')))
}

#[cfg(test)]
mod tests {
    use super::{ShardWriteRequest, WriteOp};
    use crate::catalog::{Catalog, CollectionKind};
    use crate::config::ClusterConfig;
    use crate::document::{Document, ShardKeyPattern, to_document};
    use crate::session::SessionId;
    use crate::shard::Shard;
    use crate::storage::CollectionOptions;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn doc(value: Value) -> Document {
        to_document(value).expect("doc")
    }

    fn unsharded(dir: &std::path::Path) -> Arc<Shard> {
        let catalog = Arc::new(Catalog::in_memory());
        catalog.add_shard("shard0", "h0").expect("shard");
        let entry = catalog
            .create_collection("db.c", CollectionKind::Collection, None)
            .expect("create");
        let shard = Shard::open("shard0", dir, ClusterConfig::testing(), catalog).expect("open");
        shard
            .create_local_collection("db.c", CollectionOptions::new(entry.uuid))
            .expect("local");
        shard
    }

    fn request(session: Option<(SessionId, i64)>, op: WriteOp) -> ShardWriteRequest {
        ShardWriteRequest {
            ns: "db.c".into(),
            session,
            op,
            version: None,
        }
    }

    fn inc_counter() -> WriteOp {
        WriteOp::FindAndModify {
            query: doc(json!({"_id": 1})),
            update: Some(json!({"$inc": {"counter": 1}})),
            remove: false,
            upsert: false,
            return_new: true,
        }
    }

    #[tokio::test]
    async fn retried_find_and_modify_executes_once() {
        let dir = tempdir().expect("tempdir");
        let shard = unsharded(dir.path());
        shard
            .execute_write(request(None, WriteOp::Insert { documents: vec![doc(json!({"_id": 1}))] }))
            .await
            .expect("insert");
        let session = Some((SessionId::new(), 7));
        let first = shard.execute_write(request(session, inc_counter())).await.expect("first");
        let second = shard.execute_write(request(session, inc_counter())).await.expect("retry");
        assert_eq!(first, second);
        assert_eq!(first.value, Some(json!({"_id": 1, "counter": 1})));
        let stored = shard.find("db.c", &doc(json!({"_id": 1})));
        assert_eq!(stored[0]["counter"], json!(1));
    }

    #[tokio::test]
    async fn lost_session_record_is_recovered_from_oplog() {
        let dir = tempdir().expect("tempdir");
        let shard = unsharded(dir.path());
        shard
            .execute_write(request(None, WriteOp::Insert { documents: vec![doc(json!({"_id": 1}))] }))
            .await
            .expect("insert");
        let session = SessionId::new();
        shard.sessions().fail_next_record();
        assert!(shard.execute_write(request(Some((session, 1)), inc_counter())).await.is_err());
        assert!(shard.sessions().get(session).is_none());

        let retry = shard
            .execute_write(request(Some((session, 1)), inc_counter()))
            .await
            .expect("retry");
        assert_eq!(retry.value, Some(json!({"_id": 1, "counter": 1})));
        assert_eq!(shard.sessions().get(session).expect("rewritten").txn_number, 1);
        let stored = shard.find("db.c", &doc(json!({"_id": 1})));
        assert_eq!(stored[0]["counter"], json!(1));
    }

    #[tokio::test]
    async fn no_match_is_recorded_and_older_txn_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let shard = unsharded(dir.path());
        let session = SessionId::new();
        let reply = shard
            .execute_write(request(Some((session, 5)), inc_counter()))
            .await
            .expect("no match");
        assert_eq!(reply.n, 0);
        assert_eq!(reply.value, None);
        assert_eq!(shard.sessions().get(session).expect("recorded").txn_number, 5);
        let err = shard
            .execute_write(request(Some((session, 4)), inc_counter()))
            .await
            .expect_err("older txn");
        assert_eq!(err.code_str(), "transaction_too_old");
    }

    #[tokio::test]
    async fn sessions_and_documents_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let session = SessionId::new();
        let first = {
            let shard = unsharded(dir.path());
            shard
                .execute_write(request(
                    Some((session, 1)),
                    WriteOp::Update {
                        filter: doc(json!({"_id": "a"})),
                        update: json!({"$set": {"v": 1}}),
                        upsert: true,
                    },
                ))
                .await
                .expect("upsert")
        };
        assert_eq!(first.upserted, Some(json!("a")));
        let catalog = Arc::new(Catalog::in_memory());
        let shard = Shard::open("shard0", dir.path(), ClusterConfig::testing(), catalog).expect("reopen");
        assert_eq!(shard.count("db.c"), 1);
        assert_eq!(shard.sessions().get(session).expect("session").reply, first);
    }

    #[tokio::test]
    async fn duplicate_id_and_immutable_shard_key() {
        let dir = tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory());
        catalog.add_shard("shard0", "h0").expect("shard");
        catalog.enable_sharding("db", Some("shard0")).expect("db");
        let entry = catalog
            .create_collection("db.c", CollectionKind::Collection, None)
            .expect("create");
        catalog.shard_collection("db.c", ShardKeyPattern::new("x")).expect("shard");
        let shard = Shard::open("shard0", dir.path(), ClusterConfig::testing(), catalog).expect("open");
        shard
            .create_local_collection("db.c", CollectionOptions::new(entry.uuid))
            .expect("local");
        let insert = WriteOp::Insert {
            documents: vec![doc(json!({"_id": 1, "x": 10}))],
        };
        shard.execute_write(request(None, insert.clone())).await.expect("insert");
        let err = shard.execute_write(request(None, insert)).await.expect_err("dup");
        assert_eq!(err.code_str(), "duplicate_key");
        let err = shard
            .execute_write(request(
                None,
                WriteOp::Update {
                    filter: doc(json!({"_id": 1})),
                    update: json!({"$set": {"x": 11}}),
                    upsert: false,
                },
            ))
            .await
            .expect_err("immutable");
        assert_eq!(err.code_str(), "validation");
        let err = shard
            .execute_write(request(
                None,
                WriteOp::Insert {
                    documents: vec![doc(json!({"_id": 2}))],
                },
            ))
            .await
            .expect_err("no shard key");
        assert_eq!(err.code_str(), "shard_key_not_found");
    }
}
