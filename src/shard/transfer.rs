use super::Shard;
use super::write::document_key;
use crate::document::{Document, KeyRange, KeyValue, ShardKeyPattern};
use crate::error::ShardError;
use crate::oplog::{AssembledWrite, ChainAssembler, OpKind, OplogEntry, Timestamp, assemble_all};
use crate::session::{SessionId, SessionWriteRecord};
use crate::storage::{CollectionOptions, batch_insert_entry};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

const CLONE_BATCH_DOCS: usize = 128;

/// Change to one document of a migrating range, as shipped to the recipient.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferMod {
    Upsert(Document),
    Delete(KeyValue),
}

/// Consistent copy of a range taken on the donor.
#[derive(Debug, Clone)]
pub struct RangeSnapshot {
    pub options: CollectionOptions,
    pub indexes: BTreeMap<String, Value>,
    pub docs: Vec<Document>,
    /// Oplog position the snapshot reflects.
    pub ts: Timestamp,
}

/// `_id` and shard key a data entry touches. `None` for entries that do
/// not name a single document.
fn touched(entry: &OplogEntry, pattern: &ShardKeyPattern) -> Option<(KeyValue, Option<KeyValue>)> {
    let key_doc = match entry.op {
        OpKind::Insert | OpKind::Delete => entry.o.as_object()?,
        OpKind::Update | OpKind::Noop => entry.o2.as_ref()?.as_object()?,
        OpKind::Command => return None,
    };
    let id = KeyValue::from_json(key_doc.get("_id")?).ok()?;
    Some((id, pattern.extract(key_doc)))
}

/// Data entries of `write` for `ns`, unpacking `applyOps` batches.
fn data_entries(write: &AssembledWrite, ns: &str) -> Vec<OplogEntry> {
    write
        .entry
        .data_ops()
        .into_iter()
        .filter(|op| op.op != OpKind::Command && op.ns == ns)
        .collect()
}

/// Whether a session write may have touched `range`. Writes without a
/// document key are assumed to.
fn session_write_in_range(write: &AssembledWrite, ns: &str, pattern: &ShardKeyPattern, range: &KeyRange) -> bool {
    if !write.entry.target_namespaces().contains(ns) {
        return false;
    }
    let entries = data_entries(write, ns);
    if entries.is_empty() {
        return true;
    }
    entries.iter().any(|e| match touched(e, pattern) {
        Some((_, Some(key))) => range.contains(&key),
        _ => true,
    })
}

impl Shard {
    fn shard_key_of(&self, ns: &str) -> Result<ShardKeyPattern, ShardError> {
        self.metadata(ns)
            .and_then(|m| m.key_pattern().cloned())
            .ok_or_else(|| ShardError::Validation(format!("'{ns}' is not sharded")))
    }

    // Donor side.

    pub fn clone_range(&self, ns: &str, range: &KeyRange) -> Result<RangeSnapshot, ShardError> {
        let pattern = self.shard_key_of(ns)?;
        let storage = self.storage.read();
        let coll = storage.collection(ns).ok_or_else(|| ShardError::NotFound {
            resource_type: crate::error::ResourceType::Collection,
            resource_id: ns.to_string(),
        })?;
        let snapshot = RangeSnapshot {
            options: coll.options.clone(),
            indexes: coll.indexes().clone(),
            docs: storage.docs_in_range(ns, &pattern, range),
            ts: self.oplog.last_ts(),
        };
        debug!(shard = %self.id, ns, range = %range, docs = snapshot.docs.len(), ts = %snapshot.ts, "range cloned");
        Ok(snapshot)
    }

    /// Current state of every document in `range` written after `after`.
    /// Returns the mods and the oplog position they reflect.
    pub fn transfer_mods_since(
        &self,
        ns: &str,
        range: &KeyRange,
        after: Timestamp,
    ) -> Result<(Vec<TransferMod>, Timestamp), ShardError> {
        let pattern = self.shard_key_of(ns)?;
        let storage = self.storage.read();
        let cursor = self.oplog.last_ts();
        let entries: Vec<_> = self
            .oplog
            .fetch_namespace_since(ns, after)
            .into_iter()
            .filter(|e| e.ts <= cursor && !e.from_migrate)
            .collect();
        let writes = assemble_all(entries.iter().map(|e| e.as_ref()))?;
        let mut ids = BTreeSet::new();
        for write in &writes {
            for entry in data_entries(write, ns) {
                if let Some((id, key)) = touched(&entry, &pattern)
                    && key.as_ref().is_none_or(|k| range.contains(k))
                {
                    ids.insert(id);
                }
            }
        }
        let coll = storage.collection(ns);
        let mods = ids
            .into_iter()
            .map(|id| match coll.and_then(|c| c.get(&id)) {
                Some(doc) if pattern.extract(doc).is_some_and(|k| range.contains(&k)) => {
                    TransferMod::Upsert(doc.clone())
                }
                _ => TransferMod::Delete(id),
            })
            .collect();
        Ok((mods, cursor))
    }

    /// Sessions with a write on `range` after `after`, and the position the
    /// scan reached.
    pub fn sessions_touching(
        &self,
        ns: &str,
        range: &KeyRange,
        after: Timestamp,
    ) -> Result<(BTreeSet<SessionId>, Timestamp), ShardError> {
        let pattern = self.shard_key_of(ns)?;
        let cursor = self.oplog.last_ts();
        let entries: Vec<_> = self
            .oplog
            .fetch_namespace_since(ns, after)
            .into_iter()
            .filter(|e| e.ts <= cursor && e.lsid.is_some())
            .collect();
        let sessions = assemble_all(entries.iter().map(|e| e.as_ref()))?
            .iter()
            .filter(|w| session_write_in_range(w, ns, &pattern, range))
            .filter_map(|w| w.entry.lsid)
            .collect();
        Ok((sessions, cursor))
    }

    /// Up to `limit` complete writes of `session` on `range` after `after`.
    /// The returned cursor never points inside a chain.
    pub fn session_writes_since(
        &self,
        ns: &str,
        range: &KeyRange,
        session: SessionId,
        after: Timestamp,
        limit: usize,
    ) -> Result<(Vec<AssembledWrite>, Timestamp), ShardError> {
        let pattern = self.shard_key_of(ns)?;
        let mut history = self.oplog.fetch_since(session, after);
        let mut assembler = ChainAssembler::new();
        let mut writes = Vec::new();
        let mut cursor = after;
        for entry in history.by_ref() {
            match assembler.feed(&entry)? {
                Some(write) => {
                    cursor = entry.ts;
                    if write.entry.reply.is_some() && session_write_in_range(&write, ns, &pattern, range) {
                        writes.push(write);
                        if writes.len() >= limit {
                            break;
                        }
                    }
                }
                None if !assembler.has_pending() => cursor = entry.ts,
                None => {}
            }
        }
        Ok((writes, cursor))
    }

    // Recipient side.

    pub fn receive_clone(&self, ns: &str, snapshot: &RangeSnapshot) -> Result<usize, ShardError> {
        self.create_local_collection(ns, snapshot.options.clone())?;
        let existing = self
            .with_storage(|s| s.collection(ns).map(|c| c.indexes().clone()))
            .unwrap_or_default();
        for (name, key) in &snapshot.indexes {
            if !existing.contains_key(name) {
                self.create_local_index(ns, name, key.clone())?;
            }
        }
        let mut storage = self.storage.write();
        for batch in snapshot.docs.chunks(CLONE_BATCH_DOCS) {
            Shard::log_then_apply(&mut storage, &self.oplog, batch_insert_entry(ns, batch).from_migrate())?;
        }
        Ok(snapshot.docs.len())
    }

    pub fn apply_transfer_mods(&self, ns: &str, range: &KeyRange, mods: &[TransferMod]) -> Result<usize, ShardError> {
        let pattern = self.shard_key_of(ns)?;
        let mut storage = self.storage.write();
        let mut applied = 0;
        for m in mods {
            let entry = match m {
                TransferMod::Upsert(doc) => OplogEntry::insert(ns, Value::Object(doc.clone())),
                TransferMod::Delete(id) => {
                    let Some(doc) = storage.collection(ns).and_then(|c| c.get(id)) else {
                        continue;
                    };
                    if !pattern.extract(doc).is_some_and(|k| range.contains(&k)) {
                        continue;
                    }
                    OplogEntry::delete(ns, document_key(Some(&pattern), doc))
                }
            };
            Shard::log_then_apply(&mut storage, &self.oplog, entry.from_migrate())?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Installs retryable-write history received from a donor. Each imported
    /// write is persisted as a no-op entry carrying the session and reply.
    pub async fn import_session_history(&self, ns: &str, writes: &[AssembledWrite]) -> Result<usize, ShardError> {
        let mut imported = 0;
        for write in writes {
            let (Some((session, txn)), Some(reply)) = (write.entry.session_key(), write.entry.reply.clone()) else {
                continue;
            };
            let _checkout = self.sessions.checkout(session).await;
            if self.sessions.get(session).is_some_and(|r| r.txn_number >= txn) {
                continue;
            }
            let entry = OplogEntry::noop(
                ns,
                json!({"msg": "migrated retryable write", "donorTs": write.entry.ts}),
            )
            .with_session(session, txn)
            .with_reply(reply.clone())
            .from_migrate();
            let appended = self.oplog.append_write(entry)?;
            let record = SessionWriteRecord {
                txn_number: txn,
                reply,
                write_ts: appended.ts,
                op_ts: appended.first_ts,
            };
            if self.sessions.import_migrated(session, record) {
                imported += 1;
            }
        }
        Ok(imported)
    }

    /// Deletes every document of `range` with `fromMigrate` entries. Used by
    /// the donor after commit and by the recipient after abort.
    pub fn delete_range_from_migrate(&self, ns: &str, range: &KeyRange) -> Result<usize, ShardError> {
        let Some(pattern) = self.metadata(ns).and_then(|m| m.key_pattern().cloned()) else {
            return Ok(0);
        };
        let mut storage = self.storage.write();
        let docs = storage.docs_in_range(ns, &pattern, range);
        for doc in &docs {
            let entry = OplogEntry::delete(ns, document_key(Some(&pattern), doc)).from_migrate();
            Shard::log_then_apply(&mut storage, &self.oplog, entry)?;
        }
        if !docs.is_empty() {
            info!(shard = %self.id, ns, range = %range, docs = docs.len(), "range deleted");
        }
        Ok(docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::TransferMod;
    use crate::catalog::{Catalog, CollectionKind};
    use crate::config::ClusterConfig;
    use crate::document::{KeyRange, KeyValue, ShardKeyPattern, to_document};
    use crate::oplog::Timestamp;
    use crate::session::SessionId;
    use crate::shard::{Shard, ShardWriteRequest, WriteOp};
    use crate::storage::CollectionOptions;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sharded_pair() -> (TempDir, Arc<Shard>, Arc<Shard>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = Arc::new(Catalog::in_memory());
        catalog.add_shard("shard0", "h0").expect("shard0");
        catalog.add_shard("shard1", "h1").expect("shard1");
        catalog.enable_sharding("db", Some("shard0")).expect("db");
        let entry = catalog
            .create_collection("db.c", CollectionKind::Collection, None)
            .expect("create");
        catalog.shard_collection("db.c", ShardKeyPattern::new("x")).expect("shard");
        let donor = Shard::open("shard0", dir.path().join("s0"), ClusterConfig::testing(), catalog.clone())
            .expect("donor");
        let recipient = Shard::open("shard1", dir.path().join("s1"), ClusterConfig::testing(), catalog)
            .expect("recipient");
        donor
            .create_local_collection("db.c", CollectionOptions::new(entry.uuid))
            .expect("local");
        (dir, donor, recipient)
    }

    async fn insert(shard: &Shard, session: Option<(SessionId, i64)>, x: i64) {
        shard
            .execute_write(ShardWriteRequest {
                ns: "db.c".into(),
                session,
                op: WriteOp::Insert {
                    documents: vec![to_document(json!({"_id": x, "x": x})).expect("doc")],
                },
                version: None,
            })
            .await
            .expect("insert");
    }

    fn low() -> KeyRange {
        KeyRange::new(KeyValue::MinKey, KeyValue::number(10.0))
    }

    #[tokio::test]
    async fn clone_and_mods_converge_on_recipient() {
        let (_dir, donor, recipient) = sharded_pair();
        for x in [1, 2, 50] {
            insert(&donor, None, x).await;
        }
        let snapshot = donor.clone_range("db.c", &low()).expect("clone");
        assert_eq!(snapshot.docs.len(), 2);
        recipient.receive_clone("db.c", &snapshot).expect("receive");

        insert(&donor, None, 3).await;
        insert(&donor, None, 60).await;
        donor
            .execute_write(ShardWriteRequest {
                ns: "db.c".into(),
                session: None,
                op: WriteOp::Delete {
                    filter: to_document(json!({"_id": 1})).expect("filter"),
                },
                version: None,
            })
            .await
            .expect("delete");
        let (mods, cursor) = donor
            .transfer_mods_since("db.c", &low(), snapshot.ts)
            .expect("mods");
        assert_eq!(mods.len(), 2);
        assert!(mods.contains(&TransferMod::Delete(KeyValue::number(1.0))));
        recipient.apply_transfer_mods("db.c", &low(), &mods).expect("apply");
        assert_eq!(recipient.with_storage(|s| s.count("db.c")), 2);

        let (again, _) = donor.transfer_mods_since("db.c", &low(), cursor).expect("mods");
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn session_history_is_filtered_by_range_and_imported_once() {
        let (_dir, donor, recipient) = sharded_pair();
        let inside = SessionId::new();
        let outside = SessionId::new();
        insert(&donor, Some((inside, 1)), 4).await;
        insert(&donor, Some((outside, 1)), 40).await;

        let (sessions, _) = donor
            .sessions_touching("db.c", &low(), Timestamp::ZERO)
            .expect("sessions");
        assert_eq!(sessions.into_iter().collect::<Vec<_>>(), vec![inside]);

        let snapshot = donor.clone_range("db.c", &low()).expect("clone");
        recipient.receive_clone("db.c", &snapshot).expect("receive");
        let (writes, cursor) = donor
            .session_writes_since("db.c", &low(), inside, Timestamp::ZERO, 16)
            .expect("history");
        assert_eq!(writes.len(), 1);
        assert!(cursor > Timestamp::ZERO);
        assert_eq!(recipient.import_session_history("db.c", &writes).await.expect("import"), 1);
        assert_eq!(recipient.import_session_history("db.c", &writes).await.expect("again"), 0);
        assert_eq!(
            recipient.sessions().get(inside).map(|r| r.reply),
            donor.sessions().get(inside).map(|r| r.reply)
        );
    }
}
