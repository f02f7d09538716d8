use super::{CollectionOptions, Storage, TimeseriesOptions};
use crate::document::{Document, KeyValue, UpdateSpec, id_of, to_document};
use crate::error::ShardError;
use crate::oplog::{OpKind, OplogEntry};
use serde_json::Value;
use uuid::Uuid;

fn db_of(ns: &str) -> &str {
    ns.split_once('.').map(|(db, _)| db).unwrap_or(ns)
}

fn document_id(value: Option<&Value>, what: &str) -> Result<KeyValue, ShardError> {
    let id = value
        .and_then(|v| v.get("_id"))
        .ok_or_else(|| ShardError::Validation(format!("{what} is missing _id")))?;
    KeyValue::from_json(id)
}

impl Storage {
    /// Applies one oplog entry. `rid` only takes effect on collections that
    /// replicate record ids.
    pub fn apply_entry(&mut self, entry: &OplogEntry) -> Result<(), ShardError> {
        if entry.chain.is_some() {
            return Err(ShardError::Validation(
                "oplog chain links must be assembled before they are applied".into(),
            ));
        }
        match entry.op {
            OpKind::Insert => {
                let doc = to_document(entry.o.clone())?;
                let id = id_of(&doc)?;
                let coll = self.collection_mut(&entry.ns)?;
                if coll.options.record_ids_replicated
                    && let Some(rid) = entry.rid
                {
                    coll.record_ids.insert(id.clone(), rid);
                }
                coll.docs.insert(id, doc);
                Ok(())
            }
            OpKind::Update => {
                let id = document_id(entry.o2.as_ref(), "update document key")?;
                let spec = UpdateSpec::parse(&entry.o)?;
                let coll = self.collection_mut(&entry.ns)?;
                let doc = coll.docs.get_mut(&id).ok_or_else(|| {
                    ShardError::Validation(format!(
                        "update on '{}' matched no document with _id {id}",
                        entry.ns
                    ))
                })?;
                spec.apply(doc)?;
                if coll.options.record_ids_replicated
                    && let Some(rid) = entry.rid
                {
                    coll.record_ids.insert(id, rid);
                }
                Ok(())
            }
            OpKind::Delete => {
                let id = document_id(Some(&entry.o), "delete")?;
                let coll = self.collection_mut(&entry.ns)?;
                coll.docs.remove(&id);
                coll.record_ids.remove(&id);
                Ok(())
            }
            OpKind::Command => self.apply_command(entry),
            OpKind::Noop => Ok(()),
        }
    }

    /// Copy of this storage with every entry applied. `self` is untouched,
    /// so a batch that fails part way leaves no trace.
    pub fn with_batch(&self, entries: &[OplogEntry]) -> Result<Storage, ShardError> {
        let mut staged = self.clone();
        for entry in entries {
            staged.apply_entry(entry)?;
        }
        Ok(staged)
    }

    fn apply_command(&mut self, entry: &OplogEntry) -> Result<(), ShardError> {
        let Value::Object(cmd) = &entry.o else {
            return Err(ShardError::Validation("command entry must be a document".into()));
        };
        let db = db_of(&entry.ns);
        let name = |field: &str| -> Result<String, ShardError> {
            cmd.get(field)
                .and_then(Value::as_str)
                .map(|coll| format!("{db}.{coll}"))
                .ok_or_else(|| ShardError::Validation(format!("{field} expects a collection name")))
        };
        if cmd.contains_key("create") {
            let ns = name("create")?;
            let uuid = match cmd.get("uuid").and_then(Value::as_str) {
                Some(s) => Uuid::parse_str(s).map_err(ShardError::decode)?,
                None => Uuid::new_v4(),
            };
            let timeseries = cmd
                .get("timeseries")
                .map(|t| serde_json::from_value::<TimeseriesOptions>(t.clone()))
                .transpose()
                .map_err(ShardError::decode)?;
            let options = CollectionOptions {
                uuid,
                record_ids_replicated: cmd
                    .get("recordIdsReplicated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                timeseries,
            };
            return self.create_collection(&ns, options);
        }
        if cmd.contains_key("drop") {
            self.drop_collection(&name("drop")?);
            return Ok(());
        }
        if cmd.contains_key("dropDatabase") {
            self.drop_database(db);
            return Ok(());
        }
        if cmd.contains_key("createIndexes") {
            let ns = name("createIndexes")?;
            let specs = cmd
                .get("indexes")
                .and_then(Value::as_array)
                .ok_or_else(|| ShardError::Validation("createIndexes expects indexes".into()))?;
            for spec in specs {
                let index_name = spec
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ShardError::Validation("index spec without name".into()))?;
                let key = spec
                    .get("key")
                    .cloned()
                    .ok_or_else(|| ShardError::Validation("index spec without key".into()))?;
                self.create_index(&ns, index_name, key)?;
            }
            return Ok(());
        }
        if cmd.contains_key("dropIndexes") {
            let ns = name("dropIndexes")?;
            if let Some(index) = cmd.get("index").and_then(Value::as_str) {
                self.drop_index(&ns, index)?;
            }
            return Ok(());
        }
        if let Some(Value::Array(ops)) = cmd.get("applyOps") {
            for op in ops {
                let nested: OplogEntry = serde_json::from_value(op.clone()).map_err(ShardError::decode)?;
                self.apply_entry(&nested)?;
            }
            return Ok(());
        }
        let verb = cmd.keys().next().cloned().unwrap_or_default();
        Err(ShardError::CommandNotSupported(format!(
            "'{verb}' in oplog command entry"
        )))
    }
}

/// Builds the `applyOps` command entry that logs a multi-document insert.
pub fn batch_insert_entry(ns: &str, docs: &[Document]) -> OplogEntry {
    let ops: Vec<Value> = docs
        .iter()
        .map(|d| serde_json::json!({"op": "i", "ns": ns, "o": Value::Object(d.clone())}))
        .collect();
    OplogEntry::command(
        format!("{}.$cmd", db_of(ns)),
        serde_json::json!({"applyOps": ops}),
    )
}

#[cfg(test)]
mod tests {
    use super::batch_insert_entry;
    use crate::document::{KeyValue, to_document};
    use crate::oplog::OplogEntry;
    use crate::storage::{CollectionOptions, Storage};
    use serde_json::json;
    use uuid::Uuid;

    fn storage_with(ns: &str, record_ids: bool) -> Storage {
        let mut storage = Storage::new(record_ids);
        storage
            .create_collection(
                ns,
                CollectionOptions {
                    record_ids_replicated: record_ids,
                    ..CollectionOptions::new(Uuid::new_v4())
                },
            )
            .expect("create");
        storage
    }

    #[test]
    fn rid_is_kept_only_when_collection_replicates_record_ids() {
        let insert = OplogEntry {
            rid: Some(9),
            ..OplogEntry::insert("db.c", json!({"_id": 1}))
        };
        let mut plain = storage_with("db.c", false);
        plain.apply_entry(&insert).expect("apply");
        let coll = plain.collection("db.c").expect("coll");
        assert_eq!(coll.len(), 1);
        assert_eq!(coll.record_id(&KeyValue::number(1.0)), None);

        let mut replicated = storage_with("db.c", true);
        replicated.apply_entry(&insert).expect("apply");
        assert_eq!(
            replicated
                .collection("db.c")
                .expect("coll")
                .record_id(&KeyValue::number(1.0)),
            Some(9)
        );
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let storage = storage_with("db.c", false);
        let entries = vec![
            OplogEntry::insert("db.c", json!({"_id": 1})),
            OplogEntry::update("db.c", json!({"$v": 2, "diff": {"i": {"b": 1}}}), json!({"_id": 404})),
        ];
        assert!(storage.with_batch(&entries).is_err());
        assert_eq!(storage.count("db.c"), 0);
        let staged = storage.with_batch(&entries[..1]).expect("insert only");
        assert_eq!(staged.count("db.c"), 1);
    }

    #[test]
    fn nested_apply_ops_inserts_every_document() {
        let mut storage = storage_with("db.c", false);
        let docs: Vec<_> = (0..3)
            .map(|i| to_document(json!({"_id": i, "v": i})).expect("doc"))
            .collect();
        storage.apply_entry(&batch_insert_entry("db.c", &docs)).expect("apply");
        assert_eq!(storage.count("db.c"), 3);
    }

    #[test]
    fn create_and_index_commands() {
        let mut storage = Storage::new(false);
        storage
            .apply_entry(&OplogEntry::command("db.$cmd", json!({"create": "c"})))
            .expect("create");
        storage
            .apply_entry(&OplogEntry::command(
                "db.$cmd",
                json!({"createIndexes": "c", "indexes": [{"name": "x_1", "key": {"x": 1}}]}),
            ))
            .expect("index");
        assert!(storage.collection("db.c").expect("coll").indexes().contains_key("x_1"));
        let err = storage
            .apply_entry(&OplogEntry::command("db.$cmd", json!({"collMod": "c"})))
            .expect_err("unsupported");
        assert_eq!(err.code_str(), "command_not_supported");
    }
}
