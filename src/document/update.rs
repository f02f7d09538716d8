use super::Document;
use crate::error::ShardError;
use serde_json::{Map, Value};

/// A parsed update document.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateSpec {
    /// Whole-document replacement; `_id` is preserved.
    Replacement(Document),
    /// `$set` / `$inc` / `$unset` operators.
    Operators(Document),
    /// Oplog diff form `{"$v": 2, "diff": {"i": .., "u": .., "d": ..}}`.
    Diff(Document),
}

impl UpdateSpec {
    pub fn parse(update: &Value) -> Result<Self, ShardError> {
        let Value::Object(map) = update else {
            return Err(ShardError::Validation(
                "update must be a document".into(),
            ));
        };
        if map.contains_key("$v") {
            let Some(Value::Object(diff)) = map.get("diff") else {
                return Err(ShardError::Validation(
                    "$v update without diff document".into(),
                ));
            };
            return Ok(UpdateSpec::Diff(diff.clone()));
        }
        let operators = map.keys().filter(|k| k.starts_with('$')).count();
        match operators {
            0 => Ok(UpdateSpec::Replacement(map.clone())),
            n if n == map.len() => Ok(UpdateSpec::Operators(map.clone())),
            _ => Err(ShardError::Validation(
                "update mixes operators and replacement fields".into(),
            )),
        }
    }

    pub fn apply(&self, doc: &mut Document) -> Result<(), ShardError> {
        match self {
            UpdateSpec::Replacement(replacement) => {
                let id = doc.get("_id").cloned();
                if let (Some(old), Some(new)) = (&id, replacement.get("_id"))
                    && old != new
                {
                    return Err(ShardError::Validation("_id is immutable".into()));
                }
                doc.clear();
                if let Some(id) = id {
                    doc.insert("_id".into(), id);
                }
                for (k, v) in replacement {
                    if k != "_id" {
                        doc.insert(k.clone(), v.clone());
                    }
                }
                Ok(())
            }
            UpdateSpec::Operators(ops) => {
                for (op, args) in ops {
                    let Value::Object(args) = args else {
                        return Err(ShardError::Validation(format!(
                            "{op} expects a document"
                        )));
                    };
                    for (field, arg) in args {
                        if field == "_id" {
                            return Err(ShardError::Validation("_id is immutable".into()));
                        }
                        match op.as_str() {
                            "$set" => {
                                doc.insert(field.clone(), arg.clone());
                            }
                            "$unset" => {
                                doc.remove(field);
                            }
                            "$inc" => {
                                let current = doc.get(field).cloned().unwrap_or(Value::from(0));
                                doc.insert(field.clone(), add_numbers(field, &current, arg)?);
                            }
                            other => {
                                return Err(ShardError::Validation(format!(
                                    "unsupported update operator {other}"
                                )));
                            }
                        }
                    }
                }
                Ok(())
            }
            UpdateSpec::Diff(diff) => {
                for (section, fields) in diff {
                    let Value::Object(fields) = fields else {
                        return Err(ShardError::Validation(format!(
                            "diff section '{section}' must be a document"
                        )));
                    };
                    match section.as_str() {
                        "i" | "u" => {
                            for (k, v) in fields {
                                doc.insert(k.clone(), v.clone());
                            }
                        }
                        "d" => {
                            for k in fields.keys() {
                                doc.remove(k);
                            }
                        }
                        other => {
                            return Err(ShardError::Validation(format!(
                                "unsupported diff section '{other}'"
                            )));
                        }
                    }
                }
                Ok(())
            }
        }
    }
}

fn add_numbers(field: &str, current: &Value, delta: &Value) -> Result<Value, ShardError> {
    let (Value::Number(a), Value::Number(b)) = (current, delta) else {
        return Err(ShardError::Validation(format!(
            "cannot apply $inc to non-numeric field '{field}'"
        )));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        return a
            .checked_add(b)
            .map(Value::from)
            .ok_or_else(|| ShardError::Validation(format!("$inc overflow on '{field}'")));
    }
    let sum = a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default();
    serde_json::Number::from_f64(sum)
        .map(Value::Number)
        .ok_or_else(|| ShardError::Validation(format!("$inc produced NaN on '{field}'")))
}

/// Builds the deterministic v2 diff that turns `before` into `after`.
pub fn diff_between(before: &Document, after: &Document) -> Value {
    let mut inserted = Map::new();
    let mut updated = Map::new();
    let mut deleted = Map::new();
    for (k, v) in after {
        match before.get(k) {
            None => {
                inserted.insert(k.clone(), v.clone());
            }
            Some(old) if old != v => {
                updated.insert(k.clone(), v.clone());
            }
            Some(_) => {}
        }
    }
    for k in before.keys() {
        if !after.contains_key(k) {
            deleted.insert(k.clone(), Value::Bool(false));
        }
    }
    let mut diff = Map::new();
    if !inserted.is_empty() {
        diff.insert("i".into(), Value::Object(inserted));
    }
    if !updated.is_empty() {
        diff.insert("u".into(), Value::Object(updated));
    }
    if !deleted.is_empty() {
        diff.insert("d".into(), Value::Object(deleted));
    }
    serde_json::json!({"$v": 2, "diff": Value::Object(diff)})
}

#[cfg(test)]
mod tests {
    use super::{UpdateSpec, diff_between};
    use crate::document::to_document;
    use serde_json::json;

    #[test]
    fn inc_creates_and_increments() {
        let mut doc = to_document(json!({"_id": 1, "counter": 0})).expect("doc");
        let spec = UpdateSpec::parse(&json!({"$inc": {"counter": 1, "fresh": 2}})).expect("parse");
        spec.apply(&mut doc).expect("apply");
        assert_eq!(doc.get("counter"), Some(&json!(1)));
        assert_eq!(doc.get("fresh"), Some(&json!(2)));
    }

    #[test]
    fn replacement_keeps_id_and_rejects_id_change() {
        let mut doc = to_document(json!({"_id": 1, "a": 1})).expect("doc");
        UpdateSpec::parse(&json!({"b": 2}))
            .expect("parse")
            .apply(&mut doc)
            .expect("apply");
        assert_eq!(serde_json::Value::Object(doc.clone()), json!({"_id": 1, "b": 2}));
        let err = UpdateSpec::parse(&json!({"_id": 2}))
            .expect("parse")
            .apply(&mut doc)
            .expect_err("immutable id");
        assert_eq!(err.code_str(), "validation");
    }

    #[test]
    fn mixed_update_is_rejected() {
        assert!(UpdateSpec::parse(&json!({"$set": {"a": 1}, "b": 2})).is_err());
    }

    #[test]
    fn diff_replays_to_same_document() {
        let before = to_document(json!({"_id": 1, "a": 1, "gone": true, "same": "x"})).expect("doc");
        let after = to_document(json!({"_id": 1, "a": 2, "b": 1, "same": "x"})).expect("doc");
        let diff = diff_between(&before, &after);
        assert_eq!(
            diff,
            json!({"$v": 2, "diff": {"i": {"b": 1}, "u": {"a": 2}, "d": {"gone": false}}})
        );
        let mut replayed = before.clone();
        UpdateSpec::parse(&diff)
            .expect("parse")
            .apply(&mut replayed)
            .expect("apply");
        assert_eq!(replayed, after);
    }

    #[test]
    fn inc_on_string_fails() {
        let mut doc = to_document(json!({"_id": 1, "name": "x"})).expect("doc");
        let err = UpdateSpec::parse(&json!({"$inc": {"name": 1}}))
            .expect("parse")
            .apply(&mut doc)
            .expect_err("non numeric");
        assert!(err.to_string().contains("non-numeric"));
    }
}
