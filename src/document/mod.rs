mod key;
mod update;

pub use key::{KeyRange, KeyValue, ShardKeyPattern};
pub use update::{UpdateSpec, diff_between};

use crate::error::ShardError;
use serde_json::{Map, Value};

pub type Document = Map<String, Value>;

pub fn to_document(value: Value) -> Result<Document, ShardError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(ShardError::Validation(format!(
            "expected a document, got {other}"
        ))),
    }
}

/// The `_id` of a stored document as an ordered key.
pub fn id_of(doc: &Document) -> Result<KeyValue, ShardError> {
    let id = doc
        .get("_id")
        .ok_or_else(|| ShardError::Validation("document is missing _id".into()))?;
    KeyValue::from_json(id)
}

/// Equality match over top-level fields.
pub fn matches(filter: &Document, doc: &Document) -> bool {
    filter.iter().all(|(field, expected)| match doc.get(field) {
        Some(actual) => values_equal(actual, expected),
        None => expected.is_null(),
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Filter that selects exactly one document by `_id`, if that is all it does.
pub fn id_only_filter(filter: &Document) -> Option<KeyValue> {
    if filter.len() != 1 {
        return None;
    }
    filter.get("_id").and_then(|v| KeyValue::from_json(v).ok())
}

/// Approximate in-memory footprint used for size limits and reporting.
pub fn encoded_len(doc: &Document) -> usize {
    serde_json::to_vec(doc).map(|v| v.len()).unwrap_or(0)
}
