use crate::error::ShardError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// A totally ordered key used for `_id`s and shard key bounds.
///
/// Ordering follows the canonical document ordering restricted to the value
/// kinds accepted in keys: `MinKey < Null < Number < String < MaxKey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Null,
    Number(f64),
    String(String),
    MaxKey,
}

impl KeyValue {
    pub fn from_json(value: &Value) -> Result<Self, ShardError> {
        match value {
            Value::Null => Ok(KeyValue::Null),
            Value::Number(n) => {
                let n = n
                    .as_f64()
                    .ok_or_else(|| ShardError::Validation(format!("unsupported number {n}")))?;
                Ok(KeyValue::number(n))
            }
            Value::String(s) => Ok(KeyValue::String(s.clone())),
            Value::Object(map) if map.len() == 1 && map.contains_key("$minKey") => {
                Ok(KeyValue::MinKey)
            }
            Value::Object(map) if map.len() == 1 && map.contains_key("$maxKey") => {
                Ok(KeyValue::MaxKey)
            }
            other => Err(ShardError::Validation(format!(
                "unsupported key value: {other}"
            ))),
        }
    }

    pub fn number(n: f64) -> Self {
        // -0.0 and 0.0 are the same key.
        KeyValue::Number(if n == 0.0 { 0.0 } else { n })
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::MinKey => serde_json::json!({"$minKey": 1}),
            KeyValue::Null => Value::Null,
            KeyValue::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            KeyValue::String(s) => Value::String(s.clone()),
            KeyValue::MaxKey => serde_json::json!({"$maxKey": 1}),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            KeyValue::MinKey => 0,
            KeyValue::Null => 1,
            KeyValue::Number(_) => 2,
            KeyValue::String(_) => 3,
            KeyValue::MaxKey => 4,
        }
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Number(a), KeyValue::Number(b)) => a.total_cmp(b),
            (KeyValue::String(a), KeyValue::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl std::fmt::Display for KeyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyValue::MinKey => write!(f, "MinKey"),
            KeyValue::Null => write!(f, "null"),
            KeyValue::Number(n) => write!(f, "{n}"),
            KeyValue::String(s) => write!(f, "{s:?}"),
            KeyValue::MaxKey => write!(f, "MaxKey"),
        }
    }
}

/// Half-open shard key range `[min, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub min: KeyValue,
    pub max: KeyValue,
}

impl KeyRange {
    pub fn new(min: KeyValue, max: KeyValue) -> Self {
        Self { min, max }
    }

    pub fn full() -> Self {
        Self::new(KeyValue::MinKey, KeyValue::MaxKey)
    }

    pub fn contains(&self, key: &KeyValue) -> bool {
        &self.min <= key && key < &self.max
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.min < other.max && other.min < self.max
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.min, self.max)
    }
}

/// Single-field ascending shard key, e.g. `{x: 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    pub field: String,
}

impl ShardKeyPattern {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
        }
    }

    /// Name of the index that supports this shard key.
    pub fn index_name(&self) -> String {
        format!("{}_1", self.field)
    }

    pub fn extract(&self, doc: &super::Document) -> Option<KeyValue> {
        doc.get(&self.field)
            .and_then(|v| KeyValue::from_json(v).ok())
    }

    /// Shard key from an equality filter; operator expressions do not target.
    pub fn extract_from_filter(&self, filter: &super::Document) -> Option<KeyValue> {
        match filter.get(&self.field) {
            Some(Value::Object(map)) if map.keys().any(|k| k.starts_with('$')) => None,
            Some(v) => KeyValue::from_json(v).ok(),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyRange, KeyValue};
    use serde_json::json;

    #[test]
    fn canonical_order_across_kinds() {
        let mut keys = vec![
            KeyValue::MaxKey,
            KeyValue::String("a".into()),
            KeyValue::number(10.0),
            KeyValue::Null,
            KeyValue::number(-3.5),
            KeyValue::MinKey,
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                KeyValue::MinKey,
                KeyValue::Null,
                KeyValue::number(-3.5),
                KeyValue::number(10.0),
                KeyValue::String("a".into()),
                KeyValue::MaxKey,
            ]
        );
    }

    #[test]
    fn negative_zero_equals_zero() {
        assert_eq!(KeyValue::number(-0.0), KeyValue::number(0.0));
    }

    #[test]
    fn range_is_half_open() {
        let range = KeyRange::new(KeyValue::number(1.0), KeyValue::number(5.0));
        assert!(range.contains(&KeyValue::number(1.0)));
        assert!(range.contains(&KeyValue::number(4.9)));
        assert!(!range.contains(&KeyValue::number(5.0)));
        assert!(KeyRange::full().contains(&KeyValue::String("zzz".into())));
        let next = KeyRange::new(KeyValue::number(5.0), KeyValue::MaxKey);
        assert!(!range.overlaps(&next));
    }

    #[test]
    fn json_round_trip_for_bounds() {
        let min = KeyValue::from_json(&json!({"$minKey": 1})).expect("min");
        assert_eq!(min, KeyValue::MinKey);
        assert_eq!(KeyValue::number(7.0).to_json(), json!(7));
        assert!(KeyValue::from_json(&json!([1, 2])).is_err());
    }
}
