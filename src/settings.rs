use crate::document::Document;
use crate::error::ShardError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Shape of a command: what it runs against and which fields its filter
/// names, ignoring the values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryShape {
    pub ns: String,
    pub command: String,
    /// Sorted, de-duplicated.
    pub filter_fields: Vec<String>,
    #[serde(default)]
    pub raw_data: bool,
}

impl QueryShape {
    pub fn new(ns: impl Into<String>, command: impl Into<String>, filter: Option<&Document>) -> Self {
        let mut filter_fields: Vec<String> = filter
            .map(|f| f.keys().cloned().collect())
            .unwrap_or_default();
        filter_fields.sort();
        filter_fields.dedup();
        Self {
            ns: ns.into(),
            command: command.into(),
            filter_fields,
            raw_data: false,
        }
    }

    pub fn raw(mut self) -> Self {
        self.raw_data = true;
        self
    }
}

impl std::fmt::Display for QueryShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on {} filtering [{}]", self.command, self.ns, self.filter_fields.join(", "))?;
        if self.raw_data {
            write!(f, " (rawData)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySettings {
    #[serde(default)]
    pub reject: bool,
}

/// Cluster-wide query settings keyed by shape.
#[derive(Debug, Default)]
pub struct QuerySettingsStore {
    settings: RwLock<HashMap<QueryShape, QuerySettings>>,
}

impl QuerySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings cannot target raw-data commands, which operate below the
    /// user-visible collection.
    pub fn set(&self, shape: QueryShape, settings: QuerySettings) -> Result<(), ShardError> {
        if shape.raw_data {
            return Err(ShardError::Validation(format!(
                "query settings cannot be set for rawData command {shape}"
            )));
        }
        info!(shape = %shape, reject = settings.reject, "query settings set");
        self.settings.write().insert(shape, settings);
        Ok(())
    }

    pub fn remove(&self, shape: &QueryShape) -> Option<QuerySettings> {
        self.settings.write().remove(shape)
    }

    pub fn get(&self, shape: &QueryShape) -> Option<QuerySettings> {
        self.settings.read().get(shape).cloned()
    }

    pub fn len(&self) -> usize {
        self.settings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.settings.read().is_empty()
    }

    /// Fails a command whose shape is marked `reject`.
    pub fn check(&self, shape: &QueryShape) -> Result<(), ShardError> {
        if shape.raw_data {
            return Ok(());
        }
        match self.settings.read().get(shape) {
            Some(settings) if settings.reject => Err(ShardError::QueryRejectedBySettings {
                shape: shape.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{QueryShape, QuerySettings, QuerySettingsStore};
    use crate::document::to_document;
    use serde_json::json;

    #[test]
    fn shape_ignores_values_and_field_order() {
        let a = to_document(json!({"x": 1, "_id": 2})).expect("doc");
        let b = to_document(json!({"_id": "z", "x": {"$gt": 3}})).expect("doc");
        assert_eq!(
            QueryShape::new("db.c", "update", Some(&a)),
            QueryShape::new("db.c", "update", Some(&b))
        );
        assert_ne!(
            QueryShape::new("db.c", "update", Some(&a)),
            QueryShape::new("db.c", "delete", Some(&a))
        );
    }

    #[test]
    fn rejected_shape_fails_and_raw_data_is_exempt() {
        let store = QuerySettingsStore::new();
        let shape = QueryShape::new("db.c", "find", None);
        store.set(shape.clone(), QuerySettings { reject: true }).expect("set");
        let err = store.check(&shape).expect_err("rejected");
        assert_eq!(err.code_str(), "query_rejected_by_settings");
        assert!(store.check(&shape.clone().raw()).is_ok());
        assert!(store.set(shape.clone().raw(), QuerySettings { reject: true }).is_err());
        store.remove(&shape);
        assert!(store.check(&shape).is_ok());
    }
}
