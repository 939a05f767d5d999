//! In-process `DecisionStore` used by tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::traits::{DecisionStore, Filter};

/// Collections of JSON documents behind one async lock.
///
/// Every operation takes the lock once, so `atomic_increment` and
/// `set_fields_if` are atomic with respect to concurrent readers and writers.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    pub async fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .await
            .get(collection)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl DecisionStore for InMemoryStore {
    async fn upsert(&self, collection: &str, id: &str, record: &Value) -> Result<(), StoreError> {
        let mut guard = self.collections.write().await;
        guard
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), record.clone());
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard.get(collection).and_then(|c| c.get(id)).cloned())
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        let guard = self.collections.read().await;
        let Some(records) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(records
            .values()
            .filter(|doc| filters.iter().all(|f| f.matches(doc)))
            .cloned()
            .collect())
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        let mut guard = self.collections.write().await;
        let record = guard
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        let pointer = format!("/{}", field.replace('.', "/"));
        let current = match record.pointer(&pointer) {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                StoreError::Query(format!("{collection}/{id}: field '{field}' is not an integer"))
            })?,
        };
        let next = current + delta;
        set_path(record, field, Value::from(next))
            .map_err(|e| StoreError::Query(format!("{collection}/{id}: {e}")))?;
        Ok(next)
    }

    async fn set_fields_if(
        &self,
        collection: &str,
        id: &str,
        fields: &[(&str, Value)],
        guard: &[Filter],
    ) -> Result<bool, StoreError> {
        let mut guard_lock = self.collections.write().await;
        let record = guard_lock
            .get_mut(collection)
            .and_then(|c| c.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;

        if !guard.iter().all(|f| f.matches(record)) {
            return Ok(false);
        }
        for (field, value) in fields {
            set_path(record, field, value.clone())
                .map_err(|e| StoreError::Query(format!("{collection}/{id}: {e}")))?;
        }
        Ok(true)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<usize, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard.get(collection).map_or(0, |records| {
            records
                .values()
                .filter(|doc| filters.iter().all(|f| f.matches(doc)))
                .count()
        }))
    }
}

/// Write `value` at a dotted path whose parent object already exists.
fn set_path(record: &mut Value, field: &str, value: Value) -> Result<(), String> {
    let (parent_path, leaf) = match field.rsplit_once('.') {
        Some((parent, leaf)) => (format!("/{}", parent.replace('.', "/")), leaf),
        None => (String::new(), field),
    };
    let parent = record
        .pointer_mut(&parent_path)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| format!("no object at '{field}'"))?;
    parent.insert(leaf.to_string(), value);
    Ok(())
}
