//! libSQL backend: async `DecisionStore` over a single JSON document table.
//!
//! Supports local file and in-memory databases. Filters are translated to
//! `json_extract` comparisons; RFC 3339 values compare through `julianday()`
//! so offsets and fractional seconds order correctly.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{DecisionStore, Filter, is_valid_path, parse_timestamp};

/// libSQL document store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Policy store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Pool(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Filter translation ──────────────────────────────────────────────

/// Append one filter's SQL condition and its bound values.
fn push_condition(
    filter: &Filter,
    conditions: &mut Vec<String>,
    binds: &mut Vec<libsql::Value>,
) -> Result<(), StoreError> {
    if !filter.has_valid_path() {
        return Err(StoreError::Query(format!(
            "invalid filter field '{}'",
            filter.field
        )));
    }

    binds.push(libsql::Value::Text(format!("$.{}", filter.field)));
    let p = binds.len();
    let op = filter.op.sql();

    let condition = match &filter.value {
        Value::Number(n) => {
            binds.push(libsql::Value::Real(n.as_f64().unwrap_or(0.0)));
            format!(
                "json_type(body, ?{p}) IN ('integer', 'real') AND json_extract(body, ?{p}) {op} ?{}",
                binds.len()
            )
        }
        Value::String(s) if parse_timestamp(s).is_some() => {
            binds.push(libsql::Value::Text(s.clone()));
            format!(
                "julianday(json_extract(body, ?{p})) {op} julianday(?{})",
                binds.len()
            )
        }
        Value::String(s) => {
            binds.push(libsql::Value::Text(s.clone()));
            format!(
                "json_type(body, ?{p}) = 'text' AND json_extract(body, ?{p}) {op} ?{}",
                binds.len()
            )
        }
        Value::Bool(b) => {
            binds.push(libsql::Value::Integer(i64::from(*b)));
            format!(
                "json_type(body, ?{p}) IN ('true', 'false') AND json_extract(body, ?{p}) {op} ?{}",
                binds.len()
            )
        }
        other => {
            return Err(StoreError::Query(format!(
                "unsupported filter value for '{}': {other}",
                filter.field
            )));
        }
    };
    conditions.push(condition);
    Ok(())
}

/// `collection = ?1` plus every filter condition, with their bound values.
fn where_clause(
    collection: &str,
    filters: &[Filter],
) -> Result<(String, Vec<libsql::Value>), StoreError> {
    let mut conditions = vec!["collection = ?1".to_string()];
    let mut binds = vec![libsql::Value::Text(collection.to_string())];
    for filter in filters {
        push_condition(filter, &mut conditions, &mut binds)?;
    }
    Ok((conditions.join(" AND "), binds))
}

fn parse_body(body: &str) -> Result<Value, StoreError> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl DecisionStore for LibSqlStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn upsert(&self, collection: &str, id: &str, record: &Value) -> Result<(), StoreError> {
        let body = serde_json::to_string(record)?;
        self.conn()
            .execute(
                "INSERT INTO documents (collection, id, body, updated_at)
                 VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(collection, id) DO UPDATE SET
                    body = excluded.body,
                    updated_at = excluded.updated_at",
                params![collection, id, body],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert {collection}/{id}: {e}")))?;
        debug!(collection, id, "Upserted record");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get {collection}/{id}: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("get {collection}/{id}: {e}")))?
        {
            Some(row) => {
                let body: String = row
                    .get(0)
                    .map_err(|e| StoreError::Query(format!("get {collection}/{id}: {e}")))?;
                parse_body(&body).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError> {
        let (condition, binds) = where_clause(collection, filters)?;
        let sql = format!("SELECT body FROM documents WHERE {condition}");
        let mut rows = self
            .conn()
            .query(&sql, libsql::params::Params::Positional(binds))
            .await
            .map_err(|e| StoreError::Query(format!("query {collection}: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("query {collection}: {e}")))?
        {
            let body: String = row
                .get(0)
                .map_err(|e| StoreError::Query(format!("query {collection}: {e}")))?;
            out.push(parse_body(&body)?);
        }
        Ok(out)
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<usize, StoreError> {
        let (condition, binds) = where_clause(collection, filters)?;
        let sql = format!("SELECT COUNT(*) FROM documents WHERE {condition}");
        let mut rows = self
            .conn()
            .query(&sql, libsql::params::Params::Positional(binds))
            .await
            .map_err(|e| StoreError::Query(format!("count {collection}: {e}")))?;

        let count = match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("count {collection}: {e}")))?
        {
            Some(row) => row
                .get::<i64>(0)
                .map_err(|e| StoreError::Query(format!("count {collection}: {e}")))?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError> {
        if !is_valid_path(field) {
            return Err(StoreError::Query(format!("invalid counter field '{field}'")));
        }
        let path = format!("$.{field}");

        // Single statement, so the read-modify-write cannot interleave.
        let mut rows = self
            .conn()
            .query(
                "UPDATE documents
                 SET body = json_set(body, ?3, CAST(COALESCE(json_extract(body, ?3), 0) AS INTEGER) + ?4),
                     updated_at = datetime('now')
                 WHERE collection = ?1 AND id = ?2
                 RETURNING json_extract(body, ?3)",
                params![collection, id, path, delta],
            )
            .await
            .map_err(|e| StoreError::Query(format!("increment {collection}/{id}.{field}: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| StoreError::Query(format!("increment {collection}/{id}.{field}: {e}")))?
        {
            Some(row) => row
                .get::<i64>(0)
                .map_err(|e| StoreError::Query(format!("increment {collection}/{id}.{field}: {e}"))),
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    async fn set_fields_if(
        &self,
        collection: &str,
        id: &str,
        fields: &[(&str, Value)],
        guard: &[Filter],
    ) -> Result<bool, StoreError> {
        let mut conditions = vec!["collection = ?1".to_string(), "id = ?2".to_string()];
        let mut binds = vec![
            libsql::Value::Text(collection.to_string()),
            libsql::Value::Text(id.to_string()),
        ];

        // json_set on the named paths only, so concurrent counter increments
        // on the same document survive.
        let mut assignments = Vec::with_capacity(fields.len());
        for (field, value) in fields {
            if !is_valid_path(field) {
                return Err(StoreError::Query(format!("invalid field '{field}'")));
            }
            binds.push(libsql::Value::Text(format!("$.{field}")));
            binds.push(libsql::Value::Text(serde_json::to_string(value)?));
            assignments.push(format!("?{}, json(?{})", binds.len() - 1, binds.len()));
        }
        for filter in guard {
            push_condition(filter, &mut conditions, &mut binds)?;
        }

        let body = if assignments.is_empty() {
            "body".to_string()
        } else {
            format!("json_set(body, {})", assignments.join(", "))
        };
        let sql = format!(
            "UPDATE documents SET body = {body}, updated_at = datetime('now') WHERE {}",
            conditions.join(" AND ")
        );
        let changed = self
            .conn()
            .execute(&sql, libsql::params::Params::Positional(binds))
            .await
            .map_err(|e| StoreError::Query(format!("set {collection}/{id}: {e}")))?;

        if changed > 0 {
            debug!(collection, id, "Guarded update applied");
            return Ok(true);
        }
        match self.get(collection, id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }
}
