//! `DecisionStore` trait: the document-store contract the policy core
//! depends on.
//!
//! Records are JSON documents grouped by collection and addressed by id.
//! Backends provide upsert, point lookup, filtered query and count, plus two
//! atomic field-level writes (counter increment and guarded set). Everything
//! typed lives in `PolicyStore`.

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::StoreError;

/// Collection names used by the policy store.
pub mod collections {
    pub const RULES: &str = "rules";
    pub const WEIGHTS: &str = "weights";
    pub const HYPOTHESES: &str = "hypotheses";
    pub const DECISIONS: &str = "decisions";
    pub const FEEDBACK: &str = "feedback";
    pub const LEARNING_CYCLES: &str = "learning_cycles";
}

/// Comparison operator for a query filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    fn accepts(&self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Lte => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Gte => ord != Ordering::Less,
        }
    }
}

/// A single `field op value` condition. `field` is a dotted path into the
/// document (`context.relationship_type`).
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Lt, value)
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Gte, value)
    }

    /// Time filters take `DateTime`s so every caller serializes them the same way.
    pub fn since(field: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::gte(field, at.to_rfc3339())
    }

    pub fn before(field: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::lt(field, at.to_rfc3339())
    }

    /// Evaluate against a document. A missing field never matches.
    pub fn matches(&self, doc: &Value) -> bool {
        match lookup(doc, &self.field) {
            Some(actual) if !actual.is_null() => {
                compare_values(actual, &self.value).is_some_and(|ord| self.op.accepts(ord))
            }
            _ => false,
        }
    }

    /// Whether the field path is safe to splice into a JSON path expression.
    pub fn has_valid_path(&self) -> bool {
        is_valid_path(&self.field)
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |cur, seg| cur.get(seg))
}

/// Order two JSON scalars: numbers numerically, RFC 3339 strings
/// chronologically, other strings lexically, booleans by equality only.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(if x == y {
            Ordering::Equal
        } else {
            x.cmp(y)
        }),
        _ => None,
    }
}

pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Backend-agnostic persistence contract for the policy engine.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    /// Prepare backing storage. Backends without schema can keep the default.
    async fn init_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Insert or replace a record.
    async fn upsert(&self, collection: &str, id: &str, record: &Value) -> Result<(), StoreError>;

    /// Fetch a record by id.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// All records matching every filter. Order is unspecified.
    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<Value>, StoreError>;

    /// Number of records matching every filter.
    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<usize, StoreError> {
        Ok(self.query(collection, filters).await?.len())
    }

    /// Atomically add `delta` to an integer field (missing counts as 0) and
    /// return the new value. Fails with `NotFound` if the record is absent.
    async fn atomic_increment(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        delta: i64,
    ) -> Result<i64, StoreError>;

    /// Set the given fields in one atomic step, only if the record currently
    /// matches every `guard` filter. Other fields are left untouched.
    ///
    /// Returns whether the record was updated. Fails with `NotFound` if the
    /// record is absent.
    async fn set_fields_if(
        &self,
        collection: &str,
        id: &str,
        fields: &[(&str, Value)],
        guard: &[Filter],
    ) -> Result<bool, StoreError>;
}

/// Whether a dotted field path is safe to splice into a JSON path expression.
pub fn is_valid_path(field: &str) -> bool {
    !field.is_empty()
        && field
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}
