//! Learned rules: a predicate over context fields mapped to an action.
//!
//! Predicates are a closed set of clause kinds evaluated by a single
//! interpreter (`Clause::matches`). Rules are values; the only mutations are
//! explicit transitions (`Rule::deprecated`) and counter increments done
//! atomically by the store.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::policy::types::{Action, DecisionContext};

/// One condition over a named context field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Clause {
    /// Field equals a value. Numbers compare numerically.
    Equals { field: String, value: Value },
    /// Numeric field within inclusive bounds.
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// String field contains `needle`, case-insensitive.
    Contains { field: String, needle: String },
    /// RFC 3339 timestamp field whose UTC hour is in `[start_hour, end_hour)`.
    /// Wraps past midnight when `start_hour > end_hour`.
    TimeWindow {
        field: String,
        start_hour: u32,
        end_hour: u32,
    },
}

impl Clause {
    pub fn equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn range(field: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self::Range {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    pub fn time_window(field: impl Into<String>, start_hour: u32, end_hour: u32) -> Self {
        Self::TimeWindow {
            field: field.into(),
            start_hour,
            end_hour,
        }
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Equals { field, .. }
            | Self::Range { field, .. }
            | Self::Contains { field, .. }
            | Self::TimeWindow { field, .. } => field,
        }
    }

    /// Evaluate this clause against a context. A missing field never matches.
    pub fn matches(&self, ctx: &DecisionContext) -> bool {
        let Some(actual) = ctx.get(self.field()) else {
            return false;
        };

        match self {
            Self::Equals { value, .. } => values_equal(actual, value),
            Self::Range { min, max, .. } => match actual.as_f64() {
                Some(x) => min.is_none_or(|lo| x >= lo) && max.is_none_or(|hi| x <= hi),
                None => false,
            },
            Self::Contains { needle, .. } => actual
                .as_str()
                .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase())),
            Self::TimeWindow {
                start_hour,
                end_hour,
                ..
            } => match actual.as_str().and_then(parse_hour) {
                Some(hour) => hour_in_window(hour, *start_hour, *end_hour),
                None => false,
            },
        }
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals { field, value } => write!(f, "{field} == {value}"),
            Self::Range { field, min, max } => match (min, max) {
                (Some(lo), Some(hi)) => write!(f, "{lo} <= {field} <= {hi}"),
                (Some(lo), None) => write!(f, "{field} >= {lo}"),
                (None, Some(hi)) => write!(f, "{field} <= {hi}"),
                (None, None) => write!(f, "{field} is numeric"),
            },
            Self::Contains { field, needle } => {
                write!(f, "{field} contains {:?}", needle.to_lowercase())
            }
            Self::TimeWindow {
                field,
                start_hour,
                end_hour,
            } => write!(f, "hour({field}) in [{start_hour:02}, {end_hour:02})"),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn parse_hour(s: &str) -> Option<u32> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).hour())
}

fn hour_in_window(hour: u32, start: u32, end: u32) -> bool {
    match start.cmp(&end) {
        Ordering::Less => hour >= start && hour < end,
        Ordering::Greater => hour >= start || hour < end,
        Ordering::Equal => true,
    }
}

/// Ordered, deduplicated conjunction of clauses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Predicate(Vec<Clause>);

impl Predicate {
    /// Canonicalize: clauses sorted by their rendered form, duplicates removed.
    pub fn new(clauses: impl IntoIterator<Item = Clause>) -> Self {
        let mut keyed: Vec<(String, Clause)> =
            clauses.into_iter().map(|c| (c.to_string(), c)).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);
        Self(keyed.into_iter().map(|(_, c)| c).collect())
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every clause matches.
    pub fn matches(&self, ctx: &DecisionContext) -> bool {
        self.0.iter().all(|c| c.matches(ctx))
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("always");
        }
        let rendered: Vec<String> = self.0.iter().map(Clause::to_string).collect();
        f.write_str(&rendered.join(" AND "))
    }
}

/// Lifecycle of a learned rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleStatus {
    Active,
    Deprecated,
}

impl RuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Deprecated => "deprecated",
        }
    }
}

/// A persisted, generalized predicate → action mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: Uuid,
    pub predicate: Predicate,
    pub action: Action,
    pub confidence: f64,
    pub status: RuleStatus,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub correct_count: u64,
    /// Hypotheses this rule was synthesized from.
    #[serde(default)]
    pub provenance: Vec<Uuid>,
    pub description: String,
    /// Natural key, stored so the store can filter on it.
    pub natural_key: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deprecated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deprecation_reason: Option<String>,
}

impl Rule {
    /// Create a new active rule. Confidence is clamped into `[0, 1]`.
    pub fn new(
        predicate: Predicate,
        action: Action,
        confidence: f64,
        provenance: Vec<Uuid>,
        description: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let natural_key = natural_key(&predicate, action);
        Self {
            id: Uuid::new_v4(),
            predicate,
            action,
            confidence,
            status: RuleStatus::Active,
            usage_count: 0,
            correct_count: 0,
            provenance,
            description: description.into(),
            natural_key,
            created_at: now,
            deprecated_at: None,
            deprecation_reason: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == RuleStatus::Active
    }

    pub fn matches(&self, ctx: &DecisionContext) -> bool {
        self.predicate.matches(ctx)
    }

    /// `correct_count / usage_count`, or `None` before first use.
    pub fn accuracy(&self) -> Option<f64> {
        (self.usage_count > 0).then(|| self.correct_count as f64 / self.usage_count as f64)
    }

    /// Transition active → deprecated. Returns `None` if already deprecated.
    pub fn deprecated(&self, reason: impl Into<String>, now: DateTime<Utc>) -> Option<Rule> {
        if !self.is_active() {
            return None;
        }
        let mut next = self.clone();
        next.status = RuleStatus::Deprecated;
        next.deprecated_at = Some(now);
        next.deprecation_reason = Some(reason.into());
        Some(next)
    }
}

/// Identity used to keep synthesis idempotent: same predicate, same action.
pub fn natural_key(predicate: &Predicate, action: Action) -> String {
    format!("{predicate} => {action}")
}
