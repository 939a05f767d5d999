//! Shared records for the decision policy: actions, contexts, decisions,
//! feedback, hypotheses and weight vectors.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Context field holding the cluster key.
pub const RELATIONSHIP_FIELD: &str = "relationship_type";

/// Cluster key used when a context carries no relationship type.
pub const UNKNOWN_RELATIONSHIP: &str = "unknown";

// ── Action ──────────────────────────────────────────────────────────

/// Triage action the policy can choose for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Reply,
    Star,
    Archive,
    Delete,
    /// Defer to the user.
    Ask,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Reply,
        Action::Star,
        Action::Archive,
        Action::Delete,
        Action::Ask,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Star => "star",
            Self::Archive => "archive",
            Self::Delete => "delete",
            Self::Ask => "ask",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == normalized)
            .ok_or_else(|| format!("unknown action '{s}'"))
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// Per-message feature bundle supplied by the context provider.
///
/// Treated as an opaque key → value mapping; only the cluster key and the
/// fields named by rule clauses are ever interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionContext(BTreeMap<String, Value>);

impl DecisionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The relationship type this context clusters under.
    pub fn cluster_key(&self) -> &str {
        self.get_str(RELATIONSHIP_FIELD)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN_RELATIONSHIP)
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for DecisionContext {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ── Predictions and decisions ───────────────────────────────────────

/// What the base model would do before rules or exploration are applied.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub action: Action,
    pub confidence: f64,
}

impl Prediction {
    pub fn new(action: Action, confidence: f64) -> Self {
        Self {
            action,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Output of the decision evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub action: Action,
    pub confidence: f64,
    /// Rule that produced this action, if any. Never more than one.
    pub applied_rule_id: Option<Uuid>,
    /// The base prediction's action, kept for comparison.
    pub base_action: Action,
}

/// Why the exploration controller picked its explore probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExploreTrigger {
    LowConfidence,
    LimitedData,
    PerformancePlateau,
    NovelContext,
    Baseline,
}

impl ExploreTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LowConfidence => "low_confidence",
            Self::LimitedData => "limited_data",
            Self::PerformancePlateau => "performance_plateau",
            Self::NovelContext => "novel_context",
            Self::Baseline => "baseline",
        }
    }
}

/// Append-only record of one triage decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub context: DecisionContext,
    pub action: Action,
    pub confidence: f64,
    pub is_exploration: bool,
    #[serde(default)]
    pub applied_rule_id: Option<Uuid>,
    /// Action before any exploration override.
    pub base_action: Action,
    /// Hypothesis created when this decision explored.
    #[serde(default)]
    pub hypothesis_id: Option<Uuid>,
    #[serde(default)]
    pub explore_trigger: Option<ExploreTrigger>,
    #[serde(default)]
    pub explore_probability: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl Decision {
    /// Build an exploit decision from an evaluator result.
    pub fn from_evaluation(context: DecisionContext, eval: Evaluation, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            context,
            action: eval.action,
            confidence: eval.confidence,
            is_exploration: false,
            applied_rule_id: eval.applied_rule_id,
            base_action: eval.base_action,
            hypothesis_id: None,
            explore_trigger: None,
            explore_probability: None,
            created_at: now,
        }
    }
}

// ── Feedback ────────────────────────────────────────────────────────

/// User verdict on an earlier decision. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub correct: bool,
    #[serde(default)]
    pub corrected_action: Option<Action>,
    pub created_at: DateTime<Utc>,
}

impl Feedback {
    /// The user agreed with the decision.
    pub fn correct(decision_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision_id,
            correct: true,
            corrected_action: None,
            created_at: Utc::now(),
        }
    }

    /// The user disagreed and said what should have happened.
    pub fn corrected(decision_id: Uuid, action: Action) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision_id,
            correct: false,
            corrected_action: Some(action),
            created_at: Utc::now(),
        }
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

// ── Hypotheses ──────────────────────────────────────────────────────

/// Lifecycle of an exploration hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Pending,
    Validated,
    Rejected,
}

impl HypothesisStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Feedback evidence stored when a hypothesis resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub feedback_id: Uuid,
    pub correct: bool,
    #[serde(default)]
    pub corrected_action: Option<Action>,
}

/// A provisional claim that an alternative action beats the default for a
/// class of contexts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: Uuid,
    pub decision_id: Uuid,
    pub context: DecisionContext,
    pub alternative_action: Action,
    pub base_action: Action,
    pub statement: String,
    pub expected_outcome: String,
    #[serde(default)]
    pub success_criteria: Option<String>,
    /// Proposer's confidence in the alternative.
    pub confidence: f64,
    pub status: HypothesisStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl Hypothesis {
    /// Transition out of `Pending`. Returns `None` when already resolved.
    pub fn resolved(
        &self,
        validated: bool,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Option<Hypothesis> {
        if self.status.is_terminal() {
            return None;
        }
        let mut next = self.clone();
        next.status = if validated {
            HypothesisStatus::Validated
        } else {
            HypothesisStatus::Rejected
        };
        next.resolved_at = Some(now);
        next.resolution = Some(resolution);
        Some(next)
    }

    pub fn cluster_key(&self) -> &str {
        self.context.cluster_key()
    }
}

// ── Weights ─────────────────────────────────────────────────────────

/// Versioned signal weights used by the base importance model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightVector {
    pub weights: BTreeMap<String, f64>,
    pub version: u64,
    #[serde(default)]
    pub accuracy: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl WeightVector {
    /// Weights in effect before any optimization has run.
    pub fn defaults() -> Self {
        let weights = [
            ("person_importance", 0.30),
            ("cluster_pattern", 0.20),
            ("content_urgency", 0.25),
            ("learned_patterns", 0.15),
            ("domain_signal", 0.10),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            weights,
            version: 0,
            accuracy: None,
            created_at: DateTime::<Utc>::default(),
        }
    }

    /// Drop negatives and rescale so the weights sum to 1.
    /// Returns `None` when nothing positive remains.
    pub fn normalize(weights: BTreeMap<String, f64>) -> Option<BTreeMap<String, f64>> {
        let cleaned: BTreeMap<String, f64> = weights
            .into_iter()
            .map(|(k, v)| (k, if v.is_finite() { v.max(0.0) } else { 0.0 }))
            .collect();
        let total: f64 = cleaned.values().sum();
        if total <= 0.0 {
            return None;
        }
        Some(cleaned.into_iter().map(|(k, v)| (k, v / total)).collect())
    }

    /// Whether two weight maps are the same up to float noise.
    pub fn same_weights(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> bool {
        a.len() == b.len()
            && a.iter()
                .zip(b.iter())
                .all(|((ka, va), (kb, vb))| ka == kb && (va - vb).abs() < 1e-9)
    }

    pub fn get(&self, name: &str) -> f64 {
        self.weights.get(name).copied().unwrap_or(0.0)
    }
}
