//! Typed repository of rules, weights, hypotheses, decisions and feedback.
//!
//! Everything above the store layer goes through `PolicyStore`; backends only
//! see JSON documents.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::policy::rule::{Rule, RuleStatus};
use crate::policy::scheduler::LearningCycle;
use crate::policy::types::{Decision, Feedback, Hypothesis, HypothesisStatus, WeightVector};
use crate::store::traits::{DecisionStore, Filter, collections};

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, StoreError> {
    Ok(serde_json::from_value(value)?)
}

fn decode_all<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<T>, StoreError> {
    values.into_iter().map(decode).collect()
}

fn encode<T: Serialize>(record: &T) -> Result<Value, StoreError> {
    Ok(serde_json::to_value(record)?)
}

/// Denormalized cluster key on decision documents.
const CLUSTER_KEY_FIELD: &str = "cluster_key";

/// Weight versions are stored under a zero-padded id so ids sort by version.
fn weight_id(version: u64) -> String {
    format!("v{version:010}")
}

/// Typed access to policy state over any `DecisionStore`.
#[derive(Clone)]
pub struct PolicyStore {
    store: Arc<dyn DecisionStore>,
}

impl PolicyStore {
    pub fn new(store: Arc<dyn DecisionStore>) -> Self {
        Self { store }
    }

    /// The underlying document store.
    pub fn backend(&self) -> &Arc<dyn DecisionStore> {
        &self.store
    }

    // ── Rules ───────────────────────────────────────────────────────

    /// Active rules, highest confidence first, then oldest, then by id.
    pub async fn get_active_rules(&self) -> Result<Vec<Rule>, StoreError> {
        let docs = self
            .store
            .query(
                collections::RULES,
                &[Filter::eq("status", RuleStatus::Active.as_str())],
            )
            .await?;
        let mut rules: Vec<Rule> = decode_all(docs)?;
        rules.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(rules)
    }

    /// Every rule regardless of status.
    pub async fn all_rules(&self) -> Result<Vec<Rule>, StoreError> {
        decode_all(self.store.query(collections::RULES, &[]).await?)
    }

    pub async fn get_rule(&self, id: Uuid) -> Result<Option<Rule>, StoreError> {
        self.store
            .get(collections::RULES, &id.to_string())
            .await?
            .map(decode)
            .transpose()
    }

    /// The active rule with this natural key, if any.
    pub async fn find_active_rule(&self, natural_key: &str) -> Result<Option<Rule>, StoreError> {
        self.store
            .query(
                collections::RULES,
                &[
                    Filter::eq("natural_key", natural_key),
                    Filter::eq("status", RuleStatus::Active.as_str()),
                ],
            )
            .await?
            .into_iter()
            .next()
            .map(decode)
            .transpose()
    }

    /// Insert a rule unless an active rule with the same natural key exists,
    /// in which case that rule is returned and nothing is written.
    pub async fn upsert_rule(&self, rule: &Rule) -> Result<Rule, StoreError> {
        if let Some(current) = self.find_active_rule(&rule.natural_key).await? {
            debug!(rule_id = %current.id, key = %rule.natural_key, "Rule already active");
            return Ok(current);
        }

        self.store
            .upsert(collections::RULES, &rule.id.to_string(), &encode(rule)?)
            .await?;
        Ok(rule.clone())
    }

    /// Deprecate a rule. Returns the stored record after the transition, or
    /// `None` when the rule was already deprecated (nothing is written).
    ///
    /// Only the status fields are written, guarded on the rule still being
    /// active, so counter increments racing with deprecation are kept.
    pub async fn deprecate_rule(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Rule>, StoreError> {
        let key = id.to_string();
        let rule = self.get_rule(id).await?.ok_or_else(|| StoreError::NotFound {
            collection: collections::RULES.to_string(),
            id: key.clone(),
        })?;

        let Some(next) = rule.deprecated(reason, now) else {
            return Ok(None);
        };
        let applied = self
            .store
            .set_fields_if(
                collections::RULES,
                &key,
                &[
                    ("status", encode(&next.status)?),
                    ("deprecated_at", encode(&next.deprecated_at)?),
                    ("deprecation_reason", encode(&next.deprecation_reason)?),
                ],
                &[Filter::eq("status", RuleStatus::Active.as_str())],
            )
            .await?;
        if !applied {
            debug!(rule_id = %id, "Rule deprecated concurrently");
            return Ok(None);
        }
        self.get_rule(id).await
    }

    /// Record hypotheses as evidence for an existing rule so later synthesis
    /// runs treat them as consumed.
    pub async fn extend_provenance(&self, rule: &Rule, ids: &[Uuid]) -> Result<(), StoreError> {
        let mut provenance = rule.provenance.clone();
        provenance.extend(ids.iter().filter(|id| !rule.provenance.contains(id)));
        self.store
            .set_fields_if(
                collections::RULES,
                &rule.id.to_string(),
                &[("provenance", encode(&provenance)?)],
                &[],
            )
            .await?;
        Ok(())
    }

    /// Count one application of a rule, and one success when `correct`.
    pub async fn record_rule_outcome(&self, id: Uuid, correct: bool) -> Result<(), StoreError> {
        let key = id.to_string();
        self.store
            .atomic_increment(collections::RULES, &key, "usage_count", 1)
            .await?;
        if correct {
            self.store
                .atomic_increment(collections::RULES, &key, "correct_count", 1)
                .await?;
        }
        Ok(())
    }

    // ── Weights ─────────────────────────────────────────────────────

    /// Latest weight vector, or the given version. Defaults (version 0) when
    /// nothing has been stored yet.
    pub async fn get_weights(&self, version: Option<u64>) -> Result<WeightVector, StoreError> {
        match version {
            Some(0) => Ok(WeightVector::defaults()),
            Some(v) => self
                .store
                .get(collections::WEIGHTS, &weight_id(v))
                .await?
                .map(decode)
                .transpose()?
                .ok_or_else(|| StoreError::NotFound {
                    collection: collections::WEIGHTS.to_string(),
                    id: weight_id(v),
                }),
            None => {
                let all: Vec<WeightVector> =
                    decode_all(self.store.query(collections::WEIGHTS, &[]).await?)?;
                Ok(all
                    .into_iter()
                    .max_by_key(|w| w.version)
                    .unwrap_or_else(WeightVector::defaults))
            }
        }
    }

    /// Store a new weight version. Weights are normalized first; identical
    /// weights to the latest version (or nothing positive) write nothing.
    pub async fn bump_weights(
        &self,
        weights: BTreeMap<String, f64>,
        accuracy: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Option<WeightVector>, StoreError> {
        let Some(weights) = WeightVector::normalize(weights) else {
            warn!("Refusing to store weight vector with no positive weights");
            return Ok(None);
        };

        let latest = self.get_weights(None).await?;
        if WeightVector::same_weights(&latest.weights, &weights) {
            debug!(version = latest.version, "Weights unchanged, not bumping");
            return Ok(None);
        }

        let next = WeightVector {
            weights,
            version: latest.version + 1,
            accuracy,
            created_at: now,
        };
        self.store
            .upsert(collections::WEIGHTS, &weight_id(next.version), &encode(&next)?)
            .await?;
        info!(version = next.version, "Weight vector bumped");
        Ok(Some(next))
    }

    // ── Hypotheses ──────────────────────────────────────────────────

    /// Insert or overwrite a hypothesis record.
    pub async fn save_hypothesis(&self, hypothesis: &Hypothesis) -> Result<(), StoreError> {
        self.store
            .upsert(
                collections::HYPOTHESES,
                &hypothesis.id.to_string(),
                &encode(hypothesis)?,
            )
            .await
    }

    pub async fn get_hypothesis(&self, id: Uuid) -> Result<Option<Hypothesis>, StoreError> {
        self.store
            .get(collections::HYPOTHESES, &id.to_string())
            .await?
            .map(decode)
            .transpose()
    }

    /// Validated hypotheses resolved strictly before `before`.
    pub async fn validated_hypotheses_before(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        decode_all(
            self.store
                .query(
                    collections::HYPOTHESES,
                    &[
                        Filter::eq("status", HypothesisStatus::Validated.as_str()),
                        Filter::before("resolved_at", before),
                    ],
                )
                .await?,
        )
    }

    /// Hypotheses resolved in `[start, end)`, either outcome.
    pub async fn hypotheses_resolved_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Hypothesis>, StoreError> {
        decode_all(
            self.store
                .query(
                    collections::HYPOTHESES,
                    &[
                        Filter::since("resolved_at", start),
                        Filter::before("resolved_at", end),
                    ],
                )
                .await?,
        )
    }

    // ── Decisions ───────────────────────────────────────────────────

    /// Store a decision. The document also carries its cluster key so the
    /// exploration controller can count per cluster without reading contexts.
    pub async fn insert_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let mut doc = encode(decision)?;
        if let Value::Object(map) = &mut doc {
            map.insert(CLUSTER_KEY_FIELD.to_string(), Value::from(decision.context.cluster_key()));
        }
        self.store
            .upsert(collections::DECISIONS, &decision.id.to_string(), &doc)
            .await
    }

    pub async fn get_decision(&self, id: Uuid) -> Result<Option<Decision>, StoreError> {
        self.store
            .get(collections::DECISIONS, &id.to_string())
            .await?
            .map(decode)
            .transpose()
    }

    /// Decisions created in `[start, end)`.
    pub async fn decisions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Decision>, StoreError> {
        decode_all(
            self.store
                .query(
                    collections::DECISIONS,
                    &[
                        Filter::since("created_at", start),
                        Filter::before("created_at", end),
                    ],
                )
                .await?,
        )
    }

    /// How many decisions have been recorded for a cluster key.
    pub async fn count_decisions_for_cluster(&self, cluster_key: &str) -> Result<usize, StoreError> {
        self.store
            .count(
                collections::DECISIONS,
                &[Filter::eq(CLUSTER_KEY_FIELD, cluster_key)],
            )
            .await
    }

    // ── Feedback ────────────────────────────────────────────────────

    pub async fn insert_feedback(&self, feedback: &Feedback) -> Result<(), StoreError> {
        self.store
            .upsert(
                collections::FEEDBACK,
                &feedback.id.to_string(),
                &encode(feedback)?,
            )
            .await
    }

    /// Feedback created in `[start, end)`, oldest first.
    pub async fn feedback_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Feedback>, StoreError> {
        let mut feedback: Vec<Feedback> = decode_all(
            self.store
                .query(
                    collections::FEEDBACK,
                    &[
                        Filter::since("created_at", start),
                        Filter::before("created_at", end),
                    ],
                )
                .await?,
        )?;
        feedback.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(feedback)
    }

    /// The most recent `limit` feedback records paired with their decisions,
    /// newest first. Feedback whose decision is missing is skipped.
    pub async fn recent_labeled_decisions(
        &self,
        limit: usize,
    ) -> Result<Vec<(Decision, Feedback)>, StoreError> {
        let mut feedback: Vec<Feedback> =
            decode_all(self.store.query(collections::FEEDBACK, &[]).await?)?;
        feedback.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));

        let mut out = Vec::with_capacity(limit.min(feedback.len()));
        for fb in feedback {
            if out.len() >= limit {
                break;
            }
            match self.get_decision(fb.decision_id).await? {
                Some(decision) => out.push((decision, fb)),
                None => debug!(decision_id = %fb.decision_id, "Feedback without decision skipped"),
            }
        }
        Ok(out)
    }

    // ── Learning cycles ─────────────────────────────────────────────

    pub async fn insert_cycle(&self, cycle: &LearningCycle) -> Result<(), StoreError> {
        self.store
            .upsert(
                collections::LEARNING_CYCLES,
                &cycle.id.to_string(),
                &encode(cycle)?,
            )
            .await
    }

    /// All recorded learning cycles, oldest first.
    pub async fn cycles(&self) -> Result<Vec<LearningCycle>, StoreError> {
        let mut cycles: Vec<LearningCycle> =
            decode_all(self.store.query(collections::LEARNING_CYCLES, &[]).await?)?;
        cycles.sort_by_key(|c| c.iteration);
        Ok(cycles)
    }
}
