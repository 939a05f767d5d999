//! Strategy synthesizer: clusters validated hypotheses into rules.
//!
//! A cluster is every unconsumed validated hypothesis sharing a relationship
//! type and alternative action. Clusters large enough become a rule whose
//! predicate covers what all members have in common.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SynthesisConfig;
use crate::error::StoreError;
use crate::policy::rule::{Clause, Predicate, Rule, natural_key};
use crate::policy::types::{Action, Hypothesis};
use crate::proposer::{PatternExample, PatternRequest, StrategyProposer};
use crate::store::PolicyStore;

/// Summary of one synthesizer run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SynthesisReport {
    /// Fresh validated hypotheses considered.
    pub considered: usize,
    /// Clusters at or above the minimum size.
    pub candidates: usize,
    pub created: Vec<Rule>,
    /// Candidates whose rule already exists and is active.
    pub already_active: usize,
    /// Candidates with nothing in common to build a predicate from.
    pub no_predicate: usize,
}

/// Predicate over what every member's context shares.
pub fn derive_predicate(members: &[Hypothesis], config: &SynthesisConfig) -> Predicate {
    let mut clauses = Vec::new();

    for field in &config.categorical_fields {
        let mut values = members.iter().map(|h| h.context.get(field));
        if let Some(Some(first)) = values.next() {
            if values.all(|v| v == Some(first)) {
                clauses.push(Clause::equals(field.clone(), first.clone()));
            }
        }
    }

    for field in &config.numeric_fields {
        let numbers: Option<Vec<f64>> = members.iter().map(|h| h.context.get_f64(field)).collect();
        if let Some(numbers) = numbers.filter(|n| !n.is_empty()) {
            let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            clauses.push(Clause::range(field.clone(), Some(min), Some(max)));
        }
    }

    let hours: Option<BTreeSet<u32>> = members
        .iter()
        .map(|h| {
            h.context
                .get_str(&config.timestamp_field)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc).hour())
        })
        .collect();
    if let Some((start, end, span)) = hours.and_then(|h| covering_window(&h)) {
        if span <= config.max_time_window_hours {
            clauses.push(Clause::time_window(config.timestamp_field.clone(), start, end));
        }
    }

    Predicate::new(clauses)
}

/// Smallest circular `[start, end)` hour window containing every hour, and its
/// width in hours.
fn covering_window(hours: &BTreeSet<u32>) -> Option<(u32, u32, u32)> {
    let sorted: Vec<u32> = hours.iter().copied().filter(|h| *h < 24).collect();
    if sorted.is_empty() {
        return None;
    }
    // The window is the complement of the largest gap between consecutive hours.
    let (gap_at, gap) = sorted
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let next = sorted.get(i + 1).copied().unwrap_or(sorted[0] + 24);
            (i, next - h)
        })
        .max_by_key(|(i, gap)| (*gap, std::cmp::Reverse(*i)))?;

    let start = sorted[(gap_at + 1) % sorted.len()];
    let end = (sorted[gap_at] + 1) % 24;
    Some((start, end, 24 - gap + 1))
}

/// Fraction of members whose confidence exceeds `floor`.
pub fn cluster_confidence(members: &[Hypothesis], floor: f64) -> f64 {
    if members.is_empty() {
        return 0.0;
    }
    members.iter().filter(|h| h.confidence > floor).count() as f64 / members.len() as f64
}

fn fallback_description(action: Action, predicate: &Predicate, members: usize) -> String {
    format!("{action} when {predicate} (learned from {members} validated explorations)")
}

pub struct StrategySynthesizer {
    store: PolicyStore,
    proposer: Arc<dyn StrategyProposer>,
    config: SynthesisConfig,
}

impl StrategySynthesizer {
    pub fn new(
        store: PolicyStore,
        proposer: Arc<dyn StrategyProposer>,
        config: SynthesisConfig,
    ) -> Self {
        Self {
            store,
            proposer,
            config,
        }
    }

    /// Synthesize rules from hypotheses validated strictly before
    /// `cycle_start` that no rule has consumed yet.
    pub async fn run(&self, cycle_start: DateTime<Utc>) -> Result<SynthesisReport, StoreError> {
        let consumed: HashSet<_> = self
            .store
            .all_rules()
            .await?
            .into_iter()
            .flat_map(|r| r.provenance)
            .collect();

        let fresh: Vec<Hypothesis> = self
            .store
            .validated_hypotheses_before(cycle_start)
            .await?
            .into_iter()
            .filter(|h| !consumed.contains(&h.id))
            .collect();

        let mut clusters: BTreeMap<(String, Action), Vec<Hypothesis>> = BTreeMap::new();
        for hypothesis in &fresh {
            clusters
                .entry((hypothesis.cluster_key().to_string(), hypothesis.alternative_action))
                .or_default()
                .push(hypothesis.clone());
        }

        let mut report = SynthesisReport {
            considered: fresh.len(),
            ..Default::default()
        };

        for ((cluster, action), mut members) in clusters {
            if members.len() < self.config.min_cluster_size {
                debug!(cluster = %cluster, action = %action, size = members.len(), "Cluster too small");
                continue;
            }
            report.candidates += 1;
            members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

            let predicate = derive_predicate(&members, &self.config);
            if predicate.is_empty() {
                warn!(cluster = %cluster, action = %action, "No shared attributes, skipping cluster");
                report.no_predicate += 1;
                continue;
            }

            let provenance: Vec<Uuid> = members.iter().map(|h| h.id).collect();
            if let Some(existing) = self
                .store
                .find_active_rule(&natural_key(&predicate, action))
                .await?
            {
                // Fold the members into the existing rule so they are not
                // clustered (or described) again.
                self.store.extend_provenance(&existing, &provenance).await?;
                debug!(rule_id = %existing.id, members = members.len(), "Cluster matches active rule");
                report.already_active += 1;
                continue;
            }

            let confidence = cluster_confidence(&members, self.config.confidence_floor);
            let description = self.describe(action, &predicate, &members).await;
            let rule = Rule::new(predicate, action, confidence, provenance, description, cycle_start);

            let stored = self.store.upsert_rule(&rule).await?;
            if stored.id != rule.id {
                report.already_active += 1;
                continue;
            }
            info!(
                rule_id = %rule.id,
                predicate = %rule.predicate,
                action = %rule.action,
                confidence = rule.confidence,
                members = members.len(),
                "Synthesized rule"
            );
            report.created.push(rule);
        }

        Ok(report)
    }

    async fn describe(&self, action: Action, predicate: &Predicate, members: &[Hypothesis]) -> String {
        let mut ranked: Vec<&Hypothesis> = members.iter().collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let request = PatternRequest {
            examples: ranked
                .into_iter()
                .take(self.config.max_examples)
                .map(|h| PatternExample {
                    context: h.context.clone(),
                    action: h.alternative_action,
                    hypothesis: h.statement.clone(),
                })
                .collect(),
        };

        match self.proposer.synthesize_pattern(&request).await {
            Ok(pattern) => pattern.description,
            Err(e) => {
                warn!(error = %e, action = %action, "Pattern description failed, using generated one");
                fallback_description(action, predicate, members.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::error::ProposerError;
    use crate::policy::types::{DecisionContext, HypothesisStatus, Resolution};
    use crate::proposer::{Alternative, AlternativeRequest, Pattern};
    use crate::store::InMemoryStore;

    struct StubProposer {
        describe: bool,
        examples_seen: Mutex<Vec<usize>>,
    }

    impl StubProposer {
        fn new(describe: bool) -> Arc<Self> {
            Arc::new(Self {
                describe,
                examples_seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StrategyProposer for StubProposer {
        async fn propose_alternative(
            &self,
            _request: &AlternativeRequest,
        ) -> Result<Alternative, ProposerError> {
            Err(ProposerError::InvalidResponse {
                provider: "stub".into(),
                reason: "unused".into(),
            })
        }

        async fn synthesize_pattern(
            &self,
            request: &PatternRequest,
        ) -> Result<Pattern, ProposerError> {
            self.examples_seen.lock().unwrap().push(request.examples.len());
            if !self.describe {
                return Err(ProposerError::Timeout {
                    timeout: std::time::Duration::from_secs(10),
                });
            }
            Ok(Pattern {
                condition: "relationship_type == friend".into(),
                action: Action::Reply,
                confidence: 0.9,
                description: "Reply to friends".into(),
            })
        }
    }

    fn validated(ctx: DecisionContext, action: Action, confidence: f64, resolved_at: DateTime<Utc>) -> Hypothesis {
        Hypothesis {
            id: Uuid::new_v4(),
            decision_id: Uuid::new_v4(),
            context: ctx,
            alternative_action: action,
            base_action: Action::Archive,
            statement: "friends want replies".into(),
            expected_outcome: "marked correct".into(),
            success_criteria: None,
            confidence,
            status: HypothesisStatus::Validated,
            created_at: resolved_at - Duration::hours(1),
            resolved_at: Some(resolved_at),
            resolution: Some(Resolution {
                feedback_id: Uuid::new_v4(),
                correct: true,
                corrected_action: None,
            }),
        }
    }

    fn friend(hour: u32, score: f64) -> DecisionContext {
        DecisionContext::new()
            .with("relationship_type", "friend")
            .with("sender_domain", "gmail.com")
            .with("importance_score", score)
            .with("timestamp", format!("2026-03-02T{hour:02}:15:00Z"))
    }

    async fn seed(store: &PolicyStore, hypotheses: &[Hypothesis]) {
        for h in hypotheses {
            store.save_hypothesis(h).await.unwrap();
        }
    }

    #[test]
    fn predicate_covers_shared_attributes() {
        let t = Utc::now();
        let members = vec![
            validated(friend(8, 0.4), Action::Reply, 0.6, t),
            validated(friend(9, 0.7), Action::Reply, 0.6, t),
            validated(friend(10, 0.5), Action::Reply, 0.6, t),
        ];
        let predicate = derive_predicate(&members, &SynthesisConfig::default());
        let expected = Predicate::new([
            Clause::equals("relationship_type", "friend"),
            Clause::equals("sender_domain", "gmail.com"),
            Clause::range("importance_score", Some(0.4), Some(0.7)),
            Clause::time_window("timestamp", 8, 11),
        ]);
        assert_eq!(predicate, expected);
        assert!(members.iter().all(|h| predicate.matches(&h.context)));
    }

    #[test]
    fn differing_values_drop_the_clause() {
        let t = Utc::now();
        let mut other = friend(8, 0.5);
        other.insert("sender_domain", "acme.com");
        other.insert("timestamp", "2026-03-02T20:00:00Z");
        let members = vec![
            validated(friend(8, 0.5), Action::Reply, 0.6, t),
            validated(other, Action::Reply, 0.6, t),
        ];
        let predicate = derive_predicate(&members, &SynthesisConfig::default());
        assert!(predicate.clauses().iter().all(|c| c.field() != "sender_domain"));
        assert!(predicate.clauses().iter().all(|c| c.field() != "timestamp"));
    }

    #[test]
    fn covering_window_wraps_midnight() {
        let hours: BTreeSet<u32> = [23, 0, 1].into_iter().collect();
        assert_eq!(covering_window(&hours), Some((23, 2, 3)));
        let hours: BTreeSet<u32> = [5].into_iter().collect();
        assert_eq!(covering_window(&hours), Some((5, 6, 1)));
    }

    #[test]
    fn confidence_is_fraction_above_floor() {
        let t = Utc::now();
        let members = vec![
            validated(friend(8, 0.5), Action::Reply, 0.9, t),
            validated(friend(8, 0.5), Action::Reply, 0.45, t),
            validated(friend(8, 0.5), Action::Reply, 0.2, t),
            validated(friend(8, 0.5), Action::Reply, 0.1, t),
        ];
        assert_eq!(cluster_confidence(&members, 0.4), 0.5);
    }

    #[test]
    fn confidence_at_the_floor_does_not_count() {
        let t = Utc::now();
        let members = vec![
            validated(friend(8, 0.5), Action::Reply, 0.4, t),
            validated(friend(8, 0.5), Action::Reply, 0.8, t),
        ];
        assert_eq!(cluster_confidence(&members, 0.4), 0.5);
        assert_eq!(cluster_confidence(&[], 0.4), 0.0);
    }

    #[tokio::test]
    async fn three_validated_hypotheses_make_one_rule() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let start = Utc::now();
        let resolved = start - Duration::minutes(5);
        seed(
            &store,
            &[
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(9, 0.6), Action::Reply, 0.6, resolved),
                validated(friend(9, 0.7), Action::Reply, 0.3, resolved),
                // Different action: its own cluster, too small.
                validated(friend(9, 0.7), Action::Star, 0.9, resolved),
            ],
        )
        .await;

        let proposer = StubProposer::new(true);
        let synth = StrategySynthesizer::new(store.clone(), proposer.clone(), SynthesisConfig::default());
        let report = synth.run(start).await.unwrap();

        assert_eq!(report.considered, 4);
        assert_eq!(report.candidates, 1);
        assert_eq!(report.created.len(), 1);
        let rule = &report.created[0];
        assert_eq!(rule.action, Action::Reply);
        assert_eq!(rule.description, "Reply to friends");
        assert!((rule.confidence - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(rule.provenance.len(), 3);
        assert_eq!(*proposer.examples_seen.lock().unwrap(), vec![3]);

        // Consumed hypotheses are not clustered again.
        let again = synth.run(Utc::now()).await.unwrap();
        assert_eq!(again.considered, 1);
        assert!(again.created.is_empty());
        assert_eq!(store.get_active_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn identical_cluster_does_not_duplicate_active_rule() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let start = Utc::now();
        let resolved = start - Duration::minutes(5);
        let batch = || {
            vec![
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
            ]
        };
        let synth = StrategySynthesizer::new(store.clone(), StubProposer::new(true), SynthesisConfig::default());

        seed(&store, &batch()).await;
        assert_eq!(synth.run(start).await.unwrap().created.len(), 1);

        seed(&store, &batch()).await;
        let report = synth.run(start).await.unwrap();
        assert_eq!(report.created.len(), 0);
        assert_eq!(report.already_active, 1);
        assert_eq!(store.get_active_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn matching_cluster_is_consumed_without_describing() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let start = Utc::now();
        let resolved = start - Duration::minutes(5);
        let batch = || {
            vec![
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
            ]
        };
        let proposer = StubProposer::new(true);
        let synth = StrategySynthesizer::new(store.clone(), proposer.clone(), SynthesisConfig::default());

        seed(&store, &batch()).await;
        let rule = synth.run(start).await.unwrap().created.remove(0);

        let second = batch();
        seed(&store, &second).await;
        for _ in 0..5 {
            synth.run(start).await.unwrap();
        }

        // Only the first run asked for a description.
        assert_eq!(proposer.examples_seen.lock().unwrap().len(), 1);
        let stored = store.get_rule(rule.id).await.unwrap().unwrap();
        assert_eq!(stored.provenance.len(), 6);
        assert!(second.iter().all(|h| stored.provenance.contains(&h.id)));

        let after = synth.run(start).await.unwrap();
        assert_eq!(after.considered, 0);
        assert_eq!(after.already_active, 0);
    }

    #[tokio::test]
    async fn hypotheses_resolved_after_cycle_start_wait() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let start = Utc::now();
        seed(
            &store,
            &[
                validated(friend(8, 0.5), Action::Reply, 0.6, start),
                validated(friend(8, 0.5), Action::Reply, 0.6, start + Duration::seconds(1)),
                validated(friend(8, 0.5), Action::Reply, 0.6, start - Duration::seconds(1)),
            ],
        )
        .await;

        let synth = StrategySynthesizer::new(store, StubProposer::new(true), SynthesisConfig::default());
        let report = synth.run(start).await.unwrap();
        assert_eq!(report.considered, 1);
        assert_eq!(report.candidates, 0);
    }

    #[tokio::test]
    async fn proposer_failure_uses_generated_description() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let start = Utc::now();
        let resolved = start - Duration::minutes(1);
        seed(
            &store,
            &[
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
                validated(friend(8, 0.5), Action::Reply, 0.6, resolved),
            ],
        )
        .await;

        let synth = StrategySynthesizer::new(store, StubProposer::new(false), SynthesisConfig::default());
        let report = synth.run(start).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert!(report.created[0].description.starts_with("reply when "));
        assert!(report.created[0].description.contains("3 validated explorations"));
    }
}
