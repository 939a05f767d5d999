//! Weight optimizer: grid search over signal weights against recent feedback.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::WeightConfig;
use crate::error::StoreError;
use crate::policy::types::{Action, Decision, DecisionContext, Feedback, WeightVector};
use crate::store::PolicyStore;

/// Weight name and the context field carrying its signal score.
pub const SIGNALS: [(&str, &str); 5] = [
    ("person_importance", "person_score"),
    ("cluster_pattern", "cluster_score"),
    ("content_urgency", "content_score"),
    ("learned_patterns", "pattern_score"),
    ("domain_signal", "domain_score"),
];

/// Score used for a signal the context does not carry.
const NEUTRAL_SIGNAL: f64 = 0.5;

const PERSON_GRID: [f64; 3] = [0.2, 0.3, 0.4];
const CLUSTER_GRID: [f64; 3] = [0.1, 0.2, 0.3];
const CONTENT_GRID: [f64; 3] = [0.15, 0.25, 0.35];
const LEARNED_GRID: [f64; 3] = [0.1, 0.15, 0.2];

/// What an optimization pass did.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationOutcome {
    InsufficientData {
        samples: usize,
    },
    NoImprovement {
        current_accuracy: f64,
        best_accuracy: f64,
    },
    Bumped {
        weights: WeightVector,
        previous_accuracy: f64,
    },
}

/// One decision with known ground truth.
#[derive(Debug, Clone)]
struct Sample {
    signals: [f64; 5],
    target: Option<Action>,
}

impl Sample {
    fn new(decision: &Decision, feedback: &Feedback) -> Self {
        let target = if feedback.correct {
            Some(decision.action)
        } else {
            feedback.corrected_action
        };
        Self {
            signals: signal_scores(&decision.context),
            target,
        }
    }
}

fn signal_scores(context: &DecisionContext) -> [f64; 5] {
    SIGNALS.map(|(_, field)| context.get_f64(field).unwrap_or(NEUTRAL_SIGNAL))
}

/// Every grid point whose remainder leaves a nonnegative domain weight.
fn candidate_grid() -> Vec<BTreeMap<String, f64>> {
    let mut grid = Vec::new();
    for person in PERSON_GRID {
        for cluster in CLUSTER_GRID {
            for content in CONTENT_GRID {
                for learned in LEARNED_GRID {
                    let domain = 1.0 - person - cluster - content - learned;
                    if domain < -1e-9 {
                        continue;
                    }
                    let values = [person, cluster, content, learned, domain.max(0.0)];
                    grid.push(
                        SIGNALS
                            .iter()
                            .zip(values)
                            .map(|((name, _), w)| (name.to_string(), w))
                            .collect(),
                    );
                }
            }
        }
    }
    grid
}

/// Fraction of samples whose simulated action matches the target.
fn simulate_accuracy(samples: &[Sample], weights: &BTreeMap<String, f64>, threshold: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let w = SIGNALS.map(|(name, _)| weights.get(name).copied().unwrap_or(0.0));
    let hits = samples
        .iter()
        .filter(|s| {
            let score: f64 = s.signals.iter().zip(w).map(|(x, w)| x * w).sum();
            let predicted = if score > threshold {
                Action::Star
            } else {
                Action::Archive
            };
            s.target == Some(predicted)
        })
        .count();
    hits as f64 / samples.len() as f64
}

pub struct WeightOptimizer {
    store: PolicyStore,
    config: WeightConfig,
}

impl WeightOptimizer {
    pub fn new(store: PolicyStore, config: WeightConfig) -> Self {
        Self { store, config }
    }

    /// Search the grid; write a new weight version when it beats the current
    /// weights by more than the configured margin.
    pub async fn optimize(&self, now: DateTime<Utc>) -> Result<OptimizationOutcome, StoreError> {
        let labeled = self
            .store
            .recent_labeled_decisions(self.config.sample_size)
            .await?;
        if labeled.len() < self.config.min_samples {
            debug!(samples = labeled.len(), "Not enough feedback to optimize weights");
            return Ok(OptimizationOutcome::InsufficientData {
                samples: labeled.len(),
            });
        }
        let samples: Vec<Sample> = labeled.iter().map(|(d, f)| Sample::new(d, f)).collect();

        let current = self.store.get_weights(None).await?;
        let threshold = self.config.star_threshold;
        let current_accuracy = simulate_accuracy(&samples, &current.weights, threshold);

        let mut best: Option<(BTreeMap<String, f64>, f64)> = None;
        for candidate in candidate_grid() {
            let accuracy = simulate_accuracy(&samples, &candidate, threshold);
            if best.as_ref().is_none_or(|(_, b)| accuracy > *b) {
                best = Some((candidate, accuracy));
            }
        }
        let Some((best_weights, best_accuracy)) = best else {
            return Ok(OptimizationOutcome::NoImprovement {
                current_accuracy,
                best_accuracy: current_accuracy,
            });
        };

        if best_accuracy - current_accuracy <= self.config.min_improvement {
            debug!(current_accuracy, best_accuracy, "Weights already near best");
            return Ok(OptimizationOutcome::NoImprovement {
                current_accuracy,
                best_accuracy,
            });
        }

        match self
            .store
            .bump_weights(best_weights, Some(best_accuracy), now)
            .await?
        {
            Some(weights) => {
                info!(
                    version = weights.version,
                    from = current_accuracy,
                    to = best_accuracy,
                    "Signal weights improved"
                );
                Ok(OptimizationOutcome::Bumped {
                    weights,
                    previous_accuracy: current_accuracy,
                })
            }
            None => Ok(OptimizationOutcome::NoImprovement {
                current_accuracy,
                best_accuracy,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::policy::types::Evaluation;
    use crate::store::InMemoryStore;

    #[test]
    fn grid_points_sum_to_one() {
        let grid = candidate_grid();
        assert!(!grid.is_empty());
        for weights in &grid {
            let total: f64 = weights.values().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(weights.values().all(|w| *w >= 0.0));
        }
    }

    #[test]
    fn missing_signals_are_neutral() {
        let ctx = DecisionContext::new().with("person_score", 0.9);
        assert_eq!(signal_scores(&ctx), [0.9, 0.5, 0.5, 0.5, 0.5]);
    }

    #[test]
    fn accuracy_counts_matching_targets() {
        let weights = WeightVector::defaults().weights;
        let samples = vec![
            Sample {
                signals: [1.0; 5],
                target: Some(Action::Star),
            },
            Sample {
                signals: [0.0; 5],
                target: Some(Action::Archive),
            },
            Sample {
                signals: [0.0; 5],
                target: None,
            },
            Sample {
                signals: [1.0; 5],
                target: Some(Action::Reply),
            },
        ];
        assert_eq!(simulate_accuracy(&samples, &weights, 0.6), 0.5);
    }

    async fn seed_feedback(store: &PolicyStore, n: usize, person: f64, target: Action) {
        let now = Utc::now();
        for i in 0..n {
            let ctx = DecisionContext::new()
                .with("person_score", person)
                .with("cluster_score", 0.5)
                .with("content_score", 0.5)
                .with("pattern_score", 0.5)
                .with("domain_score", 0.5);
            let eval = Evaluation {
                action: Action::Archive,
                confidence: 0.7,
                applied_rule_id: None,
                base_action: Action::Archive,
            };
            let decision = Decision::from_evaluation(ctx, eval, now);
            store.insert_decision(&decision).await.unwrap();
            let feedback = if target == Action::Archive {
                Feedback::correct(decision.id)
            } else {
                Feedback::corrected(decision.id, target)
            };
            store
                .insert_feedback(&feedback.at(now - Duration::seconds(i as i64)))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn too_few_samples_do_nothing() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        seed_feedback(&store, 5, 1.0, Action::Star).await;
        let outcome = WeightOptimizer::new(store, WeightConfig::default())
            .optimize(Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, OptimizationOutcome::InsufficientData { samples: 5 });
    }

    #[tokio::test]
    async fn person_heavy_weights_win_when_person_signal_decides() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        // Defaults score 0.3 * 0.8 + 0.7 * 0.5 = 0.59 (archive); only a
        // person weight of 0.4 clears the star threshold: 0.32 + 0.30 = 0.62.
        seed_feedback(&store, 25, 0.8, Action::Star).await;

        let outcome = WeightOptimizer::new(store.clone(), WeightConfig::default())
            .optimize(Utc::now())
            .await
            .unwrap();
        match outcome {
            OptimizationOutcome::Bumped {
                weights,
                previous_accuracy,
            } => {
                assert_eq!(previous_accuracy, 0.0);
                assert_eq!(weights.version, 1);
                assert!((weights.get("person_importance") - 0.4).abs() < 1e-9);
                assert_eq!(weights.accuracy, Some(1.0));
            }
            other => panic!("expected a bump, got {other:?}"),
        }
        assert_eq!(store.get_weights(None).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn no_bump_when_current_weights_are_best() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        // Everything scores 0.5 and is archived: every grid point is perfect.
        seed_feedback(&store, 25, 0.5, Action::Archive).await;
        let outcome = WeightOptimizer::new(store.clone(), WeightConfig::default())
            .optimize(Utc::now())
            .await
            .unwrap();
        assert!(matches!(outcome, OptimizationOutcome::NoImprovement { .. }));
        assert_eq!(store.get_weights(None).await.unwrap().version, 0);
    }
}
