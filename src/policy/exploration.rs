//! Exploration controller: decides when to deviate from the current policy
//! and records the hypothesis each deviation tests.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExplorationConfig;
use crate::error::StoreError;
use crate::policy::types::{
    Decision, DecisionContext, Evaluation, ExploreTrigger, Feedback, Hypothesis, HypothesisStatus,
    Prediction,
};
use crate::proposer::{AlternativeRequest, StrategyProposer};
use crate::store::PolicyStore;

// ── Randomness ──────────────────────────────────────────────────────

/// Source of uniform draws in `[0, 1)`.
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// `StdRng`-backed source. Seeded in tests, entropy-seeded in production.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..1.0),
        }
    }
}

/// Replays a fixed sequence of draws, cycling when exhausted.
pub struct ScriptedRandom {
    draws: Vec<f64>,
    next: Mutex<usize>,
}

impl ScriptedRandom {
    pub fn new(draws: Vec<f64>) -> Self {
        Self {
            draws,
            next: Mutex::new(0),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn next_f64(&self) -> f64 {
        if self.draws.is_empty() {
            return 0.0;
        }
        let mut next = match self.next.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let draw = self.draws[*next % self.draws.len()];
        *next += 1;
        draw
    }
}

// ── Controller ──────────────────────────────────────────────────────

/// Outcome of `should_explore`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExploreDecision {
    pub explore: bool,
    pub probability: f64,
    pub trigger: ExploreTrigger,
}

/// Accuracy of the last `window` outcomes minus the `window` before them.
/// `None` until there are two full windows.
fn window_improvement(outcomes: &[bool], window: usize) -> Option<f64> {
    if window == 0 || outcomes.len() < 2 * window {
        return None;
    }
    let rate = |slice: &[bool]| slice.iter().filter(|c| **c).count() as f64 / slice.len() as f64;
    let recent = &outcomes[outcomes.len() - window..];
    let previous = &outcomes[outcomes.len() - 2 * window..outcomes.len() - window];
    Some(rate(recent) - rate(previous))
}

pub struct ExplorationController {
    store: PolicyStore,
    proposer: Arc<dyn StrategyProposer>,
    rng: Arc<dyn RandomSource>,
    config: ExplorationConfig,
}

impl ExplorationController {
    pub fn new(
        store: PolicyStore,
        proposer: Arc<dyn StrategyProposer>,
        rng: Arc<dyn RandomSource>,
        config: ExplorationConfig,
    ) -> Self {
        Self {
            store,
            proposer,
            rng,
            config,
        }
    }

    /// Explore probability and the trigger that set it, highest priority first.
    pub async fn explore_probability(
        &self,
        context: &DecisionContext,
        decision: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<(f64, ExploreTrigger), StoreError> {
        let cfg = &self.config;

        if decision.confidence < cfg.low_confidence_threshold {
            return Ok((cfg.low_confidence_rate, ExploreTrigger::LowConfidence));
        }

        let seen = self
            .store
            .count_decisions_for_cluster(context.cluster_key())
            .await?;
        if seen < cfg.limited_data_threshold {
            return Ok((cfg.limited_data_rate, ExploreTrigger::LimitedData));
        }

        if self.is_plateaued(now).await? {
            return Ok((cfg.plateau_rate, ExploreTrigger::PerformancePlateau));
        }

        if seen < cfg.novel_context_threshold {
            return Ok((cfg.novel_context_rate, ExploreTrigger::NovelContext));
        }

        Ok((cfg.baseline_rate, ExploreTrigger::Baseline))
    }

    async fn is_plateaued(&self, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let recent: Vec<Feedback> = self
            .store
            .feedback_between(now - self.config.plateau_lookback, now)
            .await?;
        let outcomes: Vec<bool> = recent.iter().map(|f| f.correct).collect();
        Ok(window_improvement(&outcomes, self.config.plateau_window)
            .is_some_and(|delta| delta < self.config.plateau_min_improvement))
    }

    /// Decide explore vs exploit with one Bernoulli draw.
    pub async fn should_explore(
        &self,
        context: &DecisionContext,
        decision: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<ExploreDecision, StoreError> {
        let (probability, trigger) = self.explore_probability(context, decision, now).await?;
        let probability = probability.clamp(0.0, 1.0);
        let draw = self.rng.next_f64();
        let explore = draw < probability;
        debug!(
            trigger = trigger.label(),
            probability,
            draw,
            explore,
            "Exploration check"
        );
        Ok(ExploreDecision {
            explore,
            probability,
            trigger,
        })
    }

    /// Ask the proposer for an alternative and record a pending hypothesis.
    ///
    /// Proposer failures, timeouts and non-alternatives fall back to the
    /// exploit decision with no hypothesis. Only store errors are returned.
    pub async fn generate_alternative(
        &self,
        context: &DecisionContext,
        decision: &Evaluation,
        verdict: ExploreDecision,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let mut fallback = Decision::from_evaluation(context.clone(), decision.clone(), now);
        fallback.explore_trigger = Some(verdict.trigger);
        fallback.explore_probability = Some(verdict.probability);

        let request = AlternativeRequest {
            context: context.clone(),
            current_prediction: Prediction::new(decision.action, decision.confidence),
        };
        let alternative = match self.proposer.propose_alternative(&request).await {
            Ok(alt) => alt,
            Err(e) => {
                warn!(error = %e, "Strategy proposer failed, keeping current decision");
                return Ok(fallback);
            }
        };
        if alternative.alternative_action == decision.action {
            warn!(
                action = %decision.action,
                "Proposer repeated the current action, keeping current decision"
            );
            return Ok(fallback);
        }

        let decision_id = Uuid::new_v4();
        let hypothesis = Hypothesis {
            id: Uuid::new_v4(),
            decision_id,
            context: context.clone(),
            alternative_action: alternative.alternative_action,
            base_action: decision.action,
            statement: alternative.hypothesis,
            expected_outcome: alternative.expected_outcome,
            success_criteria: alternative.success_criteria,
            confidence: alternative.confidence,
            status: HypothesisStatus::Pending,
            created_at: now,
            resolved_at: None,
            resolution: None,
        };
        self.store.save_hypothesis(&hypothesis).await?;

        info!(
            hypothesis_id = %hypothesis.id,
            cluster = hypothesis.cluster_key(),
            from = %decision.action,
            to = %hypothesis.alternative_action,
            trigger = verdict.trigger.label(),
            "Exploring alternative action"
        );

        Ok(Decision {
            id: decision_id,
            context: context.clone(),
            action: hypothesis.alternative_action,
            confidence: self.config.exploration_confidence,
            is_exploration: true,
            applied_rule_id: None,
            base_action: decision.action,
            hypothesis_id: Some(hypothesis.id),
            explore_trigger: Some(verdict.trigger),
            explore_probability: Some(verdict.probability),
            created_at: now,
        })
    }

    /// `should_explore`, then `generate_alternative` when the draw says so.
    pub async fn decide(
        &self,
        context: &DecisionContext,
        decision: &Evaluation,
        now: DateTime<Utc>,
    ) -> Result<Decision, StoreError> {
        let verdict = self.should_explore(context, decision, now).await?;
        if verdict.explore {
            return self.generate_alternative(context, decision, verdict, now).await;
        }
        let mut exploit = Decision::from_evaluation(context.clone(), decision.clone(), now);
        exploit.explore_trigger = Some(verdict.trigger);
        exploit.explore_probability = Some(verdict.probability);
        Ok(exploit)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration;

    use super::*;
    use crate::error::ProposerError;
    use crate::policy::types::Action;
    use crate::proposer::{Alternative, Pattern, PatternRequest};
    use crate::store::InMemoryStore;

    enum Reply {
        Alternative(Action),
        Fail,
    }

    struct StubProposer(Reply);

    #[async_trait]
    impl StrategyProposer for StubProposer {
        async fn propose_alternative(
            &self,
            _request: &AlternativeRequest,
        ) -> Result<Alternative, ProposerError> {
            match self.0 {
                Reply::Alternative(action) => Ok(Alternative {
                    alternative_action: action,
                    hypothesis: "friends want replies".into(),
                    expected_outcome: "user marks correct".into(),
                    success_criteria: Some("positive feedback".into()),
                    confidence: 0.7,
                }),
                Reply::Fail => Err(ProposerError::InvalidResponse {
                    provider: "stub".into(),
                    reason: "garbage".into(),
                }),
            }
        }

        async fn synthesize_pattern(
            &self,
            _request: &PatternRequest,
        ) -> Result<Pattern, ProposerError> {
            Err(ProposerError::InvalidResponse {
                provider: "stub".into(),
                reason: "unused".into(),
            })
        }
    }

    fn controller(store: &PolicyStore, reply: Reply, draws: Vec<f64>) -> ExplorationController {
        ExplorationController::new(
            store.clone(),
            Arc::new(StubProposer(reply)),
            Arc::new(ScriptedRandom::new(draws)),
            ExplorationConfig::default(),
        )
    }

    fn store() -> PolicyStore {
        PolicyStore::new(Arc::new(InMemoryStore::new()))
    }

    fn eval(action: Action, confidence: f64) -> Evaluation {
        Evaluation {
            action,
            confidence,
            applied_rule_id: None,
            base_action: action,
        }
    }

    fn friend() -> DecisionContext {
        DecisionContext::new().with("relationship_type", "friend")
    }

    async fn seed_decisions(store: &PolicyStore, ctx: &DecisionContext, n: usize) {
        for _ in 0..n {
            let d = Decision::from_evaluation(ctx.clone(), eval(Action::Star, 0.9), Utc::now());
            store.insert_decision(&d).await.unwrap();
        }
    }

    #[tokio::test]
    async fn low_confidence_uses_point_four_and_draw_decides() {
        let store = store();
        let c = controller(&store, Reply::Fail, vec![0.35]);
        let verdict = c
            .should_explore(&friend(), &eval(Action::Archive, 0.5), Utc::now())
            .await
            .unwrap();
        assert_eq!(verdict.trigger, ExploreTrigger::LowConfidence);
        assert_eq!(verdict.probability, 0.4);
        assert!(verdict.explore);

        let c = controller(&store, Reply::Fail, vec![0.45]);
        let verdict = c
            .should_explore(&friend(), &eval(Action::Archive, 0.5), Utc::now())
            .await
            .unwrap();
        assert!(!verdict.explore);
    }

    #[tokio::test]
    async fn limited_data_then_baseline() {
        let store = store();
        let c = controller(&store, Reply::Fail, vec![0.99]);

        let (p, trigger) = c
            .explore_probability(&friend(), &eval(Action::Star, 0.9), Utc::now())
            .await
            .unwrap();
        assert_eq!((p, trigger), (0.3, ExploreTrigger::LimitedData));

        seed_decisions(&store, &friend(), 10).await;
        let (p, trigger) = c
            .explore_probability(&friend(), &eval(Action::Star, 0.9), Utc::now())
            .await
            .unwrap();
        assert_eq!((p, trigger), (0.1, ExploreTrigger::Baseline));
    }

    #[tokio::test]
    async fn novel_context_when_limited_data_threshold_is_lower() {
        let store = store();
        let config = ExplorationConfig {
            limited_data_threshold: 2,
            ..ExplorationConfig::default()
        };
        let c = ExplorationController::new(
            store.clone(),
            Arc::new(StubProposer(Reply::Fail)),
            Arc::new(ScriptedRandom::new(vec![0.99])),
            config,
        );

        seed_decisions(&store, &friend(), 3).await;
        let (p, trigger) = c
            .explore_probability(&friend(), &eval(Action::Star, 0.9), Utc::now())
            .await
            .unwrap();
        assert_eq!((p, trigger), (0.4, ExploreTrigger::NovelContext));

        seed_decisions(&store, &friend(), 2).await;
        let (p, trigger) = c
            .explore_probability(&friend(), &eval(Action::Star, 0.9), Utc::now())
            .await
            .unwrap();
        assert_eq!((p, trigger), (0.1, ExploreTrigger::Baseline));
    }

    #[tokio::test]
    async fn plateau_detected_from_recent_feedback() {
        let store = store();
        seed_decisions(&store, &friend(), 10).await;
        let now = Utc::now();
        // Previous ten all correct, last ten half correct: accuracy dropped.
        for i in 0..20 {
            let correct = i < 10 || i % 2 == 0;
            let fb = Feedback {
                correct,
                ..Feedback::correct(Uuid::new_v4())
            }
            .at(now - Duration::minutes(60 - i));
            store.insert_feedback(&fb).await.unwrap();
        }

        let c = controller(&store, Reply::Fail, vec![0.99]);
        let (p, trigger) = c
            .explore_probability(&friend(), &eval(Action::Star, 0.9), now)
            .await
            .unwrap();
        assert_eq!((p, trigger), (0.5, ExploreTrigger::PerformancePlateau));
    }

    #[test]
    fn improvement_needs_two_windows() {
        assert_eq!(window_improvement(&[true; 19], 10), None);
        let mut outcomes = vec![false; 10];
        outcomes.extend(vec![true; 10]);
        assert_eq!(window_improvement(&outcomes, 10), Some(1.0));
    }

    #[tokio::test]
    async fn alternative_creates_pending_hypothesis() {
        let store = store();
        let c = controller(&store, Reply::Alternative(Action::Reply), vec![0.0]);
        let decision = c
            .decide(&friend(), &eval(Action::Archive, 0.5), Utc::now())
            .await
            .unwrap();

        assert!(decision.is_exploration);
        assert_eq!(decision.action, Action::Reply);
        assert_eq!(decision.base_action, Action::Archive);
        assert_eq!(decision.confidence, 0.5);
        assert_eq!(decision.applied_rule_id, None);

        let hyp = store
            .get_hypothesis(decision.hypothesis_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hyp.status, HypothesisStatus::Pending);
        assert_eq!(hyp.decision_id, decision.id);
        assert_eq!(hyp.alternative_action, Action::Reply);
    }

    #[tokio::test]
    async fn proposer_failure_falls_back_without_hypothesis() {
        let backend = Arc::new(InMemoryStore::new());
        let store = PolicyStore::new(backend.clone());
        let c = controller(&store, Reply::Fail, vec![0.0]);
        let decision = c
            .decide(&friend(), &eval(Action::Archive, 0.5), Utc::now())
            .await
            .unwrap();

        assert!(!decision.is_exploration);
        assert_eq!(decision.action, Action::Archive);
        assert_eq!(decision.hypothesis_id, None);
        assert_eq!(backend.len("hypotheses").await, 0);
    }

    #[tokio::test]
    async fn same_action_is_not_an_alternative() {
        let backend = Arc::new(InMemoryStore::new());
        let store = PolicyStore::new(backend.clone());
        let c = controller(&store, Reply::Alternative(Action::Archive), vec![0.0]);
        let decision = c
            .decide(&friend(), &eval(Action::Archive, 0.5), Utc::now())
            .await
            .unwrap();
        assert!(!decision.is_exploration);
        assert_eq!(backend.len("hypotheses").await, 0);
    }

    #[test]
    fn seeded_random_is_reproducible() {
        let a = SeededRandom::new(7);
        let b = SeededRandom::new(7);
        for _ in 0..5 {
            let x = a.next_f64();
            assert_eq!(x, b.next_f64());
            assert!((0.0..1.0).contains(&x));
        }
    }
}
