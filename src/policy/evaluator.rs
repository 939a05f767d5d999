//! Decision evaluator: first matching active rule wins, else the base
//! prediction passes through.

use tracing::debug;

use crate::error::StoreError;
use crate::policy::rule::Rule;
use crate::policy::types::{DecisionContext, Evaluation, Prediction};
use crate::store::PolicyStore;

/// Apply `rules` (already in store order) to a context.
///
/// Pure: identical rules and context always give the same evaluation, and at
/// most one rule is ever applied.
pub fn evaluate(rules: &[Rule], context: &DecisionContext, base: Prediction) -> Evaluation {
    match rules.iter().find(|r| r.is_active() && r.matches(context)) {
        Some(rule) => Evaluation {
            action: rule.action,
            confidence: rule.confidence,
            applied_rule_id: Some(rule.id),
            base_action: base.action,
        },
        None => Evaluation {
            action: base.action,
            confidence: base.confidence,
            applied_rule_id: None,
            base_action: base.action,
        },
    }
}

/// Evaluator bound to a policy store.
#[derive(Clone)]
pub struct DecisionEvaluator {
    store: PolicyStore,
}

impl DecisionEvaluator {
    pub fn new(store: PolicyStore) -> Self {
        Self { store }
    }

    /// Load the active rules and evaluate the context against them.
    pub async fn evaluate(
        &self,
        context: &DecisionContext,
        base: Prediction,
    ) -> Result<Evaluation, StoreError> {
        let rules = self.store.get_active_rules().await?;
        let eval = evaluate(&rules, context, base);
        if let Some(rule_id) = eval.applied_rule_id {
            debug!(rule_id = %rule_id, action = %eval.action, "Rule applied");
        }
        Ok(eval)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::*;
    use crate::policy::rule::{Clause, Predicate};
    use crate::policy::types::Action;
    use crate::store::InMemoryStore;

    fn acme_rule() -> Rule {
        Rule::new(
            Predicate::new([Clause::equals("sender_domain", "acme.com")]),
            Action::Archive,
            0.9,
            vec![],
            "Archive acme.com",
            Utc::now(),
        )
    }

    fn acme_context() -> DecisionContext {
        DecisionContext::new()
            .with("sender_domain", "acme.com")
            .with("subject", "hi")
    }

    #[test]
    fn matching_rule_overrides_base() {
        let rule = acme_rule();
        let eval = evaluate(
            std::slice::from_ref(&rule),
            &acme_context(),
            Prediction::new(Action::Star, 0.7),
        );
        assert_eq!(eval.action, Action::Archive);
        assert_eq!(eval.confidence, 0.9);
        assert_eq!(eval.applied_rule_id, Some(rule.id));
        assert_eq!(eval.base_action, Action::Star);
    }

    #[test]
    fn no_match_passes_base_through() {
        let ctx = DecisionContext::new().with("sender_domain", "other.com");
        let base = Prediction::new(Action::Reply, 0.65);
        let eval = evaluate(&[acme_rule()], &ctx, base);
        assert_eq!(eval.action, Action::Reply);
        assert_eq!(eval.confidence, 0.65);
        assert_eq!(eval.applied_rule_id, None);
    }

    #[test]
    fn first_rule_in_order_wins() {
        let first = acme_rule();
        let second = Rule::new(
            Predicate::new([Clause::contains("subject", "HI")]),
            Action::Reply,
            0.8,
            vec![],
            "Reply to greetings",
            Utc::now(),
        );
        let eval = evaluate(
            &[first.clone(), second],
            &acme_context(),
            Prediction::new(Action::Star, 0.5),
        );
        assert_eq!(eval.applied_rule_id, Some(first.id));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let rules = vec![acme_rule()];
        let base = Prediction::new(Action::Star, 0.5);
        let a = evaluate(&rules, &acme_context(), base);
        let b = evaluate(&rules, &acme_context(), base);
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn store_order_decides_between_overlapping_rules() {
        let store = PolicyStore::new(Arc::new(InMemoryStore::new()));
        let weak = Rule::new(
            Predicate::new([Clause::equals("sender_domain", "acme.com")]),
            Action::Star,
            0.6,
            vec![],
            "Star acme.com",
            Utc::now() - Duration::days(1),
        );
        let strong = acme_rule();
        store.upsert_rule(&weak).await.unwrap();
        store.upsert_rule(&strong).await.unwrap();

        let evaluator = DecisionEvaluator::new(store);
        let eval = evaluator
            .evaluate(&acme_context(), Prediction::new(Action::Reply, 0.5))
            .await
            .unwrap();
        assert_eq!(eval.applied_rule_id, Some(strong.id));
        assert_eq!(eval.action, Action::Archive);
    }
}
