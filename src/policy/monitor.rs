//! Performance monitor: trailing-window metrics, weak areas, rule
//! deprecation and the plain-text improvement report.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::MonitorConfig;
use crate::error::StoreError;
use crate::policy::rule::Rule;
use crate::policy::types::{Action, HypothesisStatus};
use crate::store::PolicyStore;

/// Metrics for one trailing window `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Correct feedback over all feedback created in the window.
    pub accuracy: f64,
    pub feedback_count: usize,
    pub avg_confidence: f64,
    /// Share of decisions in the window that deferred to the user.
    pub ask_rate: f64,
    pub decision_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Improving,
    Stagnant,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stagnant => "stagnant",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleCounts {
    pub active: usize,
    pub deprecated: usize,
    pub created_recently: usize,
}

/// Everything the monitor measured at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub oldest: WindowStats,
    pub middle: WindowStats,
    pub recent: WindowStats,
    pub trend: Trend,
    pub explorations_validated: usize,
    pub explorations_rejected: usize,
    pub exploration_success_rate: f64,
    /// Recent-window accuracy per relationship type.
    pub relationship_accuracy: BTreeMap<String, f64>,
    pub rules: RuleCounts,
}

/// Something the policy is doing badly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "area", rename_all = "snake_case")]
pub enum WeakArea {
    OverallAccuracy { current: f64, target: f64 },
    UserInterventionRate { current: f64, target: f64 },
    ExplorationQuality { current: f64, target: f64 },
    LearningPlateau,
    RelationshipType { relationship: String, current: f64, target: f64 },
}

impl WeakArea {
    pub fn recommendation(&self) -> String {
        match self {
            Self::OverallAccuracy { .. } => {
                "explore more to discover better strategies".to_string()
            }
            Self::UserInterventionRate { .. } => "needs more confident decision rules".to_string(),
            Self::ExplorationQuality { .. } => {
                "exploration hypotheses rarely hold up; improve alternative generation".to_string()
            }
            Self::LearningPlateau => "explore a different part of the strategy space".to_string(),
            Self::RelationshipType { relationship, .. } => {
                format!("focus exploration on {relationship} messages")
            }
        }
    }
}

impl fmt::Display for WeakArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OverallAccuracy { current, target } => {
                write!(f, "overall accuracy {:.1}% (target {:.0}%)", current * 100.0, target * 100.0)
            }
            Self::UserInterventionRate { current, target } => {
                write!(f, "ask rate {:.1}% (target {:.0}%)", current * 100.0, target * 100.0)
            }
            Self::ExplorationQuality { current, target } => write!(
                f,
                "exploration success {:.1}% (target {:.0}%)",
                current * 100.0,
                target * 100.0
            ),
            Self::LearningPlateau => f.write_str("accuracy is not improving"),
            Self::RelationshipType {
                relationship,
                current,
                target,
            } => write!(
                f,
                "{relationship} accuracy {:.1}% (target {:.0}%)",
                current * 100.0,
                target * 100.0
            ),
        }
    }
}

/// Ratio with an empty denominator reading as zero.
fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Weak areas implied by a snapshot.
pub fn weak_areas(snapshot: &PerformanceSnapshot, config: &MonitorConfig) -> Vec<WeakArea> {
    let mut areas = Vec::new();
    if snapshot.recent.accuracy < config.accuracy_floor {
        areas.push(WeakArea::OverallAccuracy {
            current: snapshot.recent.accuracy,
            target: 0.85,
        });
    }
    if snapshot.recent.ask_rate > config.ask_rate_ceiling {
        areas.push(WeakArea::UserInterventionRate {
            current: snapshot.recent.ask_rate,
            target: 0.1,
        });
    }
    if snapshot.exploration_success_rate < config.exploration_success_floor {
        areas.push(WeakArea::ExplorationQuality {
            current: snapshot.exploration_success_rate,
            target: 0.5,
        });
    }
    if snapshot.trend == Trend::Stagnant {
        areas.push(WeakArea::LearningPlateau);
    }
    for (relationship, accuracy) in &snapshot.relationship_accuracy {
        if *accuracy < config.relationship_accuracy_floor {
            areas.push(WeakArea::RelationshipType {
                relationship: relationship.clone(),
                current: *accuracy,
                target: 0.8,
            });
        }
    }
    areas
}

/// Why a rule should be retired, if it should.
pub fn deprecation_reason(rule: &Rule, config: &MonitorConfig, now: DateTime<Utc>) -> Option<String> {
    if !rule.is_active() {
        return None;
    }
    if rule.usage_count >= config.min_uses_for_accuracy {
        let accuracy = rule.accuracy().unwrap_or(0.0);
        if accuracy < config.deprecation_accuracy {
            return Some(format!(
                "Low accuracy: {:.1}% over {} uses",
                accuracy * 100.0,
                rule.usage_count
            ));
        }
        return None;
    }
    let age = now - rule.created_at;
    if rule.usage_count == 0 && age > config.unused_max_age {
        return Some(format!("Never used in {} days", age.num_days()));
    }
    None
}

/// Render a snapshot as a plain-text report.
pub fn render_report(snapshot: &PerformanceSnapshot, weak: &[WeakArea]) -> String {
    let pct = |v: f64| format!("{:.1}%", v * 100.0);
    let mut lines = vec![
        "Decision policy improvement report".to_string(),
        format!("Generated {}", snapshot.taken_at.format("%Y-%m-%d %H:%M UTC")),
        String::new(),
        "Accuracy".to_string(),
        format!(
            "  oldest week: {} ({} feedback)",
            pct(snapshot.oldest.accuracy),
            snapshot.oldest.feedback_count
        ),
        format!(
            "  middle week: {} ({} feedback)",
            pct(snapshot.middle.accuracy),
            snapshot.middle.feedback_count
        ),
        format!(
            "  recent week: {} ({} feedback)",
            pct(snapshot.recent.accuracy),
            snapshot.recent.feedback_count
        ),
        format!("  trend: {}", snapshot.trend.as_str()),
    ];
    if snapshot.trend == Trend::Improving {
        lines.push(format!(
            "  +{:.1} points since the oldest week",
            (snapshot.recent.accuracy - snapshot.oldest.accuracy) * 100.0
        ));
    }

    lines.push(String::new());
    lines.push("Confidence".to_string());
    lines.push(format!("  oldest week: {}", pct(snapshot.oldest.avg_confidence)));
    lines.push(format!("  recent week: {}", pct(snapshot.recent.avg_confidence)));

    lines.push(String::new());
    lines.push("User intervention".to_string());
    lines.push(format!("  oldest week: asked {} of the time", pct(snapshot.oldest.ask_rate)));
    lines.push(format!("  recent week: asked {} of the time", pct(snapshot.recent.ask_rate)));

    lines.push(String::new());
    lines.push("Rules".to_string());
    lines.push(format!("  active: {}", snapshot.rules.active));
    lines.push(format!("  deprecated: {}", snapshot.rules.deprecated));
    lines.push(format!("  created this week: {}", snapshot.rules.created_recently));

    lines.push(String::new());
    lines.push("Exploration".to_string());
    lines.push(format!("  validated: {}", snapshot.explorations_validated));
    lines.push(format!("  rejected: {}", snapshot.explorations_rejected));
    lines.push(format!("  success rate: {}", pct(snapshot.exploration_success_rate)));

    lines.push(String::new());
    if weak.is_empty() {
        lines.push("No weak areas detected".to_string());
    } else {
        lines.push("Weak areas".to_string());
        for area in weak {
            lines.push(format!("  - {area}: {}", area.recommendation()));
        }
    }
    lines.join("\n")
}

pub struct PerformanceMonitor {
    store: PolicyStore,
    config: MonitorConfig,
}

impl PerformanceMonitor {
    pub fn new(store: PolicyStore, config: MonitorConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    async fn window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<WindowStats, StoreError> {
        let feedback = self.store.feedback_between(start, end).await?;
        let decisions = self.store.decisions_between(start, end).await?;

        let correct = feedback.iter().filter(|f| f.correct).count();
        let asks = decisions.iter().filter(|d| d.action == Action::Ask).count();
        let avg_confidence = if decisions.is_empty() {
            0.0
        } else {
            decisions.iter().map(|d| d.confidence).sum::<f64>() / decisions.len() as f64
        };

        Ok(WindowStats {
            start,
            end,
            accuracy: ratio(correct, feedback.len()),
            feedback_count: feedback.len(),
            avg_confidence,
            ask_rate: ratio(asks, decisions.len()),
            decision_count: decisions.len(),
        })
    }

    /// Recent-window feedback accuracy partitioned by the decision's
    /// relationship type.
    async fn relationship_accuracy(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<BTreeMap<String, f64>, StoreError> {
        let mut tally: BTreeMap<String, (usize, usize)> = BTreeMap::new();
        for fb in self.store.feedback_between(start, end).await? {
            let Some(decision) = self.store.get_decision(fb.decision_id).await? else {
                continue;
            };
            let entry = tally
                .entry(decision.context.cluster_key().to_string())
                .or_default();
            entry.1 += 1;
            if fb.correct {
                entry.0 += 1;
            }
        }
        Ok(tally
            .into_iter()
            .map(|(key, (correct, total))| (key, ratio(correct, total)))
            .collect())
    }

    /// Measure the three trailing windows ending at `now`.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<PerformanceSnapshot, StoreError> {
        let w = self.config.window;
        let recent = self.window(now - w, now).await?;
        let middle = self.window(now - w * 2, now - w).await?;
        let oldest = self.window(now - w * 3, now - w * 2).await?;

        let trend = if recent.accuracy - oldest.accuracy > self.config.improving_delta {
            Trend::Improving
        } else {
            Trend::Stagnant
        };

        let resolved = self
            .store
            .hypotheses_resolved_between(recent.start, recent.end)
            .await?;
        let validated = resolved
            .iter()
            .filter(|h| h.status == HypothesisStatus::Validated)
            .count();
        let rejected = resolved
            .iter()
            .filter(|h| h.status == HypothesisStatus::Rejected)
            .count();

        let relationship_accuracy = self.relationship_accuracy(recent.start, recent.end).await?;

        let rules = self.store.all_rules().await?;
        let counts = RuleCounts {
            active: rules.iter().filter(|r| r.is_active()).count(),
            deprecated: rules.iter().filter(|r| !r.is_active()).count(),
            created_recently: rules
                .iter()
                .filter(|r| r.created_at >= recent.start && r.created_at < recent.end)
                .count(),
        };

        debug!(
            accuracy = recent.accuracy,
            trend = trend.as_str(),
            active_rules = counts.active,
            "Performance snapshot taken"
        );

        Ok(PerformanceSnapshot {
            taken_at: now,
            oldest,
            middle,
            recent,
            trend,
            explorations_validated: validated,
            explorations_rejected: rejected,
            exploration_success_rate: ratio(validated, validated + rejected),
            relationship_accuracy,
            rules: counts,
        })
    }

    pub fn weak_areas(&self, snapshot: &PerformanceSnapshot) -> Vec<WeakArea> {
        weak_areas(snapshot, &self.config)
    }

    /// Deprecate every active rule that is failing or has never been used.
    /// Returns the rules deprecated by this call.
    pub async fn deprecate_rules(&self, now: DateTime<Utc>) -> Result<Vec<Rule>, StoreError> {
        let mut deprecated = Vec::new();
        for rule in self.store.get_active_rules().await? {
            let Some(reason) = deprecation_reason(&rule, &self.config, now) else {
                continue;
            };
            if let Some(next) = self.store.deprecate_rule(rule.id, &reason, now).await? {
                info!(rule_id = %next.id, reason = %reason, "Rule deprecated");
                deprecated.push(next);
            }
        }
        Ok(deprecated)
    }

    /// Snapshot, weak areas and report in one call.
    pub async fn improvement_report(&self, now: DateTime<Utc>) -> Result<String, StoreError> {
        let snapshot = self.snapshot(now).await?;
        let weak = self.weak_areas(&snapshot);
        Ok(render_report(&snapshot, &weak))
    }
}
