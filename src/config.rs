//! Configuration types.
//!
//! Every threshold the learning loop uses lives here so tests and deployments
//! can tune them without touching the algorithms.

use std::time::Duration;

/// Thresholds for the exploration controller.
#[derive(Debug, Clone)]
pub struct ExplorationConfig {
    /// Decisions below this confidence trigger low-confidence exploration.
    pub low_confidence_threshold: f64,
    pub low_confidence_rate: f64,
    /// Fewer prior decisions than this for a cluster key count as limited data.
    pub limited_data_threshold: usize,
    pub limited_data_rate: f64,
    /// Size of each of the two rolling windows compared for plateau detection.
    pub plateau_window: usize,
    /// Improvement between windows below this counts as a plateau.
    pub plateau_min_improvement: f64,
    /// How far back feedback is considered for plateau detection.
    pub plateau_lookback: chrono::Duration,
    pub plateau_rate: f64,
    /// Cluster keys seen fewer times than this are novel.
    pub novel_context_threshold: usize,
    pub novel_context_rate: f64,
    /// Exploration rate when no trigger fires.
    pub baseline_rate: f64,
    /// Confidence attached to every exploratory decision.
    pub exploration_confidence: f64,
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            low_confidence_threshold: 0.6,
            low_confidence_rate: 0.4,
            limited_data_threshold: 10,
            limited_data_rate: 0.3,
            plateau_window: 10,
            plateau_min_improvement: 0.02,
            plateau_lookback: chrono::Duration::days(7),
            plateau_rate: 0.5,
            novel_context_threshold: 5,
            novel_context_rate: 0.4,
            baseline_rate: 0.1,
            exploration_confidence: 0.5,
        }
    }
}

/// Settings for rule synthesis from validated hypotheses.
#[derive(Debug, Clone)]
pub struct SynthesisConfig {
    /// Minimum validated hypotheses sharing a cluster key.
    pub min_cluster_size: usize,
    /// Members whose confidence exceeds this count toward rule confidence.
    pub confidence_floor: f64,
    /// Context fields turned into `Equals` clauses when shared by all members.
    pub categorical_fields: Vec<String>,
    /// Context fields turned into `Range` clauses spanning the members.
    pub numeric_fields: Vec<String>,
    /// RFC 3339 context field used for `TimeWindow` clauses.
    pub timestamp_field: String,
    /// Members spread over more hours than this get no time window.
    pub max_time_window_hours: u32,
    /// Examples sent to the proposer per cluster.
    pub max_examples: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            min_cluster_size: 3,
            confidence_floor: 0.4,
            categorical_fields: vec!["relationship_type".into(), "sender_domain".into()],
            numeric_fields: vec!["importance_score".into()],
            timestamp_field: "timestamp".into(),
            max_time_window_hours: 6,
            max_examples: 10,
        }
    }
}

/// Thresholds for performance tracking and rule deprecation.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Width of each trailing window.
    pub window: chrono::Duration,
    /// Recent minus oldest accuracy above this means "improving".
    pub improving_delta: f64,
    pub accuracy_floor: f64,
    pub ask_rate_ceiling: f64,
    pub exploration_success_floor: f64,
    pub relationship_accuracy_floor: f64,
    /// Rules need this many uses before accuracy can deprecate them.
    pub min_uses_for_accuracy: u64,
    pub deprecation_accuracy: f64,
    /// Unused rules older than this are deprecated.
    pub unused_max_age: chrono::Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: chrono::Duration::days(7),
            improving_delta: 0.05,
            accuracy_floor: 0.7,
            ask_rate_ceiling: 0.3,
            exploration_success_floor: 0.3,
            relationship_accuracy_floor: 0.6,
            min_uses_for_accuracy: 10,
            deprecation_accuracy: 0.5,
            unused_max_age: chrono::Duration::days(30),
        }
    }
}

/// Settings for the signal-weight grid search.
#[derive(Debug, Clone)]
pub struct WeightConfig {
    /// Most recent decisions-with-feedback considered.
    pub sample_size: usize,
    /// Below this many samples the optimizer does nothing.
    pub min_samples: usize,
    /// Required accuracy gain before a new weight version is written.
    pub min_improvement: f64,
    /// Weighted score above this simulates "star", otherwise "archive".
    pub star_threshold: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            sample_size: 100,
            min_samples: 20,
            min_improvement: 0.02,
            star_threshold: 0.6,
        }
    }
}

/// All policy thresholds.
#[derive(Debug, Clone, Default)]
pub struct PolicyConfig {
    pub exploration: ExplorationConfig,
    pub synthesis: SynthesisConfig,
    pub monitor: MonitorConfig,
    pub weights: WeightConfig,
}

/// Learning scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between successful cycles.
    pub interval: Duration,
    /// Sleep after a failed cycle.
    pub failure_backoff: Duration,
    /// Weight optimization runs only while recent accuracy is below this.
    pub optimize_below_accuracy: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6 * 3600),
            failure_backoff: Duration::from_secs(600),
            optimize_below_accuracy: 0.8,
        }
    }
}

impl SchedulerConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let interval = std::env::var("TRIAGE_POLICY_INTERVAL_HOURS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|h| Duration::from_secs(h * 3600))
            .unwrap_or(defaults.interval);

        let failure_backoff = std::env::var("TRIAGE_POLICY_BACKOFF_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.failure_backoff);

        let optimize_below_accuracy = std::env::var("TRIAGE_POLICY_OPTIMIZE_BELOW")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|v| (0.0..=1.0).contains(v))
            .unwrap_or(defaults.optimize_below_accuracy);

        Self {
            interval,
            failure_backoff,
            optimize_below_accuracy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exploration_defaults_match_trigger_table() {
        let config = ExplorationConfig::default();
        assert_eq!(config.low_confidence_threshold, 0.6);
        assert_eq!(config.low_confidence_rate, 0.4);
        assert_eq!(config.limited_data_threshold, 10);
        assert_eq!(config.plateau_rate, 0.5);
        assert_eq!(config.novel_context_threshold, 5);
        assert_eq!(config.baseline_rate, 0.1);
    }

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.interval, Duration::from_secs(21_600));
        assert_eq!(config.failure_backoff, Duration::from_secs(600));
        assert_eq!(config.optimize_below_accuracy, 0.8);
    }

    #[test]
    fn scheduler_from_env_without_vars_uses_defaults() {
        // SAFETY: no other test reads these variables.
        unsafe {
            std::env::remove_var("TRIAGE_POLICY_INTERVAL_HOURS");
            std::env::remove_var("TRIAGE_POLICY_BACKOFF_SECS");
            std::env::remove_var("TRIAGE_POLICY_OPTIMIZE_BELOW");
        }
        let config = SchedulerConfig::from_env();
        assert_eq!(config.interval, SchedulerConfig::default().interval);
    }
}
