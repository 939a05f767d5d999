//! Learning scheduler: runs the synthesize → monitor → optimize cycle on a
//! timer and records each cycle.
//!
//! One cycle at a time. A failed or panicking cycle is logged and retried
//! after the backoff; the loop only stops when its shutdown flag is set.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{PolicyConfig, SchedulerConfig};
use crate::error::PolicyError;
use crate::policy::monitor::{PerformanceMonitor, PerformanceSnapshot, WeakArea, render_report};
use crate::policy::synthesizer::StrategySynthesizer;
use crate::policy::weights::{OptimizationOutcome, WeightOptimizer};
use crate::proposer::StrategyProposer;
use crate::store::PolicyStore;

/// Persisted summary of one learning cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningCycle {
    pub id: Uuid,
    pub iteration: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rules_created: Vec<Uuid>,
    pub rules_deprecated: Vec<Uuid>,
    /// New weight version, when the optimizer bumped one.
    #[serde(default)]
    pub weights_version: Option<u64>,
    pub performance: PerformanceSnapshot,
    pub weak_areas: Vec<WeakArea>,
    pub report: String,
}

pub struct LearningScheduler {
    store: PolicyStore,
    synthesizer: StrategySynthesizer,
    monitor: PerformanceMonitor,
    optimizer: WeightOptimizer,
    config: SchedulerConfig,
    cycle_lock: Mutex<()>,
}

impl LearningScheduler {
    pub fn new(
        store: PolicyStore,
        proposer: Arc<dyn StrategyProposer>,
        policy: &PolicyConfig,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            synthesizer: StrategySynthesizer::new(
                store.clone(),
                proposer,
                policy.synthesis.clone(),
            ),
            monitor: PerformanceMonitor::new(store.clone(), policy.monitor.clone()),
            optimizer: WeightOptimizer::new(store.clone(), policy.weights.clone()),
            store,
            config,
            cycle_lock: Mutex::new(()),
        }
    }

    /// Run one full cycle. Fails with `CycleInProgress` if another cycle
    /// holds the lock.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<LearningCycle, PolicyError> {
        let _guard = self
            .cycle_lock
            .try_lock()
            .map_err(|_| PolicyError::CycleInProgress)?;

        let iteration = self
            .store
            .cycles()
            .await?
            .last()
            .map(|c| c.iteration)
            .unwrap_or(0)
            + 1;
        info!(iteration, "Learning cycle started");

        let synthesis = self.synthesizer.run(now).await?;
        let deprecated = self.monitor.deprecate_rules(now).await?;
        let snapshot = self.monitor.snapshot(now).await?;
        let weak_areas = self.monitor.weak_areas(&snapshot);
        for area in &weak_areas {
            info!(area = %area, "Weak area");
        }

        let weights_version = if snapshot.recent.accuracy < self.config.optimize_below_accuracy {
            match self.optimizer.optimize(now).await? {
                OptimizationOutcome::Bumped { weights, .. } => Some(weights.version),
                _ => None,
            }
        } else {
            None
        };

        let cycle = LearningCycle {
            id: Uuid::new_v4(),
            iteration,
            started_at: now,
            finished_at: Utc::now(),
            rules_created: synthesis.created.iter().map(|r| r.id).collect(),
            rules_deprecated: deprecated.iter().map(|r| r.id).collect(),
            weights_version,
            report: render_report(&snapshot, &weak_areas),
            performance: snapshot,
            weak_areas,
        };
        self.store.insert_cycle(&cycle).await?;

        info!(
            iteration,
            rules_created = cycle.rules_created.len(),
            rules_deprecated = cycle.rules_deprecated.len(),
            weights_version = ?cycle.weights_version,
            accuracy = cycle.performance.recent.accuracy,
            "Learning cycle finished"
        );
        Ok(cycle)
    }
}

/// Run a cycle on its own task so a panic cannot take the loop down.
/// Returns how long to sleep before the next one.
async fn run_isolated(scheduler: &Arc<LearningScheduler>) -> Duration {
    let this = Arc::clone(scheduler);
    let config = &scheduler.config;
    match tokio::spawn(async move { this.run_cycle(Utc::now()).await }).await {
        Ok(Ok(_)) => config.interval,
        Ok(Err(PolicyError::CycleInProgress)) => {
            warn!("Learning cycle skipped, another cycle is running");
            config.failure_backoff
        }
        Ok(Err(e)) => {
            error!(error = %e, "Learning cycle failed");
            config.failure_backoff
        }
        Err(join_err) => {
            let e = PolicyError::CyclePanicked(join_err.to_string());
            error!(error = %e, "Learning cycle aborted");
            config.failure_backoff
        }
    }
}

/// Spawn the background learning loop. The first cycle runs immediately.
///
/// Returns a `JoinHandle` and shutdown flag.
pub fn spawn_learning_loop(scheduler: Arc<LearningScheduler>) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            interval_secs = scheduler.config.interval.as_secs(),
            "Learning loop started"
        );
        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Learning loop shutting down");
                return;
            }
            let pause = run_isolated(&scheduler).await;
            tokio::time::sleep(pause).await;
        }
    });

    (handle, shutdown_flag)
}
