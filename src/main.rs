use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use triage_policy::config::{PolicyConfig, SchedulerConfig};
use triage_policy::policy::monitor::PerformanceMonitor;
use triage_policy::policy::{LearningScheduler, spawn_learning_loop};
use triage_policy::proposer::{ProposerConfig, create_proposer};
use triage_policy::store::{LibSqlStore, PolicyStore};

/// Log to stderr, or to a daily file under `TRIAGE_POLICY_LOG_DIR` when set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match std::env::var("TRIAGE_POLICY_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "triage-policy.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _log_guard = init_tracing();

    let command = std::env::args().nth(1).unwrap_or_else(|| "run".to_string());
    if !matches!(command.as_str(), "run" | "cycle" | "report") {
        eprintln!("Unknown command '{command}'. Usage: triage-policy [run|cycle|report]");
        std::process::exit(2);
    }

    let db_path = std::env::var("TRIAGE_POLICY_DB_PATH")
        .unwrap_or_else(|_| "./data/triage-policy.db".to_string());
    let store = PolicyStore::new(Arc::new(LibSqlStore::new_local(Path::new(&db_path)).await?));
    let policy_config = PolicyConfig::default();

    eprintln!("Triage policy v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", db_path);

    if command == "report" {
        let monitor = PerformanceMonitor::new(store, policy_config.monitor.clone());
        println!("{}", monitor.improvement_report(Utc::now()).await?);
        return Ok(());
    }

    let proposer_config = ProposerConfig::from_env()?;
    eprintln!(
        "   LLM: {} ({})",
        proposer_config.model,
        proposer_config.backend.as_str()
    );
    let proposer = create_proposer(&proposer_config)?;

    let scheduler_config = SchedulerConfig::from_env();
    let scheduler = Arc::new(LearningScheduler::new(
        store,
        proposer,
        &policy_config,
        scheduler_config.clone(),
    ));

    if command == "cycle" {
        let cycle = scheduler.run_cycle(Utc::now()).await?;
        println!("{}", cycle.report);
        return Ok(());
    }

    eprintln!(
        "   Learning every {}s (Ctrl-C to stop)\n",
        scheduler_config.interval.as_secs()
    );
    let (mut handle, shutdown) = spawn_learning_loop(scheduler);
    let abort = handle.abort_handle();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Interrupt received");
            shutdown.store(true, Ordering::Relaxed);
            abort.abort();
        }
        result = &mut handle => {
            result?;
        }
    }

    Ok(())
}
