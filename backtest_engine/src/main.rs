use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use backtest_engine::config::EngineConfig;
use backtest_engine::driver::run_backtest;
use backtest_engine::task::{MessageLevel, TaskStore};

/// Backtesting worker: runs one task in an isolated process. Exit code 0 on
/// success; non-zero after a failure (the reason is already on the task's
/// control channel and results stream).
#[derive(Parser)]
#[command(name = "backtest_worker")]
struct Args {
    /// Id of the backtesting task to run.
    #[arg(long)]
    task_id: u64,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    if let Err(e) = run(args.task_id) {
        error!("Backtest worker failed: {e:#}");
        std::process::exit(1);
    }
}

fn run(task_id: u64) -> Result<()> {
    let cfg = EngineConfig::from_env()?;
    let store = TaskStore::new(&cfg.redis_url, &cfg.tasks_prefix)?;

    let mut task = store
        .load(task_id)?
        .ok_or_else(|| anyhow!("task {task_id} not found"))?;

    // Stamp this run: a fresh witness id plus the running flag. Any other
    // worker still looping on this task will see the mismatch and abort.
    let result_id = Uuid::new_v4().to_string();
    task.result_id = result_id.clone();
    task.is_running = true;
    store.save(&task).context("stamp task before run")?;
    info!("Task {} starting with result_id {}", task.id, result_id);

    let outcome = run_backtest(&cfg, &task, &result_id);

    // Clear the running flag unless someone else took the task over.
    match store.load(task_id) {
        Ok(Some(mut current)) if current.result_id == result_id => {
            current.is_running = false;
            if let Err(e) = store.save(&current) {
                error!("Failed to clear running flag: {e:#}");
            }
        }
        Ok(_) => {}
        Err(e) => error!("Failed to reload task after run: {e:#}"),
    }

    match outcome {
        Ok(()) => {
            info!("Task {} completed", task.id);
            Ok(())
        }
        Err(e) => {
            // Input errors detected before the loop started are only in the
            // log so far; make sure they reach the control channel too.
            let _ = store.send_message(task.id, MessageLevel::Error, &e.to_string());
            Err(e)
        }
    }
}
