use crate::runs::{RunCoordinator, RunError, RunTrigger};
use crate::source::SellerScope;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Triggers a scheduled run every `every`. A tick that finds a run in progress is skipped.
pub fn spawn(
    coordinator: RunCoordinator,
    every: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick fires immediately; runs start one interval after boot
        ticker.tick().await;
        info!(target = "catalog.scheduler", every_secs = every.as_secs(), "scheduler_started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(target = "catalog.scheduler", "scheduler_stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match coordinator.start(RunTrigger::Scheduled, SellerScope::All).await {
                        Ok(run_id) => info!(target = "catalog.scheduler", run_id = %run_id, "scheduled_run_started"),
                        Err(RunError::AlreadyRunning(active)) => {
                            info!(target = "catalog.scheduler", active = %active, "scheduled_run_skipped");
                        }
                    }
                }
            }
        }
    })
}
