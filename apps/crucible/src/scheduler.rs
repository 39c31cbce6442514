//! # Promotion Sweep Scheduler
//!
//! Runs `Pipeline::promote_ready` on a fixed interval until cancelled.
//! Each pass executes on tokio's blocking pool because the store is
//! synchronous. A failed pass is logged and retried on the next tick.

use crate::config::SweepConfig;
use crucible_core::{Pipeline, SweepReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Start the sweep loop. Cancelling `cancel` stops it after the current pass.
pub fn spawn_sweep(
    pipeline: Arc<Pipeline>,
    config: &SweepConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = config.interval().max(Duration::from_secs(1));
    let startup_delay = config.startup_delay();

    tokio::spawn(async move {
        info!(
            "promotion sweep started (interval={interval:?}, startup_delay={startup_delay:?}, grace={}s)",
            pipeline.grace().num_seconds()
        );

        tokio::select! {
            () = cancel.cancelled() => {
                info!("promotion sweep stopped before first pass");
                return;
            }
            () = tokio::time::sleep(startup_delay) => {}
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("promotion sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(report) = run_pass(Arc::clone(&pipeline)).await {
                        debug!(
                            examined = report.examined,
                            promoted = report.promoted.len(),
                            "sweep pass complete"
                        );
                    }
                }
            }
        }
    })
}

/// One pass on the blocking pool. `None` when the pass itself failed.
pub async fn run_pass(pipeline: Arc<Pipeline>) -> Option<SweepReport> {
    match tokio::task::spawn_blocking(move || pipeline.promote_ready()).await {
        Ok(Ok(report)) => Some(report),
        Ok(Err(e)) => {
            error!(error = %e, "promotion sweep pass failed");
            None
        }
        Err(e) => {
            error!(error = %e, "promotion sweep task panicked");
            None
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crucible_core::Store;

    #[tokio::test]
    async fn cancelled_sweep_exits() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(Pipeline::new(Store::open(dir.path().join("s.redb")).unwrap()));
        let cancel = CancellationToken::new();
        let config = SweepConfig {
            interval_secs: 1,
            grace_secs: 0,
            startup_delay_secs: 0,
        };
        let handle = spawn_sweep(pipeline, &config, cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn empty_floor_pass_reports_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Arc::new(Pipeline::new(Store::open(dir.path().join("s.redb")).unwrap()));
        let report = run_pass(pipeline).await.unwrap();
        assert_eq!(report, SweepReport::default());
    }
}
