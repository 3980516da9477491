use crate::engine::Clock;
use crate::orchestration::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Spawn the periodic maintenance sweep. Returns `None` when disabled.
pub fn spawn_sweep(
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
    interval_secs: u64,
) -> Option<JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!("maintenance sweep disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match orchestrator.run_sweep(clock.now()).await {
                Ok(report) => tracing::debug!(?report, "sweep finished"),
                Err(e) => tracing::warn!(error = %e, "sweep failed"),
            }
        }
    }))
}
