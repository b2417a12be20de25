use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::reconciliation::InstanceReconciler;

/// job-watch-dog: drops records whose VM was destroyed outside the orchestrator.
pub async fn run(reconciler: InstanceReconciler, every: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::info!("🐶 job-watch-dog started (every {:?})", every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("🐶 job-watch-dog stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        match reconciler.sweep_orphans().await {
            Ok(count) if count > 0 => {
                tracing::info!("🐶 job-watch-dog: {} orphan record(s) removed", count)
            }
            Ok(_) => {}
            Err(e) => tracing::error!("❌ job-watch-dog error: {}", e),
        }
    }
}
