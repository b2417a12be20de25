use std::future::Future;

use pvecloud_common::{CloudError, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs background work detached from any request. The outcome is only
/// logged: an error or a panic inside `fut` never reaches the caller and never
/// takes the process down. Cancelling `cancel` stops the work at its next await.
pub fn spawn<F>(label: impl Into<String>, cancel: CancellationToken, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let label = label.into();
    let work = tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => Err(CloudError::Cancelled),
            res = fut => res,
        }
    });

    tokio::spawn(async move {
        match work.await {
            Ok(Ok(())) => tracing::debug!("[Supervisor] {} finished", label),
            Ok(Err(CloudError::Cancelled)) => tracing::info!("[Supervisor] {} cancelled", label),
            Ok(Err(e)) => tracing::error!("❌ [Supervisor] {} failed: {}", label, e),
            Err(e) if e.is_panic() => tracing::error!("❌ [Supervisor] {} panicked", label),
            Err(e) => tracing::warn!("⚠️ [Supervisor] {} aborted: {}", label, e),
        }
    })
}
