use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pvecloud_common::{CloudError, Result};
use pvecloud_providers::Hypervisor;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::supervisor;

/// How often to re-poll a task and for how long before giving up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    pub interval: Duration,
    pub max_wait: Duration,
}

impl WaitPolicy {
    /// Clone completion: configuration cannot start before the disk copy ends.
    pub fn clone_default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(600),
        }
    }

    /// Background completion callbacks (reboot).
    pub fn callback_default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            max_wait: Duration::from_secs(300),
        }
    }
}

/// Tracks completion of hypervisor tasks through the cluster task registry.
#[derive(Clone)]
pub struct TaskWaiter {
    hypervisor: Arc<dyn Hypervisor>,
    cancel: CancellationToken,
}

impl TaskWaiter {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, cancel: CancellationToken) -> Self {
        Self { hypervisor, cancel }
    }

    /// One round trip. `true` only once the task is listed with the success token;
    /// a missing entry or any other status means "not yet".
    pub async fn poll(&self, task_id: &str) -> Result<bool> {
        let tasks = self.hypervisor.list_tasks().await?;
        Ok(tasks
            .iter()
            .find(|t| t.upid == task_id)
            .map(|t| t.succeeded())
            .unwrap_or(false))
    }

    /// Suspends the caller until the task succeeds, the policy runs out
    /// (`TaskTimeout`) or the waiter is cancelled (`Cancelled`).
    pub async fn wait(&self, task_id: &str, policy: WaitPolicy) -> Result<()> {
        let started = Instant::now();
        let mut polls: u32 = 0;
        loop {
            polls += 1;
            if self.poll(task_id).await? {
                tracing::debug!(
                    "[TaskWaiter] task {} completed after {} poll(s)",
                    task_id,
                    polls
                );
                return Ok(());
            }
            if started.elapsed() >= policy.max_wait {
                return Err(CloudError::TaskTimeout {
                    task_id: task_id.to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CloudError::Cancelled),
                _ = sleep(policy.interval) => {}
            }
        }
    }

    /// Fire-and-forget: polls in a supervised background task and hands the
    /// outcome to `action` once the task succeeds or the policy runs out.
    /// Poll errors are logged and retried.
    pub fn on_complete<F, Fut>(
        &self,
        task_id: String,
        policy: WaitPolicy,
        action: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let waiter = self.clone();
        let label = format!("task callback {}", task_id);
        supervisor::spawn(label, self.cancel.child_token(), async move {
            let outcome = waiter.settle(&task_id, policy).await;
            action(outcome).await
        })
    }

    async fn settle(&self, task_id: &str, policy: WaitPolicy) -> Result<()> {
        let started = Instant::now();
        loop {
            match self.poll(task_id).await {
                Ok(true) => {
                    tracing::debug!("[TaskWaiter] task {} completed", task_id);
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("⚠️ [TaskWaiter] polling task {} failed: {}", task_id, e);
                }
            }
            if started.elapsed() >= policy.max_wait {
                return Err(CloudError::TaskTimeout {
                    task_id: task_id.to_string(),
                    waited: started.elapsed(),
                });
            }
            sleep(policy.interval).await;
        }
    }
}
