use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use pvecloud_common::{
    CloudError, CloudInstanceState, Flavour, Image, Instance, InstanceRecord, Metrics, Result,
};
use pvecloud_providers::{Hypervisor, NewFirewallRule, Resource, VmConfig};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::locks::InstanceLocks;
use crate::metadata::{self, CloudInitPayload, MetadataService};
use crate::placement::NodeSelector;
use crate::reconciliation::{self, InstanceReconciler};
use crate::settings::{DEFAULT_INSTANCE_PREFIX, DEFAULT_MAX_START_RETRY, DEFAULT_SELECT_COEFF};
use crate::state_machine;
use crate::store::RecordStore;
use crate::supervisor;
use crate::task_waiter::{TaskWaiter, WaitPolicy};

const MIB: u64 = 1024 * 1024;
const GROUP_COMMENT: &str = "Security group from cloud provider";

/// Knobs of the instance lifecycle, extracted from `Settings`.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub select_coeff: f64,
    pub max_start_retry: i32,
    /// Base URL guests fetch their cloud-init documents from.
    pub metadata_server: String,
    pub project_id: Option<String>,
    pub instance_prefix: String,
    pub clone_wait: WaitPolicy,
    pub task_wait: WaitPolicy,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            select_coeff: DEFAULT_SELECT_COEFF,
            max_start_retry: DEFAULT_MAX_START_RETRY,
            metadata_server: String::new(),
            project_id: None,
            instance_prefix: DEFAULT_INSTANCE_PREFIX.to_string(),
            clone_wait: WaitPolicy::clone_default(),
            task_wait: WaitPolicy::callback_default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateInstance {
    pub name: String,
    pub image_id: String,
    pub flavour_id: String,
    pub security_groups: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub boot_command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// VM destroyed and record removed.
    Deleted,
    /// The VM was running: a hard stop was issued and nothing was deleted.
    /// A later `delete` finishes the job once the VM is stopped.
    Stopping,
}

/// Entry point for every instance operation.
#[derive(Clone)]
pub struct LifecycleOrchestrator {
    config: Arc<LifecycleConfig>,
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<dyn RecordStore>,
    metadata: Arc<dyn MetadataService>,
    selector: NodeSelector,
    waiter: TaskWaiter,
    reconciler: InstanceReconciler,
    locks: InstanceLocks,
    cancel: CancellationToken,
}

impl LifecycleOrchestrator {
    pub fn new(
        config: LifecycleConfig,
        hypervisor: Arc<dyn Hypervisor>,
        store: Arc<dyn RecordStore>,
        metadata: Arc<dyn MetadataService>,
    ) -> Self {
        let cancel = CancellationToken::new();
        Self {
            selector: NodeSelector::new(hypervisor.clone(), config.select_coeff),
            waiter: TaskWaiter::new(hypervisor.clone(), cancel.clone()),
            reconciler: InstanceReconciler::new(hypervisor.clone(), store.clone()),
            config: Arc::new(config),
            hypervisor,
            store,
            metadata,
            locks: InstanceLocks::new(),
            cancel,
        }
    }

    pub fn reconciler(&self) -> &InstanceReconciler {
        &self.reconciler
    }

    /// Cancels in-flight clone waits, completion callbacks and background starts.
    pub fn shutdown_background(&self) {
        tracing::info!("[Lifecycle] cancelling background work");
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    // --- reads ---

    pub async fn get(&self, id: &str) -> Result<Instance> {
        self.reconciler.resolve(id).await
    }

    pub async fn list(&self) -> Result<Vec<Instance>> {
        self.reconciler.resolve_all().await
    }

    pub async fn instance_identifiers(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .get_instances()
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    pub async fn images(&self) -> Result<Vec<Image>> {
        Ok(self
            .hypervisor
            .list_vms()
            .await?
            .iter()
            .filter(|r| r.is_template())
            .map(image_of)
            .collect())
    }

    pub async fn image(&self, id: &str) -> Result<Image> {
        self.template(id).await.map(|t| image_of(&t))
    }

    async fn template(&self, id: &str) -> Result<Resource> {
        self.hypervisor
            .list_vms()
            .await?
            .into_iter()
            .find(|r| r.is_template() && r.vmid_str() == id)
            .ok_or_else(|| CloudError::not_found("image", id))
    }

    pub async fn flavours(&self) -> Result<Vec<Flavour>> {
        self.store.get_flavours().await
    }

    pub async fn flavour(&self, id: &str) -> Result<Flavour> {
        self.store
            .get_flavour(id)
            .await?
            .ok_or_else(|| CloudError::not_found("flavour", id))
    }

    pub async fn create_flavour(&self, flavour: Flavour) -> Result<Flavour> {
        if flavour.id.trim().is_empty() {
            return Err(CloudError::Invalid("flavour id must not be empty".into()));
        }
        if flavour.cpus <= 0 || flavour.ram_mb <= 0 || flavour.disk_gb < 0 {
            return Err(CloudError::Invalid(format!(
                "flavour {} needs positive cpus and ram",
                flavour.id
            )));
        }
        self.store.create_flavour(&flavour).await?;
        tracing::info!(
            "[Lifecycle] flavour {} created ({} cpus, {} MiB)",
            flavour.id,
            flavour.cpus,
            flavour.ram_mb
        );
        Ok(flavour)
    }

    pub async fn delete_flavour(&self, id: &str) -> Result<()> {
        if !self.store.delete_flavour(id).await? {
            return Err(CloudError::not_found("flavour", id));
        }
        tracing::info!("[Lifecycle] flavour {} deleted", id);
        Ok(())
    }

    /// Cluster-level firewall groups an instance can join.
    pub async fn security_groups(&self) -> Result<Vec<String>> {
        Ok(self.hypervisor.firewall_groups().await?)
    }

    pub async fn instance_security_groups(&self, id: &str) -> Result<Vec<String>> {
        let live = self.reconciler.live_resource(id).await?;
        let rules = self.hypervisor.firewall_rules(&live.node, id).await?;
        Ok(reconciliation::group_names(&rules))
    }

    pub async fn metrics(&self) -> Result<Metrics> {
        let (nodes, vms) = tokio::try_join!(self.hypervisor.list_nodes(), self.hypervisor.list_vms())?;
        Ok(Metrics {
            max_total_ram_mb: nodes.iter().map(|n| n.maxmem).sum::<u64>() / MIB,
            max_total_cores: nodes.iter().map(|n| n.maxcpu.max(0.0) as u64).sum(),
            total_ram_used_mb: nodes.iter().map(|n| n.mem).sum::<u64>() / MIB,
            total_cores_used: nodes.iter().map(|n| n.cpu).sum(),
            total_instances_used: vms.iter().filter(|r| !r.is_template()).count(),
        })
    }

    // --- lifecycle ---

    /// Allocates, clones, configures and boots a new instance. Returns once the
    /// VM is configured; the first start runs in the background.
    pub async fn create(&self, req: CreateInstance) -> Result<String> {
        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("create_instance", %correlation_id, name = %req.name);
        self.create_inner(req).instrument(span).await
    }

    async fn create_inner(&self, req: CreateInstance) -> Result<String> {
        tracing::info!("[Lifecycle] creating instance {}", req.name);

        let flavour = self.flavour(&req.flavour_id).await?;
        let image = self.template(&req.image_id).await?;
        let node = self
            .selector
            .select(flavour.cpus, flavour.ram_bytes())
            .await?;
        let id = self.hypervisor.next_id().await?;

        // Built before anything is persisted so a bad payload leaves no record behind.
        let payload = CloudInitPayload::build(
            &id,
            &req.metadata,
            self.config.project_id.as_deref(),
            &req.boot_command,
            &self.config.instance_prefix,
        )?;

        let guard = self.locks.acquire(&id).await;
        // The allocated id is recorded before the clone so it is never lost.
        self.store
            .create_instance(&InstanceRecord {
                id: id.clone(),
                name: req.name.clone(),
                flavour_id: flavour.id.clone(),
                image_id: req.image_id.clone(),
                created_at: Utc::now(),
                metadata: metadata::record_metadata(&req.metadata)?,
                boot_command: req.boot_command.clone(),
                status: CloudInstanceState::Building,
                start_count: 0,
            })
            .await?;
        tracing::info!(
            "[Lifecycle] vm {} recorded as BUILDING, target node {}",
            id,
            node
        );

        self.register_metadata(id.clone(), payload);

        let task = self
            .hypervisor
            .clone_vm(&image.node, &req.image_id, &id, &req.name, &node)
            .await?;
        self.waiter.wait(&task, self.config.clone_wait).await?;
        tracing::info!("[Lifecycle] clone of vm {} finished", id);

        let config = VmConfig {
            agent: "enabled=1".to_string(),
            cores: flavour.cpus,
            memory: flavour.ram_mb,
            ostype: "l26".to_string(),
            bootdisk: "scsi0".to_string(),
            serial0: "socket".to_string(),
            smbios1: metadata::nocloud_smbios(&self.config.metadata_server, &id),
        };
        self.hypervisor.configure_vm(&node, &id, &config).await?;

        self.attach_groups(&node, &id, &req.security_groups).await;
        drop(guard);

        let this = self.clone();
        let start_id = id.clone();
        supervisor::spawn(
            format!("first start of vm {}", id),
            self.cancel.child_token(),
            async move { this.start(&start_id).await },
        );

        tracing::info!("✅ [Lifecycle] instance {} created", id);
        Ok(id)
    }

    fn register_metadata(&self, id: String, payload: CloudInitPayload) -> JoinHandle<()> {
        let service = self.metadata.clone();
        supervisor::spawn(
            format!("metadata registration of vm {}", id),
            self.cancel.child_token(),
            async move {
                if let Err(e) = service.register(&id, &payload).await {
                    tracing::warn!("⚠️ [Lifecycle] cannot register metadata of vm {}: {}", id, e);
                }
                Ok(())
            },
        )
    }

    fn unregister_metadata(&self, id: String) -> JoinHandle<()> {
        let service = self.metadata.clone();
        supervisor::spawn(
            format!("metadata deregistration of vm {}", id),
            self.cancel.child_token(),
            async move {
                if let Err(e) = service.unregister(&id).await {
                    tracing::warn!(
                        "⚠️ [Lifecycle] cannot unregister metadata of vm {}: {}",
                        id,
                        e
                    );
                }
                Ok(())
            },
        )
    }

    async fn attach_groups(&self, node: &str, id: &str, groups: &[String]) {
        let results = join_all(groups.iter().map(|group| async move {
            let rule = NewFirewallRule::group(group, Some(GROUP_COMMENT));
            (group, self.hypervisor.add_firewall_rule(node, id, &rule).await)
        }))
        .await;
        for (group, res) in results {
            if let Err(e) = res {
                tracing::warn!(
                    "⚠️ [Lifecycle] cannot attach security group {} to vm {}: {}",
                    group,
                    id,
                    e
                );
            }
        }
    }

    /// Boots an instance, spending one unit of its start budget.
    pub async fn start(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let live = self.reconciler.live_resource(id).await?;
        if self.store.get_instance(id).await?.is_none() {
            return Err(CloudError::not_found("instance", id));
        }

        let max = self.config.max_start_retry;
        let Some(attempt) = self.store.increment_start_count(id, max).await? else {
            tracing::error!(
                "❌ [Lifecycle] start of vm {} failed after {} retries",
                id,
                max
            );
            return Err(CloudError::StartRetryExceeded {
                id: id.to_string(),
                max,
            });
        };

        tracing::info!("[Lifecycle] starting vm {}: try number {}", id, attempt);
        self.hypervisor.start_vm(&live.node, id).await?;
        Ok(())
    }

    /// Clears a spent start budget.
    pub async fn reset_start_count(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        self.store.set_start_count(id, 0).await?;
        tracing::info!("[Lifecycle] start budget of vm {} reset", id);
        Ok(())
    }

    /// Graceful ACPI shutdown; the final state is observed by later reads.
    pub async fn shutdown(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let live = self.reconciler.live_resource(id).await?;
        self.mark_stopping(id, "shutdown requested").await?;
        self.hypervisor.shutdown_vm(&live.node, id).await?;
        Ok(())
    }

    /// Hard stop.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: &str) -> Result<()> {
        let live = self.reconciler.live_resource(id).await?;
        self.mark_stopping(id, "stop requested").await?;
        self.hypervisor.stop_vm(&live.node, id).await?;
        Ok(())
    }

    async fn mark_stopping(&self, id: &str, reason: &str) -> Result<()> {
        let record = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| CloudError::not_found("instance", id))?;
        state_machine::transition(
            self.store.as_ref(),
            id,
            record.status,
            CloudInstanceState::Stopping,
            reason,
        )
        .await
    }

    /// Reboots and restores ACTIVE once the hypervisor reports the task done.
    pub async fn reboot(&self, id: &str) -> Result<JoinHandle<()>> {
        let _guard = self.locks.acquire(id).await;
        let live = self.reconciler.live_resource(id).await?;
        let record = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| CloudError::not_found("instance", id))?;
        state_machine::transition(
            self.store.as_ref(),
            id,
            record.status,
            CloudInstanceState::Rebooting,
            "reboot requested",
        )
        .await?;

        let task = self.hypervisor.reboot_vm(&live.node, id).await?;
        let store = self.store.clone();
        let vm = id.to_string();
        Ok(self
            .waiter
            .on_complete(task, self.config.task_wait, move |outcome| async move {
                if let Err(e) = outcome {
                    tracing::error!(
                        "❌ [Lifecycle] reboot of vm {} did not complete ({}), record stays REBOOTING until an operator fixes it",
                        vm,
                        e
                    );
                    return Err(e);
                }
                state_machine::transition(
                    store.as_ref(),
                    &vm,
                    CloudInstanceState::Rebooting,
                    CloudInstanceState::Active,
                    "reboot completed",
                )
                .await
            }))
    }

    /// Destroys a stopped instance. A running one is only hard-stopped.
    /// A BUILDING record whose clone never produced a VM is dropped.
    pub async fn delete(&self, id: &str) -> Result<DeleteOutcome> {
        let _guard = self.locks.acquire(id).await;
        let live = match self.reconciler.live_resource(id).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                // Only BUILDING records survive a missing VM in live_resource.
                if !self.store.delete_instance(id).await? {
                    return Err(e);
                }
                self.unregister_metadata(id.to_string());
                tracing::info!("✅ [Lifecycle] unbuilt instance {} discarded", id);
                return Ok(DeleteOutcome::Deleted);
            }
            Err(e) => return Err(e),
        };

        if live.is_running() {
            tracing::info!(
                "[Lifecycle] vm {} is running, stopping it instead of deleting",
                id
            );
            self.stop_locked(id).await?;
            return Ok(DeleteOutcome::Stopping);
        }

        self.hypervisor.delete_vm(&live.node, id).await?;
        self.store.delete_instance(id).await?;
        self.unregister_metadata(id.to_string());
        tracing::info!("✅ [Lifecycle] instance {} deleted", id);
        Ok(DeleteOutcome::Deleted)
    }

    pub async fn add_security_group(&self, id: &str, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let live = self.reconciler.live_resource(id).await?;
        let rule = NewFirewallRule::group(name, Some(GROUP_COMMENT));
        self.hypervisor
            .add_firewall_rule(&live.node, id, &rule)
            .await?;
        tracing::info!("[Lifecycle] security group {} added to vm {}", name, id);
        Ok(())
    }

    pub async fn remove_security_group(&self, id: &str, name: &str) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        let live = self.reconciler.live_resource(id).await?;
        let rules = self.hypervisor.firewall_rules(&live.node, id).await?;
        let rule = rules
            .iter()
            .find(|r| r.is_group() && r.action == name)
            .ok_or_else(|| CloudError::not_found("security group", format!("{} on vm {}", name, id)))?;
        self.hypervisor
            .delete_firewall_rule(&live.node, id, rule.pos)
            .await?;
        tracing::info!("[Lifecycle] security group {} removed from vm {}", name, id);
        Ok(())
    }
}

fn image_of(template: &Resource) -> Image {
    Image {
        id: template.vmid_str(),
        name: template.name.clone().unwrap_or_default(),
        size: template.maxdisk,
    }
}
