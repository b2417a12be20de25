use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use pvecloud_common::{CloudError, CloudInstanceState, Instance, InstanceRecord, Result};
use pvecloud_providers::{FirewallRule, Hypervisor, NetworkInterface, Resource};

use crate::state_machine;
use crate::store::RecordStore;

/// Merges the persisted instance view with the hypervisor's live state.
///
/// The hypervisor is authoritative for running/stopped, the record store for
/// the workflow phase and ownership. Every read of an instance goes through here.
#[derive(Clone)]
pub struct InstanceReconciler {
    hypervisor: Arc<dyn Hypervisor>,
    store: Arc<dyn RecordStore>,
}

impl InstanceReconciler {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, store: Arc<dyn RecordStore>) -> Self {
        Self { hypervisor, store }
    }

    /// Live resource of an instance. A record whose VM has disappeared is an
    /// orphan and is removed before failing with `NotFound`. BUILDING records
    /// are kept: their clone may not have been requested yet.
    pub async fn live_resource(&self, id: &str) -> Result<Resource> {
        let vms = self.hypervisor.list_vms().await?;
        if let Some(vm) = vms
            .into_iter()
            .find(|r| !r.is_template() && r.vmid_str() == id)
        {
            return Ok(vm);
        }

        match self.store.get_instance(id).await? {
            Some(record) if record.status == CloudInstanceState::Building => {
                tracing::debug!(
                    "[Reconciliation] vm {} not on the cluster yet, BUILDING record kept",
                    id
                );
            }
            Some(_) => {
                if self.store.delete_instance(id).await? {
                    tracing::warn!(
                        "⚠️ [Reconciliation] vm {} no longer exists on the cluster, record removed",
                        id
                    );
                }
            }
            None => {}
        }
        Err(CloudError::not_found("instance", id))
    }

    pub async fn resolve(&self, id: &str) -> Result<Instance> {
        let live = self.live_resource(id).await?;
        let record = self
            .store
            .get_instance(id)
            .await?
            .ok_or_else(|| CloudError::not_found("instance", id))?;
        self.reconcile(record, &live).await
    }

    /// Every owned instance. Live VMs without a record belong to someone else;
    /// records without a VM are left to the watch-dog.
    pub async fn resolve_all(&self) -> Result<Vec<Instance>> {
        let vms = self.hypervisor.list_vms().await?;
        let mut records: HashMap<String, InstanceRecord> = self
            .store
            .get_instances()
            .await?
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect();

        let owned: Vec<(InstanceRecord, Resource)> = vms
            .into_iter()
            .filter(|vm| !vm.is_template())
            .filter_map(|vm| records.remove(&vm.vmid_str()).map(|rec| (rec, vm)))
            .collect();

        join_all(
            owned
                .into_iter()
                .map(|(record, live)| async move { self.reconcile(record, &live).await }),
        )
        .await
        .into_iter()
        .collect()
    }

    /// Status correction plus best-effort enrichment. The store is written at
    /// most once, and only when the status actually changes.
    async fn reconcile(&self, record: InstanceRecord, live: &Resource) -> Result<Instance> {
        let id = record.id.as_str();
        let persisted = record.status;
        let mut status = state_machine::reconcile_with_live(persisted, live);

        let (address, groups) = tokio::join!(
            self.address(&live.node, id),
            self.security_groups(&live.node, id)
        );

        let reason = if address.is_empty() {
            "live status"
        } else {
            status = state_machine::promote_on_address(status);
            "guest agent reports an address"
        };
        state_machine::apply(self.store.as_ref(), id, persisted, status, reason).await?;

        let mut record = record;
        record.status = status;
        Ok(Instance::from_record(
            &record,
            live.name.as_deref(),
            address,
            groups,
        ))
    }

    /// First IPv4 of the guest's second interface, or "" when the agent is not
    /// answering yet.
    pub async fn address(&self, node: &str, id: &str) -> String {
        match self.hypervisor.network_interfaces(node, id).await {
            Ok(interfaces) => first_ipv4_on_second_interface(&interfaces).unwrap_or_default(),
            Err(e) => {
                tracing::debug!("[Reconciliation] no address for vm {}: {}", id, e);
                String::new()
            }
        }
    }

    /// Group names attached to the VM firewall; empty when the rules cannot be read.
    pub async fn security_groups(&self, node: &str, id: &str) -> Vec<String> {
        match self.hypervisor.firewall_rules(node, id).await {
            Ok(rules) => group_names(&rules),
            Err(e) => {
                tracing::warn!(
                    "⚠️ [Reconciliation] firewall rules of vm {} unavailable: {}",
                    id,
                    e
                );
                Vec::new()
            }
        }
    }

    /// Removes records whose VM no longer exists. BUILDING records are kept:
    /// they are written before their clone is requested.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        let live: HashSet<String> = self
            .hypervisor
            .list_vms()
            .await?
            .iter()
            .filter(|r| !r.is_template())
            .map(|r| r.vmid_str())
            .collect();

        let mut removed = 0;
        for record in self.store.get_instances().await? {
            if record.status == CloudInstanceState::Building || live.contains(&record.id) {
                continue;
            }
            if self.store.delete_instance(&record.id).await? {
                tracing::warn!(
                    "⚠️ [Reconciliation] vm {} ({}) vanished from the cluster, record removed",
                    record.id,
                    record.status
                );
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn group_names(rules: &[FirewallRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.is_group())
        .map(|r| r.action.clone())
        .collect()
}

/// The first interface reported by the agent is loopback.
pub fn first_ipv4_on_second_interface(interfaces: &[NetworkInterface]) -> Option<String> {
    interfaces
        .get(1)?
        .ip_addresses
        .iter()
        .find(|a| a.ip_address_type == "ipv4")
        .map(|a| a.ip_address.clone())
}
