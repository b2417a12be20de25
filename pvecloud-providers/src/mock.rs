use crate::inventory::{
    FirewallRule, IpAddress, NetworkInterface, NewFirewallRule, NodeStatus, Resource, TaskEntry,
    VmConfig,
};
use crate::{Hypervisor, HypervisorError, Result, TaskId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

/// In-memory hypervisor for tests and local runs.
///
/// Tasks complete after a configurable number of `list_tasks` calls; every
/// trait call is appended to a call log (`"start 101"`, `"clone 9000->101"`...).
pub struct MockHypervisor {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    nodes: Vec<NodeStatus>,
    vms: Vec<Resource>,
    tasks: Vec<TaskEntry>,
    /// Remaining `list_tasks` calls before a task reports OK.
    pending: HashMap<String, u32>,
    task_polls: u32,
    next_id: u32,
    task_seq: u32,
    firewall: HashMap<String, Vec<FirewallRule>>,
    interfaces: HashMap<String, Vec<NetworkInterface>>,
    groups: Vec<String>,
    configs: HashMap<String, VmConfig>,
    failing: HashSet<String>,
    calls: Vec<String>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                next_id: 100,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not poison every other assertion.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_node(&self, node: &str, maxcpu: f64, cpu: f64, maxmem: u64, mem: u64) {
        self.lock().nodes.push(NodeStatus {
            node: node.to_string(),
            status: Some("online".to_string()),
            cpu,
            maxcpu,
            mem,
            maxmem,
        });
    }

    pub fn add_template(&self, vmid: u32, node: &str, name: &str, size: u64) {
        self.lock().vms.push(Resource {
            id: format!("qemu/{}", vmid),
            vmid,
            node: node.to_string(),
            name: Some(name.to_string()),
            status: "stopped".to_string(),
            maxdisk: size,
            template: 1,
            ..Default::default()
        });
    }

    pub fn add_vm(&self, vmid: u32, node: &str, name: &str, status: &str) {
        self.lock().vms.push(Resource {
            id: format!("qemu/{}", vmid),
            vmid,
            node: node.to_string(),
            name: Some(name.to_string()),
            status: status.to_string(),
            ..Default::default()
        });
    }

    pub fn remove_vm(&self, vmid: &str) {
        self.lock().vms.retain(|r| r.vmid_str() != vmid);
    }

    pub fn set_vm_status(&self, vmid: &str, status: &str) {
        let mut st = self.lock();
        if let Some(vm) = st.vms.iter_mut().find(|r| r.vmid_str() == vmid) {
            vm.status = status.to_string();
        }
    }

    pub fn vm(&self, vmid: &str) -> Option<Resource> {
        self.lock().vms.iter().find(|r| r.vmid_str() == vmid).cloned()
    }

    pub fn set_next_id(&self, id: u32) {
        self.lock().next_id = id;
    }

    /// Number of `list_tasks` calls a new task needs before it reports OK.
    pub fn set_task_polls(&self, polls: u32) {
        self.lock().task_polls = polls;
    }

    /// New tasks never reach a terminal state.
    pub fn hang_tasks(&self) {
        self.lock().task_polls = u32::MAX;
    }

    /// Reports an IPv4 address on the second interface, the way a booted guest agent does.
    pub fn set_guest_address(&self, vmid: &str, address: &str) {
        let interfaces = vec![
            NetworkInterface {
                name: "lo".to_string(),
                ip_addresses: vec![IpAddress {
                    ip_address: "127.0.0.1".to_string(),
                    ip_address_type: "ipv4".to_string(),
                    prefix: Some(8),
                }],
            },
            NetworkInterface {
                name: "eth0".to_string(),
                ip_addresses: vec![
                    IpAddress {
                        ip_address: "fe80::be24:11ff:fe00:1".to_string(),
                        ip_address_type: "ipv6".to_string(),
                        prefix: Some(64),
                    },
                    IpAddress {
                        ip_address: address.to_string(),
                        ip_address_type: "ipv4".to_string(),
                        prefix: Some(24),
                    },
                ],
            },
        ];
        self.lock().interfaces.insert(vmid.to_string(), interfaces);
    }

    pub fn add_group_rule(&self, vmid: &str, group: &str) {
        let mut st = self.lock();
        let rules = st.firewall.entry(vmid.to_string()).or_default();
        let pos = rules.len() as u32;
        rules.push(FirewallRule {
            pos,
            rule_type: FirewallRule::GROUP.to_string(),
            action: group.to_string(),
            comment: None,
        });
    }

    pub fn add_cluster_group(&self, group: &str) {
        self.lock().groups.push(group.to_string());
    }

    /// Make every call of the given operation ("start", "firewall_rules", ...) fail with a 500.
    pub fn fail_on(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn recover(&self, op: &str) {
        self.lock().failing.remove(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, op: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(op))
            .count()
    }

    pub fn config_of(&self, vmid: &str) -> Option<VmConfig> {
        self.lock().configs.get(vmid).cloned()
    }

    pub fn group_rules(&self, vmid: &str) -> Vec<String> {
        self.lock()
            .firewall
            .get(vmid)
            .map(|rules| rules.iter().map(|r| r.action.clone()).collect())
            .unwrap_or_default()
    }

    /// Records the call and fails it when the operation is switched to failing.
    fn enter(st: &mut MockState, op: &str, detail: &str) -> Result<()> {
        st.calls.push(if detail.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, detail)
        });
        if st.failing.contains(op) {
            return Err(HypervisorError::Status {
                status: 500,
                body: format!("mock failure on {}", op),
            });
        }
        Ok(())
    }

    fn new_task(st: &mut MockState, node: &str, kind: &str, vmid: &str) -> TaskId {
        st.task_seq += 1;
        let upid = format!("UPID:{}:{:08X}:{}:{}:root@pam:", node, st.task_seq, kind, vmid);
        st.tasks.push(TaskEntry {
            upid: upid.clone(),
            node: Some(node.to_string()),
            task_type: Some(kind.to_string()),
            status: None,
        });
        st.pending.insert(upid.clone(), st.task_polls);
        upid
    }

    fn require_vm(st: &MockState, vmid: &str) -> Result<()> {
        if st.vms.iter().any(|r| r.vmid_str() == vmid) {
            Ok(())
        } else {
            Err(HypervisorError::Status {
                status: 500,
                body: format!("Configuration file 'nodes/qemu-server/{}.conf' does not exist", vmid),
            })
        }
    }

    fn power(&self, op: &str, node: &str, vmid: &str, status: Option<&str>) -> Result<TaskId> {
        let mut st = self.lock();
        Self::enter(&mut st, op, vmid)?;
        Self::require_vm(&st, vmid)?;
        if let Some(status) = status {
            if let Some(vm) = st.vms.iter_mut().find(|r| r.vmid_str() == vmid) {
                vm.status = status.to_string();
            }
        }
        Ok(Self::new_task(&mut st, node, &format!("qm{}", op), vmid))
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn list_vms(&self) -> Result<Vec<Resource>> {
        let mut st = self.lock();
        Self::enter(&mut st, "list_vms", "")?;
        Ok(st.vms.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeStatus>> {
        let mut st = self.lock();
        Self::enter(&mut st, "list_nodes", "")?;
        Ok(st.nodes.clone())
    }

    async fn list_tasks(&self) -> Result<Vec<TaskEntry>> {
        let mut st = self.lock();
        Self::enter(&mut st, "list_tasks", "")?;
        let MockState { tasks, pending, .. } = &mut *st;
        for task in tasks.iter_mut().filter(|t| t.status.is_none()) {
            match pending.get_mut(&task.upid) {
                Some(n) if *n == u32::MAX => {}
                Some(n) if *n > 0 => *n -= 1,
                _ => task.status = Some(TaskEntry::SUCCESS.to_string()),
            }
        }
        Ok(st.tasks.clone())
    }

    async fn next_id(&self) -> Result<String> {
        let mut st = self.lock();
        Self::enter(&mut st, "next_id", "")?;
        let id = st.next_id;
        st.next_id += 1;
        Ok(id.to_string())
    }

    async fn clone_vm(
        &self,
        template_node: &str,
        template_vmid: &str,
        new_id: &str,
        name: &str,
        target_node: &str,
    ) -> Result<TaskId> {
        let mut st = self.lock();
        Self::enter(&mut st, "clone", &format!("{}->{}", template_vmid, new_id))?;
        Self::require_vm(&st, template_vmid)?;
        let vmid: u32 = new_id
            .parse()
            .map_err(|_| HypervisorError::Status {
                status: 400,
                body: format!("invalid newid {}", new_id),
            })?;
        // The clone target is listed (stopped, locked) while the copy runs.
        st.vms.push(Resource {
            id: format!("qemu/{}", vmid),
            vmid,
            node: target_node.to_string(),
            name: Some(name.to_string()),
            status: "stopped".to_string(),
            ..Default::default()
        });
        Ok(Self::new_task(&mut st, template_node, "qmclone", template_vmid))
    }

    async fn configure_vm(&self, _node: &str, vmid: &str, config: &VmConfig) -> Result<()> {
        let mut st = self.lock();
        Self::enter(&mut st, "configure", vmid)?;
        Self::require_vm(&st, vmid)?;
        st.configs.insert(vmid.to_string(), config.clone());
        Ok(())
    }

    async fn start_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.power("start", node, vmid, Some("running"))
    }

    async fn stop_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.power("stop", node, vmid, Some("stopped"))
    }

    async fn shutdown_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.power("shutdown", node, vmid, Some("stopped"))
    }

    async fn reboot_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        self.power("reboot", node, vmid, None)
    }

    async fn delete_vm(&self, node: &str, vmid: &str) -> Result<TaskId> {
        let mut st = self.lock();
        Self::enter(&mut st, "delete", vmid)?;
        Self::require_vm(&st, vmid)?;
        st.vms.retain(|r| r.vmid_str() != vmid);
        st.firewall.remove(vmid);
        Ok(Self::new_task(&mut st, node, "qmdestroy", vmid))
    }

    async fn firewall_rules(&self, _node: &str, vmid: &str) -> Result<Vec<FirewallRule>> {
        let mut st = self.lock();
        Self::enter(&mut st, "firewall_rules", vmid)?;
        Ok(st.firewall.get(vmid).cloned().unwrap_or_default())
    }

    async fn add_firewall_rule(
        &self,
        _node: &str,
        vmid: &str,
        rule: &NewFirewallRule,
    ) -> Result<()> {
        let mut st = self.lock();
        Self::enter(&mut st, "add_rule", &format!("{} {}", vmid, rule.action))?;
        let rules = st.firewall.entry(vmid.to_string()).or_default();
        let pos = rules.len() as u32;
        rules.push(FirewallRule {
            pos,
            rule_type: rule.rule_type.clone(),
            action: rule.action.clone(),
            comment: rule.comment.clone(),
        });
        Ok(())
    }

    async fn delete_firewall_rule(&self, _node: &str, vmid: &str, pos: u32) -> Result<()> {
        let mut st = self.lock();
        Self::enter(&mut st, "delete_rule", &format!("{} {}", vmid, pos))?;
        let rules = st.firewall.entry(vmid.to_string()).or_default();
        let before = rules.len();
        rules.retain(|r| r.pos != pos);
        if rules.len() == before {
            return Err(HypervisorError::Status {
                status: 400,
                body: format!("no rule at position {}", pos),
            });
        }
        for (i, r) in rules.iter_mut().enumerate() {
            r.pos = i as u32;
        }
        Ok(())
    }

    async fn network_interfaces(&self, _node: &str, vmid: &str) -> Result<Vec<NetworkInterface>> {
        let mut st = self.lock();
        Self::enter(&mut st, "network_interfaces", vmid)?;
        st.interfaces
            .get(vmid)
            .cloned()
            .ok_or_else(|| HypervisorError::Status {
                status: 500,
                body: "QEMU guest agent is not running".to_string(),
            })
    }

    async fn firewall_groups(&self) -> Result<Vec<String>> {
        let mut st = self.lock();
        Self::enter(&mut st, "firewall_groups", "")?;
        Ok(st.groups.clone())
    }
}
