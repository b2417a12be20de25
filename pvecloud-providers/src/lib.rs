use async_trait::async_trait;
use pvecloud_common::CloudError;
use thiserror::Error;

pub use inventory::{
    FirewallRule, IpAddress, NetworkInterface, NewFirewallRule, NodeStatus, Resource, TaskEntry,
    VmConfig,
};

/// Opaque identifier (Proxmox UPID) of an asynchronous hypervisor task.
pub type TaskId = String;

pub type Result<T> = std::result::Result<T, HypervisorError>;

#[derive(Debug, Error)]
pub enum HypervisorError {
    /// Connection refused, timeout, TLS failure...
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx answer from the hypervisor API.
    #[error("status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for HypervisorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            HypervisorError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            HypervisorError::Status {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            HypervisorError::Transport(e.to_string())
        }
    }
}

impl From<HypervisorError> for CloudError {
    fn from(e: HypervisorError) -> Self {
        match e {
            HypervisorError::Transport(msg) => CloudError::Transport(msg),
            HypervisorError::Status { status, body } => CloudError::RemoteStatus {
                status,
                message: body,
            },
            // The hypervisor answered with something unusable: a bad gateway, not a bad request.
            HypervisorError::Decode(msg) => CloudError::RemoteStatus {
                status: 502,
                message: msg,
            },
        }
    }
}

/// Remote virtualization platform. Every VM-scoped call needs the node the VM
/// currently lives on: VMs can be migrated by hand, so callers look the node up
/// from `list_vms` instead of remembering it.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// All qemu resources of the cluster, templates included.
    async fn list_vms(&self) -> Result<Vec<Resource>>;

    async fn list_nodes(&self) -> Result<Vec<NodeStatus>>;

    async fn list_tasks(&self) -> Result<Vec<TaskEntry>>;

    /// Next free vmid from the cluster allocator.
    async fn next_id(&self) -> Result<String>;

    async fn clone_vm(
        &self,
        template_node: &str,
        template_vmid: &str,
        new_id: &str,
        name: &str,
        target_node: &str,
    ) -> Result<TaskId>;

    async fn configure_vm(&self, node: &str, vmid: &str, config: &VmConfig) -> Result<()>;

    async fn start_vm(&self, node: &str, vmid: &str) -> Result<TaskId>;

    /// Hard stop.
    async fn stop_vm(&self, node: &str, vmid: &str) -> Result<TaskId>;

    /// Graceful ACPI shutdown.
    async fn shutdown_vm(&self, node: &str, vmid: &str) -> Result<TaskId>;

    async fn reboot_vm(&self, node: &str, vmid: &str) -> Result<TaskId>;

    async fn delete_vm(&self, node: &str, vmid: &str) -> Result<TaskId>;

    async fn firewall_rules(&self, node: &str, vmid: &str) -> Result<Vec<FirewallRule>>;

    async fn add_firewall_rule(&self, node: &str, vmid: &str, rule: &NewFirewallRule)
        -> Result<()>;

    async fn delete_firewall_rule(&self, node: &str, vmid: &str, pos: u32) -> Result<()>;

    /// Interfaces as reported by the qemu guest agent. Fails while the agent is down.
    async fn network_interfaces(&self, node: &str, vmid: &str) -> Result<Vec<NetworkInterface>>;

    /// Names of the security groups defined at cluster level.
    async fn firewall_groups(&self) -> Result<Vec<String>>;
}

pub mod inventory {
    use serde::{Deserialize, Serialize};

    /// Live projection of a VM or template (`cluster/resources?type=vm`).
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    pub struct Resource {
        /// "qemu/<vmid>"
        pub id: String,
        pub vmid: u32,
        pub node: String,
        #[serde(default)]
        pub name: Option<String>,
        #[serde(default)]
        pub status: String,
        #[serde(default)]
        pub cpu: f64,
        #[serde(default)]
        pub maxcpu: f64,
        #[serde(default)]
        pub mem: u64,
        #[serde(default)]
        pub maxmem: u64,
        #[serde(default)]
        pub maxdisk: u64,
        #[serde(default)]
        pub template: u8,
    }

    impl Resource {
        pub fn is_running(&self) -> bool {
            self.status == "running"
        }

        pub fn is_stopped(&self) -> bool {
            self.status == "stopped"
        }

        pub fn is_template(&self) -> bool {
            self.template == 1
        }

        pub fn vmid_str(&self) -> String {
            self.vmid.to_string()
        }
    }

    /// Node capacity figures (`nodes`). Offline nodes omit the numbers.
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    pub struct NodeStatus {
        pub node: String,
        #[serde(default)]
        pub status: Option<String>,
        #[serde(default)]
        pub cpu: f64,
        #[serde(default)]
        pub maxcpu: f64,
        #[serde(default)]
        pub mem: u64,
        #[serde(default)]
        pub maxmem: u64,
    }

    /// Entry of the cluster task registry (`cluster/tasks`).
    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    pub struct TaskEntry {
        pub upid: String,
        #[serde(default)]
        pub node: Option<String>,
        #[serde(default, rename = "type")]
        pub task_type: Option<String>,
        /// Absent while running, "OK" on success, error text otherwise.
        #[serde(default)]
        pub status: Option<String>,
    }

    impl TaskEntry {
        pub const SUCCESS: &'static str = "OK";

        pub fn succeeded(&self) -> bool {
            self.status.as_deref() == Some(Self::SUCCESS)
        }
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    pub struct FirewallRule {
        pub pos: u32,
        #[serde(rename = "type")]
        pub rule_type: String,
        pub action: String,
        #[serde(default)]
        pub comment: Option<String>,
    }

    impl FirewallRule {
        pub const GROUP: &'static str = "group";

        pub fn is_group(&self) -> bool {
            self.rule_type == Self::GROUP
        }
    }

    #[derive(Clone, Debug, Serialize, PartialEq)]
    pub struct NewFirewallRule {
        #[serde(rename = "type")]
        pub rule_type: String,
        pub action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub comment: Option<String>,
    }

    impl NewFirewallRule {
        pub fn group(name: &str, comment: Option<&str>) -> Self {
            Self {
                rule_type: FirewallRule::GROUP.to_string(),
                action: name.to_string(),
                comment: comment.map(str::to_string),
            }
        }
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    pub struct NetworkInterface {
        pub name: String,
        #[serde(default, rename = "ip-addresses")]
        pub ip_addresses: Vec<IpAddress>,
    }

    #[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
    pub struct IpAddress {
        #[serde(rename = "ip-address")]
        pub ip_address: String,
        #[serde(rename = "ip-address-type")]
        pub ip_address_type: String,
        #[serde(default)]
        pub prefix: Option<u8>,
    }

    /// Body of `nodes/{node}/qemu/{vmid}/config`.
    #[derive(Clone, Debug, Serialize, PartialEq)]
    pub struct VmConfig {
        pub agent: String,
        pub cores: i32,
        /// MiB
        pub memory: i32,
        pub ostype: String,
        pub bootdisk: String,
        pub serial0: String,
        pub smbios1: String,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

pub mod proxmox;
