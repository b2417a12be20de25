use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

mod error;

pub use error::{CloudError, Result};

// --- Enums ---

/// Workflow phase of an instance as persisted by the orchestrator.
///
/// The hypervisor only knows running/stopped; BUILDING, STOPPING and
/// REBOOTING exist only in the record store.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum CloudInstanceState {
    Building,
    Active,
    Stopping,
    Stopped,
    Rebooting,
}

impl CloudInstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            CloudInstanceState::Building => "BUILDING",
            CloudInstanceState::Active => "ACTIVE",
            CloudInstanceState::Stopping => "STOPPING",
            CloudInstanceState::Stopped => "STOPPED",
            CloudInstanceState::Rebooting => "REBOOTING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BUILDING" => Some(CloudInstanceState::Building),
            "ACTIVE" => Some(CloudInstanceState::Active),
            "STOPPING" => Some(CloudInstanceState::Stopping),
            "STOPPED" => Some(CloudInstanceState::Stopped),
            "REBOOTING" => Some(CloudInstanceState::Rebooting),
            _ => None,
        }
    }
}

impl fmt::Display for CloudInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Catalog ---

/// Sizing template. Administrative data: the instance lifecycle only reads it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
pub struct Flavour {
    pub id: String,
    pub name: String,
    pub cpus: i32,
    pub ram_mb: i32,
    pub disk_gb: i32,
}

impl Flavour {
    pub fn ram_bytes(&self) -> u64 {
        (self.ram_mb.max(0) as u64) * 1024 * 1024
    }
}

/// Clone source, projected from the hypervisor's template listing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Image {
    pub id: String,
    pub name: String,
    pub size: u64,
}

// --- Instances ---

/// Locally persisted view of an instance.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub flavour_id: String,
    pub image_id: String,
    pub created_at: DateTime<Utc>,
    pub metadata: String,
    pub boot_command: String,
    pub status: CloudInstanceState,
    pub start_count: i32,
}

/// Canonical instance view: the record merged with live hypervisor state.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub state: CloudInstanceState,
    pub flavour_id: String,
    pub image_id: String,
    pub created_at: DateTime<Utc>,
    /// Empty when the guest agent has not reported an IPv4 address yet.
    pub address: String,
    pub security_groups: Vec<String>,
}

impl Instance {
    pub fn from_record(
        record: &InstanceRecord,
        live_name: Option<&str>,
        address: String,
        security_groups: Vec<String>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            name: live_name
                .filter(|n| !n.is_empty())
                .unwrap_or(&record.name)
                .to_string(),
            state: record.status,
            flavour_id: record.flavour_id.clone(),
            image_id: record.image_id.clone(),
            created_at: record.created_at,
            address,
            security_groups,
        }
    }
}

/// Cluster-wide capacity figures.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Metrics {
    pub max_total_ram_mb: u64,
    pub max_total_cores: u64,
    pub total_ram_used_mb: u64,
    pub total_cores_used: f64,
    pub total_instances_used: usize,
}
