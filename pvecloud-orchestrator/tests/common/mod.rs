#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use pvecloud_common::{CloudError, CloudInstanceState, Flavour, InstanceRecord, Result};
use pvecloud_orchestrator::metadata::{CloudInitPayload, MetadataService};
use pvecloud_orchestrator::store::{MemoryStore, RecordStore};
use pvecloud_orchestrator::task_waiter::WaitPolicy;
use pvecloud_orchestrator::{LifecycleConfig, LifecycleOrchestrator};
use pvecloud_providers::mock::MockHypervisor;

pub const GIB: u64 = 1024 * 1024 * 1024;
pub const TEMPLATE_ID: &str = "9000";
pub const MAX_START_RETRY: i32 = 3;

/// Metadata service double that remembers what it was asked to do.
#[derive(Default)]
pub struct RecordingMetadata {
    events: Mutex<Vec<String>>,
    payloads: Mutex<Vec<CloudInitPayload>>,
    failing: AtomicBool,
}

impl RecordingMetadata {
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn payloads(&self) -> Vec<CloudInitPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetadataService for RecordingMetadata {
    async fn register(&self, id: &str, payload: &CloudInitPayload) -> Result<()> {
        self.events.lock().unwrap().push(format!("register {}", id));
        if self.failing.load(Ordering::SeqCst) {
            return Err(CloudError::Transport("metadata service down".into()));
        }
        self.payloads.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<()> {
        self.events.lock().unwrap().push(format!("unregister {}", id));
        if self.failing.load(Ordering::SeqCst) {
            return Err(CloudError::Transport("metadata service down".into()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub hv: Arc<MockHypervisor>,
    pub store: Arc<MemoryStore>,
    pub metadata: Arc<RecordingMetadata>,
    pub orch: LifecycleOrchestrator,
}

pub fn fast_config() -> LifecycleConfig {
    let policy = WaitPolicy {
        interval: Duration::from_millis(5),
        max_wait: Duration::from_secs(2),
    };
    LifecycleConfig {
        max_start_retry: MAX_START_RETRY,
        metadata_server: "http://meta.local/vm/".to_string(),
        project_id: Some("visa".to_string()),
        clone_wait: policy,
        task_wait: policy,
        ..Default::default()
    }
}

/// One roomy node, one template and a "small" flavour.
pub async fn harness() -> Harness {
    harness_with(fast_config()).await
}

pub async fn harness_with(config: LifecycleConfig) -> Harness {
    let hv = seeded_hypervisor();
    let store = Arc::new(MemoryStore::new());
    store.create_flavour(&small_flavour()).await.unwrap();

    let metadata = Arc::new(RecordingMetadata::default());
    let orch = LifecycleOrchestrator::new(config, hv.clone(), store.clone(), metadata.clone());
    Harness {
        hv,
        store,
        metadata,
        orch,
    }
}

pub fn seeded_hypervisor() -> Arc<MockHypervisor> {
    let hv = Arc::new(MockHypervisor::new());
    hv.add_node("pve1", 16.0, 0.0, 64 * GIB, 0);
    hv.add_template(9000, "pve1", "debian-12", 10 * GIB);
    hv
}

pub fn small_flavour() -> Flavour {
    Flavour {
        id: "small".into(),
        name: "Small".into(),
        cpus: 2,
        ram_mb: 2048,
        disk_gb: 20,
    }
}

impl Harness {
    /// An instance created earlier: a live VM plus its record.
    pub async fn existing(&self, vmid: u32, live: &str, status: CloudInstanceState, start_count: i32) {
        self.hv.add_vm(vmid, "pve1", &format!("vm-{}", vmid), live);
        self.store
            .create_instance(&record(&vmid.to_string(), status, start_count))
            .await
            .unwrap();
    }

    pub async fn status_of(&self, id: &str) -> Option<CloudInstanceState> {
        self.store
            .get_instance(id)
            .await
            .unwrap()
            .map(|r| r.status)
    }
}

pub fn record(id: &str, status: CloudInstanceState, start_count: i32) -> InstanceRecord {
    InstanceRecord {
        id: id.to_string(),
        name: format!("vm-{}", id),
        flavour_id: "small".into(),
        image_id: TEMPLATE_ID.into(),
        created_at: Utc::now(),
        metadata: String::new(),
        boot_command: String::new(),
        status,
        start_count,
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
