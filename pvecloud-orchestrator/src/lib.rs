//! Instance lifecycle orchestration for a Proxmox VE cluster: placement,
//! hypervisor task tracking, reconciliation of the local records with the live
//! cluster, and the create/start/stop/reboot/delete workflows.

pub mod lifecycle;
pub mod locks;
pub mod metadata;
pub mod placement;
pub mod reconciliation;
pub mod settings;
pub mod state_machine;
pub mod store;
pub mod supervisor;
pub mod task_waiter;
pub mod watch_dog_job;

pub use lifecycle::{CreateInstance, DeleteOutcome, LifecycleConfig, LifecycleOrchestrator};
pub use reconciliation::InstanceReconciler;
pub use settings::Settings;
