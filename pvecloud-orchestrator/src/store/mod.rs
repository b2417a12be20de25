use async_trait::async_trait;
use pvecloud_common::{CloudInstanceState, Flavour, InstanceRecord, Result};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgRecordStore;

/// Keyed persistence for instance records and the flavour catalog.
///
/// The orchestrator is the only writer. Lookups return `Ok(None)` for a
/// missing key; `Err` is reserved for the store itself failing.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()>;

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>>;

    async fn get_instances(&self) -> Result<Vec<InstanceRecord>>;

    /// `true` when a record was removed.
    async fn delete_instance(&self, id: &str) -> Result<bool>;

    async fn update_instance_status(&self, id: &str, status: CloudInstanceState) -> Result<()>;

    async fn set_start_count(&self, id: &str, count: i32) -> Result<()>;

    /// Atomically bumps `start_count` if it is still below `max`.
    /// Returns the new value, or `None` when the budget is spent.
    async fn increment_start_count(&self, id: &str, max: i32) -> Result<Option<i32>>;

    async fn get_flavour(&self, id: &str) -> Result<Option<Flavour>>;

    async fn get_flavours(&self) -> Result<Vec<Flavour>>;

    async fn create_flavour(&self, flavour: &Flavour) -> Result<()>;

    async fn delete_flavour(&self, id: &str) -> Result<bool>;
}
