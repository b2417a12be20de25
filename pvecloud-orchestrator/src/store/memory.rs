use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use pvecloud_common::{CloudError, CloudInstanceState, Flavour, InstanceRecord, Result};

use super::RecordStore;

/// In-process store for local runs and tests. Keeps a log of status writes so
/// callers can assert how many updates an operation issued.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: BTreeMap<String, InstanceRecord>,
    flavours: BTreeMap<String, Flavour>,
    status_updates: Vec<(String, CloudInstanceState)>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every `update_instance_status` call, oldest first.
    pub fn status_updates(&self) -> Vec<(String, CloudInstanceState)> {
        self.lock().status_updates.clone()
    }

    pub fn status_updates_for(&self, id: &str) -> usize {
        self.lock()
            .status_updates
            .iter()
            .filter(|(i, _)| i == id)
            .count()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        let mut inner = self.lock();
        if inner.instances.contains_key(&record.id) {
            return Err(CloudError::Store(format!("vm {} already exists", record.id)));
        }
        inner.instances.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        Ok(self.lock().instances.get(id).cloned())
    }

    async fn get_instances(&self) -> Result<Vec<InstanceRecord>> {
        Ok(self.lock().instances.values().cloned().collect())
    }

    async fn delete_instance(&self, id: &str) -> Result<bool> {
        Ok(self.lock().instances.remove(id).is_some())
    }

    async fn update_instance_status(&self, id: &str, status: CloudInstanceState) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| CloudError::not_found("instance", id))?;
        record.status = status;
        inner.status_updates.push((id.to_string(), status));
        Ok(())
    }

    async fn set_start_count(&self, id: &str, count: i32) -> Result<()> {
        let mut inner = self.lock();
        let record = inner
            .instances
            .get_mut(id)
            .ok_or_else(|| CloudError::not_found("instance", id))?;
        record.start_count = count;
        Ok(())
    }

    async fn increment_start_count(&self, id: &str, max: i32) -> Result<Option<i32>> {
        let mut inner = self.lock();
        match inner.instances.get_mut(id) {
            Some(record) if record.start_count < max => {
                record.start_count += 1;
                Ok(Some(record.start_count))
            }
            _ => Ok(None),
        }
    }

    async fn get_flavour(&self, id: &str) -> Result<Option<Flavour>> {
        Ok(self.lock().flavours.get(id).cloned())
    }

    async fn get_flavours(&self) -> Result<Vec<Flavour>> {
        Ok(self.lock().flavours.values().cloned().collect())
    }

    async fn create_flavour(&self, flavour: &Flavour) -> Result<()> {
        let mut inner = self.lock();
        if inner.flavours.contains_key(&flavour.id) {
            return Err(CloudError::Store(format!(
                "flavour {} already exists",
                flavour.id
            )));
        }
        inner.flavours.insert(flavour.id.clone(), flavour.clone());
        Ok(())
    }

    async fn delete_flavour(&self, id: &str) -> Result<bool> {
        Ok(self.lock().flavours.remove(id).is_some())
    }
}
