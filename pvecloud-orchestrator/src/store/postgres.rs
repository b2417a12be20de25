use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pvecloud_common::{CloudError, CloudInstanceState, Flavour, InstanceRecord, Result};
use sqlx::{Pool, Postgres};

use super::RecordStore;

const VM_COLUMNS: &str =
    "id, name, flavour_id, image_id, created_at, metadata, boot_command, status, start_count";

#[derive(sqlx::FromRow)]
struct VmRow {
    id: String,
    name: String,
    flavour_id: String,
    image_id: String,
    created_at: DateTime<Utc>,
    metadata: String,
    boot_command: String,
    status: String,
    start_count: i32,
}

impl TryFrom<VmRow> for InstanceRecord {
    type Error = CloudError;

    fn try_from(row: VmRow) -> Result<Self> {
        let status = CloudInstanceState::parse(&row.status).ok_or_else(|| {
            CloudError::Store(format!("vm {} has unknown status {:?}", row.id, row.status))
        })?;
        Ok(InstanceRecord {
            id: row.id,
            name: row.name,
            flavour_id: row.flavour_id,
            image_id: row.image_id,
            created_at: row.created_at,
            metadata: row.metadata,
            boot_command: row.boot_command,
            status,
            start_count: row.start_count,
        })
    }
}

#[derive(Clone)]
pub struct PgRecordStore {
    db: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_instance(&self, record: &InstanceRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO vm (id, name, flavour_id, image_id, created_at, metadata, boot_command, status, start_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.flavour_id)
        .bind(&record.image_id)
        .bind(record.created_at)
        .bind(&record.metadata)
        .bind(&record.boot_command)
        .bind(record.status.as_str())
        .bind(record.start_count)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, id: &str) -> Result<Option<InstanceRecord>> {
        let row: Option<VmRow> =
            sqlx::query_as(&format!("SELECT {} FROM vm WHERE id = $1", VM_COLUMNS))
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        row.map(InstanceRecord::try_from).transpose()
    }

    async fn get_instances(&self) -> Result<Vec<InstanceRecord>> {
        let rows: Vec<VmRow> =
            sqlx::query_as(&format!("SELECT {} FROM vm ORDER BY created_at", VM_COLUMNS))
                .fetch_all(&self.db)
                .await?;
        rows.into_iter().map(InstanceRecord::try_from).collect()
    }

    async fn delete_instance(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM vm WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn update_instance_status(&self, id: &str, status: CloudInstanceState) -> Result<()> {
        let res = sqlx::query("UPDATE vm SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.db)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CloudError::not_found("instance", id));
        }
        Ok(())
    }

    async fn set_start_count(&self, id: &str, count: i32) -> Result<()> {
        let res = sqlx::query("UPDATE vm SET start_count = $2 WHERE id = $1")
            .bind(id)
            .bind(count)
            .execute(&self.db)
            .await?;
        if res.rows_affected() == 0 {
            return Err(CloudError::not_found("instance", id));
        }
        Ok(())
    }

    async fn increment_start_count(&self, id: &str, max: i32) -> Result<Option<i32>> {
        let count: Option<i32> = sqlx::query_scalar(
            "UPDATE vm SET start_count = start_count + 1
             WHERE id = $1 AND start_count < $2
             RETURNING start_count",
        )
        .bind(id)
        .bind(max)
        .fetch_optional(&self.db)
        .await?;
        Ok(count)
    }

    async fn get_flavour(&self, id: &str) -> Result<Option<Flavour>> {
        let flavour = sqlx::query_as::<_, Flavour>(
            "SELECT id, name, cpus, ram_mb, disk_gb FROM flavour WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(flavour)
    }

    async fn get_flavours(&self) -> Result<Vec<Flavour>> {
        let flavours = sqlx::query_as::<_, Flavour>(
            "SELECT id, name, cpus, ram_mb, disk_gb FROM flavour ORDER BY cpus, ram_mb",
        )
        .fetch_all(&self.db)
        .await?;
        Ok(flavours)
    }

    async fn create_flavour(&self, flavour: &Flavour) -> Result<()> {
        sqlx::query(
            "INSERT INTO flavour (id, name, cpus, ram_mb, disk_gb) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&flavour.id)
        .bind(&flavour.name)
        .bind(flavour.cpus)
        .bind(flavour.ram_mb)
        .bind(flavour.disk_gb)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete_flavour(&self, id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM flavour WHERE id = $1")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}
