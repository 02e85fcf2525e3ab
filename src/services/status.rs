use async_trait::async_trait;
use sqlx::PgPool;

use crate::db::{self, queries};
use crate::models::status::{JobStatusRecord, StatusUpdate};

/// Per-job status records, written field by field.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Apply one status write, creating the record when it does not exist.
    async fn upsert(&self, update: &StatusUpdate) -> Result<(), StatusError>;
}

/// Status table in PostgreSQL.
pub struct PgStatusStore {
    pool: PgPool,
    table: String,
}

impl PgStatusStore {
    pub fn new(pool: PgPool, table: &str) -> Result<Self, StatusError> {
        if !db::is_valid_table_name(table) {
            return Err(StatusError::InvalidTable(table.to_string()));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the status table when it is missing.
    pub async fn ensure_table(&self) -> Result<(), StatusError> {
        queries::create_job_table(&self.pool, &self.table).await?;
        Ok(())
    }

    pub async fn fetch(&self, job_id: &str) -> Result<Option<JobStatusRecord>, StatusError> {
        Ok(queries::get_job_status(&self.pool, &self.table, job_id).await?)
    }

    /// Check database connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), StatusError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn upsert(&self, update: &StatusUpdate) -> Result<(), StatusError> {
        queries::upsert_job_status(&self.pool, &self.table, update).await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid status table name {0:?}")]
    InvalidTable(String),
}
