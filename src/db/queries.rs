use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::models::status::{JobStatus, JobStatusRecord, StatusUpdate};

/// DDL for a status table. `table` must already be a validated identifier.
pub fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            job_id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            time_started TIMESTAMPTZ,
            time_completed TIMESTAMPTZ,
            time_failed TIMESTAMPTZ,
            job_time DOUBLE PRECISION,
            gpu_time DOUBLE PRECISION
        )
        "#
    )
}

/// Field-level upsert for one status write.
///
/// Only the status, that status's timestamp and any metrics present in the
/// write are touched; a missing row is created.
pub fn upsert_sql(table: &str, status: JobStatus) -> String {
    let time_field = status.time_field();
    format!(
        r#"
        INSERT INTO {table} AS existing (job_id, status, {time_field}, job_time, gpu_time)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (job_id) DO UPDATE
        SET status = EXCLUDED.status,
            {time_field} = EXCLUDED.{time_field},
            job_time = COALESCE(EXCLUDED.job_time, existing.job_time),
            gpu_time = COALESCE(EXCLUDED.gpu_time, existing.gpu_time)
        "#
    )
}

/// Create the status table if it does not exist
pub async fn create_job_table(pool: &PgPool, table: &str) -> Result<(), sqlx::Error> {
    let sql = create_table_sql(table);
    sqlx::query(&sql).execute(pool).await?;
    Ok(())
}

/// Write a job status
pub async fn upsert_job_status(
    pool: &PgPool,
    table: &str,
    update: &StatusUpdate,
) -> Result<(), sqlx::Error> {
    let sql = upsert_sql(table, update.status);
    sqlx::query(&sql)
        .bind(&update.job_id)
        .bind(update.status.as_ref())
        .bind(update.at)
        .bind(update.job_time)
        .bind(update.gpu_time)
        .execute(pool)
        .await?;

    Ok(())
}

/// Get a job's status record
pub async fn get_job_status(
    pool: &PgPool,
    table: &str,
    job_id: &str,
) -> Result<Option<JobStatusRecord>, sqlx::Error> {
    let sql = format!(
        r#"
        SELECT job_id, status, time_started, time_completed, time_failed, job_time, gpu_time
        FROM {table}
        WHERE job_id = $1
        "#
    );
    let row = sqlx::query(&sql).bind(job_id).fetch_optional(pool).await?;

    let Some(r) = row else {
        return Ok(None);
    };

    let status: String = r.try_get("status")?;
    let status: JobStatus = status
        .parse()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Some(JobStatusRecord {
        job_id: r.try_get("job_id")?,
        status,
        time_started: r.try_get::<Option<DateTime<Utc>>, _>("time_started")?,
        time_completed: r.try_get::<Option<DateTime<Utc>>, _>("time_completed")?,
        time_failed: r.try_get::<Option<DateTime<Utc>>, _>("time_failed")?,
        job_time: r.try_get("job_time")?,
        gpu_time: r.try_get("gpu_time")?,
    }))
}
