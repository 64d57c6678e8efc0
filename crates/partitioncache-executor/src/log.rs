//! The processor-log table (§4.4 "Logging", §6 "Processor config/log
//! tables"): one row per job-lifecycle event, pruned by the eviction cron
//! rather than by the executor itself.

use crate::error::Result;
use chrono::{DateTime, Utc};
use partitioncache_core::ExecutionSource;
use sqlx::PgPool;
use uuid::Uuid;

pub fn log_table_name(prefix: &str) -> String {
    format!("{prefix}_processor_log")
}

pub async fn ensure_log_table(pool: &PgPool, prefix: &str) -> Result<()> {
    let table = log_table_name(prefix);
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id BIGSERIAL PRIMARY KEY,
            job_id UUID NOT NULL,
            fragment_hash TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            rows_affected INT,
            execution_time_ms BIGINT,
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {table}_created_at_idx ON {table} (created_at)"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_started(
    pool: &PgPool,
    prefix: &str,
    job_id: Uuid,
    fragment_hash: &str,
    pk: &str,
    source: ExecutionSource,
) -> Result<()> {
    let table = log_table_name(prefix);
    sqlx::query(&format!(
        "INSERT INTO {table} (job_id, fragment_hash, partition_key, source, status)
         VALUES ($1, $2, $3, $4, 'started')"
    ))
    .bind(job_id)
    .bind(fragment_hash)
    .bind(pk)
    .bind(source.as_str())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_success(
    pool: &PgPool,
    prefix: &str,
    job_id: Uuid,
    fragment_hash: &str,
    pk: &str,
    source: ExecutionSource,
    rows_affected: usize,
    execution_time_ms: i64,
) -> Result<()> {
    let table = log_table_name(prefix);
    sqlx::query(&format!(
        "INSERT INTO {table}
            (job_id, fragment_hash, partition_key, source, status, rows_affected, execution_time_ms)
         VALUES ($1, $2, $3, $4, 'success', $5, $6)"
    ))
    .bind(job_id)
    .bind(fragment_hash)
    .bind(pk)
    .bind(source.as_str())
    .bind(rows_affected as i32)
    .bind(execution_time_ms)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn record_failure(
    pool: &PgPool,
    prefix: &str,
    job_id: Uuid,
    fragment_hash: &str,
    pk: &str,
    source: ExecutionSource,
    status: &str,
    error_message: &str,
) -> Result<()> {
    let table = log_table_name(prefix);
    sqlx::query(&format!(
        "INSERT INTO {table} (job_id, fragment_hash, partition_key, source, status, error_message)
         VALUES ($1, $2, $3, $4, $5, $6)"
    ))
    .bind(job_id)
    .bind(fragment_hash)
    .bind(pk)
    .bind(source.as_str())
    .bind(status)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

/// Deletes log rows older than `before`, one bounded batch at a time, the
/// way the teacher's `delete_expired_blocks_batch` whittles down an
/// unbounded delete into `LIMIT`-sized chunks. Returns the number of rows
/// removed.
pub async fn prune_logs_batch(pool: &PgPool, prefix: &str, before: DateTime<Utc>) -> Result<u64> {
    let table = log_table_name(prefix);
    let batch_size: i64 = 1000;
    let result = sqlx::query(&format!(
        "DELETE FROM {table} WHERE id IN (
            SELECT id FROM {table} WHERE created_at < $1 LIMIT $2
         )"
    ))
    .bind(before)
    .bind(batch_size)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn prune_logs(pool: &PgPool, prefix: &str, retain_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - chrono::TimeDelta::days(retain_days);
    let mut total = 0u64;
    loop {
        let removed = prune_logs_batch(pool, prefix, cutoff).await?;
        total += removed;
        if removed < 1000 {
            break;
        }
    }
    Ok(total)
}
