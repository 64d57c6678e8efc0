//! Executes a fragment's SQL text against the source database and collects
//! its single returned column into [`PartitionValue`]s, under a
//! statement-level timeout (§4.4 "execute_job", §6 "per-fragment SQL
//! dialect requirements").
//!
//! Grounded on the teacher's `delete.rs` row-decoding style
//! (`r.try_get(...)` per expected column), generalized here to a single
//! column whose decoded Rust type depends on the partition's [`Datatype`].

use crate::error::{ExecutorError, Result};
use chrono::{DateTime, Utc};
use partitioncache_core::{Datatype, PartitionValue};
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Runs `fragment_sql` with a statement timeout and decodes its first
/// result column as `datatype`. The fragment is expected to return exactly
/// one column (the partition key); extra columns are ignored.
pub async fn run_sql(
    pool: &PgPool,
    fragment_sql: &str,
    datatype: Datatype,
    timeout: Duration,
) -> Result<Vec<PartitionValue>> {
    let mut tx = pool.begin().await?;
    let timeout_ms = timeout.as_millis().max(1);
    sqlx::query(&format!("SET LOCAL statement_timeout = {timeout_ms}"))
        .execute(&mut *tx)
        .await?;

    let rows = match sqlx::query(fragment_sql).fetch_all(&mut *tx).await {
        Ok(rows) => rows,
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("57014") => {
            return Err(ExecutorError::Timeout(timeout.as_secs()));
        }
        Err(e) => return Err(ExecutorError::Sqlx(e)),
    };
    tx.commit().await?;

    let mut values = Vec::with_capacity(rows.len());
    for row in &rows {
        let value = match datatype {
            Datatype::Integer => PartitionValue::Integer(row.try_get::<i64, _>(0)?),
            Datatype::Float => PartitionValue::Float(row.try_get::<f64, _>(0)?),
            Datatype::Text => PartitionValue::Text(row.try_get::<String, _>(0)?),
            Datatype::Timestamp => PartitionValue::Timestamp(row.try_get::<DateTime<Utc>, _>(0)?),
            Datatype::Geometry => PartitionValue::Geometry(row.try_get::<String, _>(0)?),
        };
        values.push(value);
    }
    Ok(values)
}
