//! Shared plumbing for every Postgres-backed cache variant: per-partition
//! table naming, the metadata/queries tables, and the migration pattern that
//! creates a partition's cache table exactly once.
//!
//! Grounded on `analytics/src/lakehouse/migration.rs`: read the current
//! state, take an advisory lock, re-check under the lock, then migrate.
//! Here "migrate" means "create this partition's cache table" rather than
//! "upgrade a schema version", but the check-lock-recheck shape is the same.

pub mod array;
pub mod bit;
pub mod roaring_bit;
pub mod spatial;
pub mod spatial_bbox;
pub mod spatial_h3;

use crate::error::{CacheError, Result};
use partitioncache_core::{lock, Datatype};
use sqlx::{PgPool, Row};

pub fn cache_table_name(prefix: &str, pk: &str) -> String {
    format!("{prefix}_cache_{pk}")
}

pub fn metadata_table_name(prefix: &str) -> String {
    format!("{prefix}_partition_metadata")
}

pub fn queries_table_name(prefix: &str) -> String {
    format!("{prefix}_queries")
}

pub async fn ensure_support_tables(pool: &PgPool, prefix: &str) -> Result<()> {
    let metadata = metadata_table_name(prefix);
    let queries = queries_table_name(prefix);
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {metadata} (
            partition_key TEXT PRIMARY KEY,
            datatype TEXT NOT NULL,
            bitsize INT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )"
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {queries} (
            query_hash TEXT NOT NULL,
            partition_key TEXT NOT NULL,
            query TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'ok',
            last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (query_hash, partition_key)
        )"
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Registers `pk` with `datatype` for this backend, creating its cache
/// table from `create_cache_table_sql` on first registration. Idempotent;
/// fails with `DatatypeConflict` on a mismatched re-registration.
pub async fn register_partition_key(
    pool: &PgPool,
    prefix: &str,
    pk: &str,
    datatype: Datatype,
    bitsize: Option<u32>,
    create_cache_table_sql: &str,
) -> Result<()> {
    ensure_support_tables(pool, prefix).await?;
    let metadata = metadata_table_name(prefix);
    let mut tx = pool.begin().await?;
    lock::acquire(&mut *tx, lock::namespace::MIGRATION, pk).await?;

    let existing = sqlx::query(&format!(
        "SELECT datatype FROM {metadata} WHERE partition_key = $1"
    ))
    .bind(pk)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some(row) = existing {
        let registered: String = row.try_get("datatype")?;
        if registered != datatype.as_str() {
            return Err(CacheError::DatatypeConflict {
                partition_key: pk.to_string(),
                registered: datatype_from_str(&registered),
                attempted: datatype,
            });
        }
        tx.commit().await?;
        return Ok(());
    }

    sqlx::query(create_cache_table_sql).execute(&mut *tx).await?;
    sqlx::query(&format!(
        "INSERT INTO {metadata} (partition_key, datatype, bitsize) VALUES ($1, $2, $3)"
    ))
    .bind(pk)
    .bind(datatype.as_str())
    .bind(bitsize.map(|b| b as i32))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

fn datatype_from_str(s: &str) -> Datatype {
    s.parse().unwrap_or(Datatype::Text)
}

pub async fn list_partitions(pool: &PgPool, prefix: &str) -> Result<Vec<(String, Datatype)>> {
    let metadata = metadata_table_name(prefix);
    if sqlx::query(&format!("SELECT to_regclass('{metadata}') AS t"))
        .fetch_one(pool)
        .await
        .ok()
        .and_then(|r| r.try_get::<Option<String>, _>("t").ok().flatten())
        .is_none()
    {
        return Ok(Vec::new());
    }
    let rows = sqlx::query(&format!("SELECT partition_key, datatype FROM {metadata}"))
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|r| {
            let pk: String = r.try_get("partition_key")?;
            let dt: String = r.try_get("datatype")?;
            Ok((pk, datatype_from_str(&dt)))
        })
        .collect()
}

pub async fn set_query(pool: &PgPool, prefix: &str, hash: &str, pk: &str, text: &str) -> Result<()> {
    let queries = queries_table_name(prefix);
    sqlx::query(&format!(
        "INSERT INTO {queries} (query_hash, partition_key, query, last_seen)
         VALUES ($1, $2, $3, now())
         ON CONFLICT (query_hash, partition_key)
         DO UPDATE SET query = EXCLUDED.query, last_seen = now()"
    ))
    .bind(hash)
    .bind(pk)
    .bind(text)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_query(pool: &PgPool, prefix: &str, hash: &str, pk: &str) -> Result<Option<String>> {
    let queries = queries_table_name(prefix);
    let row = sqlx::query(&format!(
        "SELECT query FROM {queries} WHERE query_hash = $1 AND partition_key = $2"
    ))
    .bind(hash)
    .bind(pk)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get::<String, _>("query").map_err(CacheError::from))
        .transpose()
}

pub async fn list_queries(pool: &PgPool, prefix: &str, pk: &str) -> Result<Vec<(String, String)>> {
    let queries = queries_table_name(prefix);
    let rows = sqlx::query(&format!(
        "SELECT query_hash, query FROM {queries} WHERE partition_key = $1"
    ))
    .bind(pk)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|r| Ok((r.try_get("query_hash")?, r.try_get("query")?)))
        .collect()
}

pub async fn set_status(pool: &PgPool, prefix: &str, hash: &str, pk: &str, status: &str) -> Result<()> {
    let queries = queries_table_name(prefix);
    sqlx::query(&format!(
        "UPDATE {queries} SET status = $1 WHERE query_hash = $2 AND partition_key = $3"
    ))
    .bind(status)
    .bind(hash)
    .bind(pk)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_status(pool: &PgPool, prefix: &str, hash: &str, pk: &str) -> Result<Option<String>> {
    let queries = queries_table_name(prefix);
    let row = sqlx::query(&format!(
        "SELECT status FROM {queries} WHERE query_hash = $1 AND partition_key = $2"
    ))
    .bind(hash)
    .bind(pk)
    .fetch_optional(pool)
    .await?;
    row.map(|r| r.try_get::<String, _>("status").map_err(CacheError::from))
        .transpose()
}
