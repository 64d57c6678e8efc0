//! `SpatialH3` backend (§4.2): a Geometry-typed partition cached as the set
//! of H3 cell indices its rows fall into, stored as `BIGINT[]`.
//!
//! The partition key is registered as `Geometry`, but the cached set itself
//! is H3 cell ids rather than geometries — indexing the partition by the
//! coarser H3 grid keeps intersection a plain integer-array operation
//! instead of a geometric one. Callers that need the original geometries
//! back join the returned cell ids against the source table; this backend
//! only ever hands back which cells were covered.
//!
//! Intersection reuses the same integer-array `&&`/`ARRAY(SELECT ... INTERSECT ...)`
//! approach as [`array`][crate::relational::array], since a `BIGINT[]` of
//! cell ids has no spatial semantics once it's in the cache table.

use crate::error::{CacheError, Result};
use crate::relational::{self, cache_table_name, spatial};
use crate::CacheBackend;
use async_trait::async_trait;
use partitioncache_core::{lock, CacheStatus, Datatype, FragmentHash, PartitionValue};
use sqlx::{PgPool, Row};

pub const BACKEND_ID: &str = "spatial_h3";

pub struct SpatialH3Backend {
    pool: PgPool,
    prefix: String,
}

impl SpatialH3Backend {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn table(&self, pk: &str) -> String {
        cache_table_name(&self.prefix, pk)
    }

    fn to_cells(values: &[PartitionValue]) -> Result<Vec<i64>> {
        values
            .iter()
            .map(|v| match v {
                PartitionValue::Integer(i) => Ok(*i),
                other => Err(CacheError::InvalidArgument(format!(
                    "spatial_h3 expects H3 cell ids as integers, got {other:?}"
                ))),
            })
            .collect()
    }
}

#[async_trait]
impl CacheBackend for SpatialH3Backend {
    fn backend_id(&self) -> &'static str {
        BACKEND_ID
    }

    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()> {
        spatial::require_geometry_datatype(BACKEND_ID, datatype)?;
        spatial::ensure_postgis_extension(&self.pool).await?;
        let table = self.table(pk);
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                query_hash TEXT PRIMARY KEY,
                cells BIGINT[],
                is_null BOOLEAN NOT NULL DEFAULT false,
                status TEXT NOT NULL DEFAULT 'ok',
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        relational::register_partition_key(&self.pool, &self.prefix, pk, datatype, None, &create_sql).await
    }

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let cells = Self::to_cells(values)?;
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, cells, is_null, last_seen)
             VALUES ($1, $2, false, now())
             ON CONFLICT (query_hash) DO UPDATE SET cells = EXCLUDED.cells, is_null = false, last_seen = now()"
        ))
        .bind(hash.as_str())
        .bind(&cells)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn set_lazy(&self, hash: &FragmentHash, fragment_sql: &str, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, cells, is_null, last_seen)
             SELECT $1, array_agg(DISTINCT t.h3_cell), false, now() FROM ({fragment_sql}) AS t(h3_cell)
             ON CONFLICT (query_hash) DO UPDATE SET cells = EXCLUDED.cells, is_null = false, last_seen = now()"
        ))
        .bind(hash.as_str())
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        let table = self.table(pk);
        let row = sqlx::query(&format!(
            "SELECT cells, is_null FROM {table} WHERE query_hash = $1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let is_null: bool = row.try_get("is_null")?;
        if is_null {
            return Ok(None);
        }
        let cells: Vec<i64> = row.try_get("cells")?;
        Ok(Some(cells.into_iter().map(PartitionValue::Integer).collect()))
    }

    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)> {
        let mut sets = Vec::new();
        for hash in hashes {
            if let Some(values) = self.get(hash, pk).await? {
                sets.push(values);
            }
        }
        let hits = sets.len();
        Ok((Some(crate::intersect_value_sets(sets)), hits))
    }

    async fn get_intersected_lazy(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<String>, usize)> {
        let existing = self.filter_existing(hashes, pk).await?;
        if existing.is_empty() {
            return Ok((None, 0));
        }
        let table = self.table(pk);
        let list: Vec<String> = existing.iter().map(|h| format!("'{}'", h.as_str())).collect();
        let snippet = format!(
            "SELECT unnest(cells) AS h3_cell FROM {table} WHERE query_hash IN ({})
             GROUP BY h3_cell HAVING count(*) = {}",
            list.join(", "),
            existing.len()
        );
        Ok((Some(snippet), existing.len()))
    }

    async fn exists(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        let row = sqlx::query(&format!("SELECT 1 AS present FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn filter_existing(&self, hashes: &[FragmentHash], pk: &str) -> Result<Vec<FragmentHash>> {
        let mut out = Vec::new();
        for hash in hashes {
            if self.exists(hash, pk).await? {
                out.push(hash.clone());
            }
        }
        Ok(out)
    }

    async fn delete(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        let mut tx = self.pool.begin().await?;
        lock::acquire(&mut *tx, lock::namespace::CACHE_ENTRY, &lock::cache_entry_key(pk, hash.as_str())).await?;
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_null(&self, hash: &FragmentHash, pk: &str) -> Result<()> {
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, cells, is_null, last_seen)
             VALUES ($1, NULL, true, now())
             ON CONFLICT (query_hash) DO UPDATE SET cells = NULL, is_null = true, last_seen = now()"
        ))
        .bind(hash.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_null(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let table = self.table(pk);
        let row = sqlx::query(&format!("SELECT is_null FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(r.try_get("is_null")?),
            None => Ok(false),
        }
    }

    async fn set_status(&self, hash: &FragmentHash, pk: &str, status: CacheStatus) -> Result<()> {
        let table = self.table(pk);
        sqlx::query(&format!("UPDATE {table} SET status = $1 WHERE query_hash = $2"))
            .bind(status.as_str())
            .bind(hash.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_status(&self, hash: &FragmentHash, pk: &str) -> Result<Option<CacheStatus>> {
        let table = self.table(pk);
        let row = sqlx::query(&format!("SELECT status FROM {table} WHERE query_hash = $1"))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| {
            let s: String = r.try_get("status")?;
            Ok(CacheStatus::parse(&s).unwrap_or(CacheStatus::Ok))
        })
        .transpose()
    }

    async fn set_query(&self, hash: &FragmentHash, text: &str, pk: &str) -> Result<()> {
        relational::set_query(&self.pool, &self.prefix, hash.as_str(), pk, text).await
    }

    async fn get_query(&self, hash: &FragmentHash, pk: &str) -> Result<Option<String>> {
        relational::get_query(&self.pool, &self.prefix, hash.as_str(), pk).await
    }

    async fn list_queries(&self, pk: &str) -> Result<Vec<(FragmentHash, String)>> {
        let rows = relational::list_queries(&self.pool, &self.prefix, pk).await?;
        Ok(rows.into_iter().map(|(h, q)| (FragmentHash::from_hex(h), q)).collect())
    }

    async fn partitions(&self) -> Result<Vec<(String, Datatype)>> {
        relational::list_partitions(&self.pool, &self.prefix).await
    }
}
