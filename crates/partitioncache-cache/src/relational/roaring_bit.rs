//! `RoaringBit` backend (§4.2): integer-only partitions stored as a
//! serialized Roaring bitmap per `(partition_key, hash)` row, using the
//! `roaring` crate for the in-memory representation and a `BYTEA` column for
//! storage. Compared to [`bit`][crate::relational::bit], this trades a fixed
//! per-row width for sparse-friendly compression and no bitsize expansion
//! step — a Roaring bitmap accepts any `u32` without resizing anything.

use crate::error::{CacheError, Result};
use crate::relational::{self, cache_table_name};
use crate::CacheBackend;
use async_trait::async_trait;
use partitioncache_core::{lock, CacheStatus, Datatype, FragmentHash, PartitionValue};
use roaring::RoaringBitmap;
use sqlx::{PgPool, Row};

pub const BACKEND_ID: &str = "roaring_pg";

pub struct RoaringBackend {
    pool: PgPool,
    prefix: String,
}

impl RoaringBackend {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn table(&self, pk: &str) -> String {
        cache_table_name(&self.prefix, pk)
    }

    fn encode(values: &[PartitionValue]) -> Result<Vec<u8>> {
        let mut bitmap = RoaringBitmap::new();
        for v in values {
            let i = v.as_integer()?;
            let i: u32 = i
                .try_into()
                .map_err(|_| CacheError::InvalidArgument(format!("value {i} out of u32 range for roaring backend")))?;
            bitmap.insert(i);
        }
        let mut buf = Vec::new();
        bitmap
            .serialize_into(&mut buf)
            .map_err(|e| CacheError::InvalidArgument(e.to_string()))?;
        Ok(buf)
    }

    fn decode(bytes: &[u8]) -> Result<RoaringBitmap> {
        RoaringBitmap::deserialize_from(bytes).map_err(|e| CacheError::InvalidArgument(e.to_string()))
    }

    fn bitmap_to_values(bitmap: &RoaringBitmap) -> Vec<PartitionValue> {
        bitmap.iter().map(|v| PartitionValue::Integer(v as i64)).collect()
    }
}

#[async_trait]
impl CacheBackend for RoaringBackend {
    fn backend_id(&self) -> &'static str {
        BACKEND_ID
    }

    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()> {
        if datatype != Datatype::Integer {
            return Err(CacheError::DatatypeUnsupported {
                backend: BACKEND_ID.to_string(),
                datatype,
            });
        }
        let table = self.table(pk);
        let create_sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                query_hash TEXT PRIMARY KEY,
                bitmap BYTEA,
                is_null BOOLEAN NOT NULL DEFAULT false,
                status TEXT NOT NULL DEFAULT 'ok',
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        relational::register_partition_key(&self.pool, &self.prefix, pk, datatype, None, &create_sql).await
    }

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let bytes = Self::encode(values)?;
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, bitmap, is_null, last_seen)
             VALUES ($1, $2, false, now())
             ON CONFLICT (query_hash) DO UPDATE SET bitmap = EXCLUDED.bitmap, is_null = false, last_seen = now()"
        ))
        .bind(hash.as_str())
        .bind(&bytes)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> Result<bool> {
        Err(CacheError::InvalidArgument(
            "roaring backend does not support set_lazy".to_string(),
        ))
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        let table = self.table(pk);
        let row = sqlx::query(&format!(
            "SELECT bitmap, is_null FROM {table} WHERE query_hash = $1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let is_null: bool = row.try_get("is_null")?;
        if is_null {
            return Ok(None);
        }
        let bytes: Vec<u8> = row.try_get("bitmap")?;
        let bitmap = Self::decode(&bytes)?;
        Ok(Some(Self::bitmap_to_values(&bitmap)))
    }

    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)> {
        let table = self.table(pk);
        let mut bitmaps = Vec::new();
        for hash in hashes {
            let row = sqlx::query(&format!(
                "SELECT bitmap FROM {table} WHERE query_hash = $1 AND is_null = false"
            ))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                let bytes: Vec<u8> = row.try_get("bitmap")?;
                bitmaps.push(Self::decode(&bytes)?);
            }
        }
        let hits = bitmaps.len();
        let Some((first, rest)) = bitmaps.split_first() else {
            return Ok((None, 0));
        };
        let mut acc = first.clone();
        for b in rest {
            acc &= b;
        }
        Ok((Some(Self::bitmap_to_values(&acc)), hits))
    }

    async fn get_intersected_lazy(&self, _hashes: &[FragmentHash], _pk: &str) -> Result<(Option<String>, usize)> {
        Ok((None, 0))
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
            "INSERT INTO {table} (query_hash, bitmap, is_null, last_seen)
             VALUES ($1, NULL, true, now())
             ON CONFLICT (query_hash) DO UPDATE SET bitmap = NULL, is_null = true, last_seen = now()"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bitmap_bytes() {
        let values = vec![
            PartitionValue::Integer(3),
            PartitionValue::Integer(1_000_000),
            PartitionValue::Integer(7),
        ];
        let bytes = RoaringBackend::encode(&values).unwrap();
        let bitmap = RoaringBackend::decode(&bytes).unwrap();
        let mut decoded = RoaringBackend::bitmap_to_values(&bitmap);
        decoded.sort_by_key(|v| v.as_integer().unwrap());
        let mut expected = values;
        expected.sort_by_key(|v| v.as_integer().unwrap());
        assert_eq!(decoded, expected);
    }
}
