//! `Bit` backend (§4.2, §4.2.1): one `BIT VARYING` column per partition,
//! auto-expanding when a new value's index exceeds the current bitsize.
//!
//! Bit manipulation happens application-side (fetch the current bitstring
//! as text, flip characters, write the whole string back) rather than via
//! Postgres's bit-string functions, which have no direct `set_bit`
//! equivalent for `bit varying` the way `bytea` does — simpler to reason
//! about than clever, matching `delete.rs`'s preference for a plain loop
//! over a cleverer single query.
//!
//! Bitsize expansion is serialized by the `BITSIZE_EXPANSION` advisory lock
//! (§4.2.1): re-check the current bitsize after acquiring the lock, since
//! another writer may have expanded it first.

use crate::error::{CacheError, Result};
use crate::relational::{self, cache_table_name, metadata_table_name};
use crate::CacheBackend;
use async_trait::async_trait;
use partitioncache_core::{lock, CacheStatus, Datatype, FragmentHash, PartitionValue};
use sqlx::{PgPool, Row};

pub const BACKEND_ID: &str = "bit_pg";

pub struct BitBackend {
    pool: PgPool,
    prefix: String,
    default_bitsize: u32,
}

impl BitBackend {
    pub fn new(pool: PgPool, prefix: impl Into<String>, default_bitsize: u32) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            default_bitsize,
        }
    }

    fn table(&self, pk: &str) -> String {
        cache_table_name(&self.prefix, pk)
    }

    async fn bitsize_of(&self, pk: &str) -> Result<u32> {
        let metadata = metadata_table_name(&self.prefix);
        let row = sqlx::query(&format!(
            "SELECT bitsize FROM {metadata} WHERE partition_key = $1"
        ))
        .bind(pk)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => {
                let bitsize: Option<i32> = r.try_get("bitsize")?;
                Ok(bitsize.unwrap_or(self.default_bitsize as i32) as u32)
            }
            None => Err(CacheError::InvalidArgument(format!(
                "partition key '{pk}' is not registered"
            ))),
        }
    }

    /// Expands the partition's bitsize to at least `min_bitsize`, padding
    /// every existing row's bitstring with trailing zero bits. No-op if the
    /// current bitsize already covers `min_bitsize`.
    async fn ensure_bitsize(&self, pk: &str, min_bitsize: u32) -> Result<()> {
        let table = self.table(pk);
        let metadata = metadata_table_name(&self.prefix);
        let mut tx = self.pool.begin().await?;
        lock::acquire(&mut *tx, lock::namespace::BITSIZE_EXPANSION, pk).await?;

        let row = sqlx::query(&format!(
            "SELECT bitsize FROM {metadata} WHERE partition_key = $1 FOR UPDATE"
        ))
        .bind(pk)
        .fetch_one(&mut *tx)
        .await?;
        let current: i32 = row
            .try_get::<Option<i32>, _>("bitsize")?
            .unwrap_or(self.default_bitsize as i32);
        let current = current as u32;

        if min_bitsize > current {
            let pad = min_bitsize - current;
            sqlx::query(&format!(
                "UPDATE {table} SET bits = bits || repeat('0', {pad})::bit varying"
            ))
            .execute(&mut *tx)
            .await?;
            sqlx::query(&format!(
                "UPDATE {metadata} SET bitsize = $1 WHERE partition_key = $2"
            ))
            .bind(min_bitsize as i32)
            .bind(pk)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn bits_to_values(bits: &str) -> Vec<PartitionValue> {
        bits.chars()
            .enumerate()
            .filter(|(_, c)| *c == '1')
            .map(|(i, _)| PartitionValue::Integer(i as i64))
            .collect()
    }

    fn values_to_bits(values: &[PartitionValue], bitsize: u32) -> Result<String> {
        let mut bits = vec!['0'; bitsize as usize];
        for v in values {
            let idx = v.as_integer()?;
            if idx < 0 || idx as u32 >= bitsize {
                return Err(CacheError::CapacityExceeded {
                    partition_key: String::new(),
                    value: idx,
                    bitsize,
                });
            }
            bits[idx as usize] = '1';
        }
        Ok(bits.into_iter().collect())
    }
}

#[async_trait]
impl CacheBackend for BitBackend {
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
                bits BIT VARYING,
                is_null BOOLEAN NOT NULL DEFAULT false,
                status TEXT NOT NULL DEFAULT 'ok',
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now()
            )"
        );
        relational::register_partition_key(
            &self.pool,
            &self.prefix,
            pk,
            datatype,
            Some(self.default_bitsize),
            &create_sql,
        )
        .await
    }

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let max_index = values
            .iter()
            .map(|v| v.as_integer())
            .collect::<partitioncache_core::Result<Vec<i64>>>()?
            .into_iter()
            .max();
        if let Some(max_index) = max_index {
            if max_index >= 0 {
                self.ensure_bitsize(pk, (max_index as u32) + 1).await?;
            }
        }
        let bitsize = self.bitsize_of(pk).await?;
        let bitstring = Self::values_to_bits(values, bitsize).map_err(|e| match e {
            CacheError::CapacityExceeded { value, bitsize, .. } => CacheError::CapacityExceeded {
                partition_key: pk.to_string(),
                value,
                bitsize,
            },
            other => other,
        })?;
        let table = self.table(pk);
        sqlx::query(&format!(
            "INSERT INTO {table} (query_hash, bits, is_null, last_seen)
             VALUES ($1, $2::bit varying, false, now())
             ON CONFLICT (query_hash) DO UPDATE SET bits = EXCLUDED.bits, is_null = false, last_seen = now()"
        ))
        .bind(hash.as_str())
        .bind(&bitstring)
        .execute(&self.pool)
        .await?;
        Ok(true)
    }

    async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> Result<bool> {
        Err(CacheError::InvalidArgument(
            "bit backend does not support set_lazy".to_string(),
        ))
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        let table = self.table(pk);
        let row = sqlx::query(&format!(
            "SELECT bits::text AS bits, is_null FROM {table} WHERE query_hash = $1"
        ))
        .bind(hash.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let is_null: bool = row.try_get("is_null")?;
        if is_null {
            return Ok(None);
        }
        let bits: String = row.try_get("bits")?;
        Ok(Some(Self::bits_to_values(&bits)))
    }

    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)> {
        let table = self.table(pk);
        let mut bitstrings = Vec::new();
        for hash in hashes {
            let row = sqlx::query(&format!(
                "SELECT bits::text AS bits FROM {table} WHERE query_hash = $1 AND is_null = false"
            ))
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await?;
            if let Some(row) = row {
                let bits: String = row.try_get("bits")?;
                bitstrings.push(bits);
            }
        }
        let hits = bitstrings.len();
        if bitstrings.is_empty() {
            return Ok((None, 0));
        }
        let width = bitstrings.iter().map(|b| b.len()).max().unwrap_or(0);
        let mut result = vec!['1'; width];
        for bits in &bitstrings {
            let chars: Vec<char> = bits.chars().collect();
            for (i, r) in result.iter_mut().enumerate() {
                let c = chars.get(i).copied().unwrap_or('0');
                if c != '1' {
                    *r = '0';
                }
            }
        }
        let values = Self::bits_to_values(&result.into_iter().collect::<String>());
        Ok((Some(values), hits))
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
            "SELECT generate_series(0, length(agg.bits) - 1) AS v
             FROM (SELECT BIT_AND(bits) AS bits FROM {table} WHERE query_hash IN ({})) AS agg
             WHERE get_bit(agg.bits, generate_series(0, length(agg.bits) - 1)) = 1",
            list.join(", ")
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
            "INSERT INTO {table} (query_hash, bits, is_null, last_seen)
             VALUES ($1, NULL, true, now())
             ON CONFLICT (query_hash) DO UPDATE SET bits = NULL, is_null = true, last_seen = now()"
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
    fn expansion_is_strict_less_than() {
        let values = vec![PartitionValue::Integer(5)];
        assert!(BitBackend::values_to_bits(&values, 5).is_err());
        assert!(BitBackend::values_to_bits(&values, 6).is_ok());
    }

    #[test]
    fn round_trips_through_bitstring() {
        let values = vec![
            PartitionValue::Integer(1),
            PartitionValue::Integer(3),
            PartitionValue::Integer(7),
        ];
        let bits = BitBackend::values_to_bits(&values, 8).unwrap();
        let mut decoded = BitBackend::bits_to_values(&bits);
        decoded.sort_by_key(|v| v.as_integer().unwrap());
        assert_eq!(decoded, values);
    }
}
