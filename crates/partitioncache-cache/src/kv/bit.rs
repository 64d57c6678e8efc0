//! `Bit` backend (§4.2, key-value substrate): each fragment's partition
//! values as a Redis string manipulated with `SETBIT`/`GETBIT`, intersected
//! with `BITOP AND`. Unlike [`bit_pg`][crate::relational::bit], Redis
//! strings grow on `SETBIT` automatically, so there is no explicit
//! bitsize-expansion step here — the string is simply as wide as its
//! highest set bit requires.

use crate::error::{CacheError, Result};
use crate::kv::{self, cache_key, query_key};
use crate::CacheBackend;
use async_trait::async_trait;
use partitioncache_core::{CacheStatus, Datatype, FragmentHash, PartitionValue};
use redis::AsyncCommands;

pub const BACKEND_ID: &str = "bit_kv";

pub struct BitKvBackend {
    pool: deadpool_redis::Pool,
}

impl BitKvBackend {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }

    fn bytes_to_values(bytes: &[u8]) -> Vec<PartitionValue> {
        let mut out = Vec::new();
        for (byte_idx, byte) in bytes.iter().enumerate() {
            for bit in 0..8 {
                if byte & (0x80 >> bit) != 0 {
                    out.push(PartitionValue::Integer((byte_idx * 8 + bit) as i64));
                }
            }
        }
        out
    }
}

#[async_trait]
impl CacheBackend for BitKvBackend {
    fn backend_id(&self) -> &'static str {
        BACKEND_ID
    }

    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()> {
        kv::check_or_record_datatype(&self.pool, BACKEND_ID, pk, datatype).await
    }

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let _: () = conn.del(&key).await?;
        for v in values {
            let idx = v.as_integer()?;
            if idx < 0 {
                return Err(CacheError::InvalidArgument(format!(
                    "bit_kv requires non-negative partition values, got {idx}"
                )));
            }
            let _: () = conn.setbit(&key, idx as usize, true).await?;
        }
        if values.is_empty() {
            let _: () = conn.set(format!("{key}:present"), 1).await?;
        }
        Ok(true)
    }

    async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> Result<bool> {
        Err(CacheError::InvalidArgument(
            "bit_kv has no co-located SQL engine to run set_lazy against".to_string(),
        ))
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        if self.is_null(hash, pk).await? {
            return Ok(None);
        }
        if !self.exists(hash, pk).await? {
            return Ok(None);
        }
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let bytes: Vec<u8> = conn.get(&key).await?;
        Ok(Some(Self::bytes_to_values(&bytes)))
    }

    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)> {
        let existing = self.filter_existing(hashes, pk).await?;
        let hits = existing.len();
        if existing.is_empty() {
            return Ok((None, 0));
        }
        let mut conn = kv::connection(&self.pool).await?;
        let dest = format!("_bitop_tmp:{pk}:{}", hash_of_hashes(&existing));
        let keys: Vec<String> = existing.iter().map(|h| cache_key(pk, h.as_str())).collect();
        let _: () = redis::cmd("BITOP")
            .arg("AND")
            .arg(&dest)
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        let bytes: Vec<u8> = conn.get(&dest).await.unwrap_or_default();
        let _: () = conn.del(&dest).await?;
        Ok((Some(Self::bytes_to_values(&bytes)), hits))
    }

    async fn get_intersected_lazy(&self, _hashes: &[FragmentHash], _pk: &str) -> Result<(Option<String>, usize)> {
        Ok((None, 0))
    }

    async fn exists(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let present: bool = conn.exists(&key).await?;
        if present {
            return Ok(true);
        }
        let placeholder: bool = conn.exists(format!("{key}:present")).await?;
        let is_null: bool = conn.exists(format!("{key}:null")).await?;
        Ok(placeholder || is_null)
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
        let existed = self.exists(hash, pk).await?;
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let _: () = conn.del(&key).await?;
        let _: () = conn.del(format!("{key}:present")).await?;
        let _: () = conn.del(format!("{key}:null")).await?;
        Ok(existed)
    }

    async fn set_null(&self, hash: &FragmentHash, pk: &str) -> Result<()> {
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let _: () = conn.del(&key).await?;
        let _: () = conn.del(format!("{key}:present")).await?;
        let _: () = conn.set(format!("{key}:null"), 1).await?;
        Ok(())
    }

    async fn is_null(&self, hash: &FragmentHash, pk: &str) -> Result<bool> {
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        Ok(conn.exists(format!("{key}:null")).await?)
    }

    async fn set_status(&self, hash: &FragmentHash, pk: &str, status: CacheStatus) -> Result<()> {
        let mut conn = kv::connection(&self.pool).await?;
        let _: () = conn
            .hset(query_key(pk, hash.as_str()), "status", status.as_str())
            .await?;
        Ok(())
    }

    async fn get_status(&self, hash: &FragmentHash, pk: &str) -> Result<Option<CacheStatus>> {
        let mut conn = kv::connection(&self.pool).await?;
        let raw: Option<String> = conn.hget(query_key(pk, hash.as_str()), "status").await?;
        Ok(raw.and_then(|s| CacheStatus::parse(&s)))
    }

    async fn set_query(&self, hash: &FragmentHash, text: &str, pk: &str) -> Result<()> {
        let mut conn = kv::connection(&self.pool).await?;
        let _: () = conn.hset(query_key(pk, hash.as_str()), "text", text).await?;
        Ok(())
    }

    async fn get_query(&self, hash: &FragmentHash, pk: &str) -> Result<Option<String>> {
        let mut conn = kv::connection(&self.pool).await?;
        Ok(conn.hget(query_key(pk, hash.as_str()), "text").await?)
    }

    async fn list_queries(&self, pk: &str) -> Result<Vec<(FragmentHash, String)>> {
        let keys = kv::scan_cache_keys(&self.pool, pk).await?;
        let mut conn = kv::connection(&self.pool).await?;
        let mut out = Vec::new();
        let prefix = kv::cache_key_prefix(pk);
        for key in keys {
            let hash = key.trim_start_matches(&prefix).to_string();
            let text: Option<String> = conn.hget(query_key(pk, &hash), "text").await?;
            if let Some(text) = text {
                out.push((FragmentHash::from_hex(hash), text));
            }
        }
        Ok(out)
    }

    async fn partitions(&self) -> Result<Vec<(String, Datatype)>> {
        kv::list_partitions(&self.pool).await
    }
}

fn hash_of_hashes(hashes: &[FragmentHash]) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    hashes.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}
