//! `RoaringBit` backend (§4.2, key-value substrate): each fragment's
//! partition values as a serialized Roaring bitmap stored in a single Redis
//! string, mirroring [`roaring_pg`][crate::relational::roaring_bit] but
//! with the bitmap bytes as the whole value of a plain key instead of a
//! column.

use crate::error::{CacheError, Result};
use crate::kv::{self, cache_key, query_key};
use crate::CacheBackend;
use async_trait::async_trait;
use partitioncache_core::{CacheStatus, Datatype, FragmentHash, PartitionValue};
use redis::AsyncCommands;
use roaring::RoaringBitmap;

pub const BACKEND_ID: &str = "roaring_kv";

pub struct RoaringKvBackend {
    pool: deadpool_redis::Pool,
}

impl RoaringKvBackend {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }

    fn encode(values: &[PartitionValue]) -> Result<Vec<u8>> {
        let mut bitmap = RoaringBitmap::new();
        for v in values {
            let i = v.as_integer()?;
            let i: u32 = i
                .try_into()
                .map_err(|_| CacheError::InvalidArgument(format!("value {i} out of u32 range for roaring_kv")))?;
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

    fn to_values(bitmap: &RoaringBitmap) -> Vec<PartitionValue> {
        bitmap.iter().map(|v| PartitionValue::Integer(v as i64)).collect()
    }
}

#[async_trait]
impl CacheBackend for RoaringKvBackend {
    fn backend_id(&self) -> &'static str {
        BACKEND_ID
    }

    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()> {
        kv::check_or_record_datatype(&self.pool, BACKEND_ID, pk, datatype).await
    }

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let bytes = Self::encode(values)?;
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let _: () = conn.set(&key, bytes).await?;
        Ok(true)
    }

    async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> Result<bool> {
        Err(CacheError::InvalidArgument(
            "roaring_kv has no co-located SQL engine to run set_lazy against".to_string(),
        ))
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        if self.is_null(hash, pk).await? {
            return Ok(None);
        }
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let bytes: Option<Vec<u8>> = conn.get(&key).await?;
        match bytes {
            Some(bytes) => Ok(Some(Self::to_values(&Self::decode(&bytes)?))),
            None => Ok(None),
        }
    }

    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)> {
        let mut bitmaps = Vec::new();
        let mut conn = kv::connection(&self.pool).await?;
        for hash in hashes {
            let key = cache_key(pk, hash.as_str());
            let bytes: Option<Vec<u8>> = conn.get(&key).await?;
            if let Some(bytes) = bytes {
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
        Ok((Some(Self::to_values(&acc)), hits))
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
        Ok(conn.exists(format!("{key}:null")).await?)
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
        let _: () = conn.del(format!("{key}:null")).await?;
        Ok(existed)
    }

    async fn set_null(&self, hash: &FragmentHash, pk: &str) -> Result<()> {
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let _: () = conn.del(&key).await?;
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bitmap_bytes() {
        let values = vec![PartitionValue::Integer(2), PartitionValue::Integer(9)];
        let bytes = RoaringKvBackend::encode(&values).unwrap();
        let bitmap = RoaringKvBackend::decode(&bytes).unwrap();
        let mut decoded = RoaringKvBackend::to_values(&bitmap);
        decoded.sort_by_key(|v| v.as_integer().unwrap());
        assert_eq!(decoded, values);
    }
}
