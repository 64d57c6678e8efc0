//! `Set` backend (§4.2): each fragment's partition values as a native Redis
//! set, one key per `(partition_key, hash)`. Supports `Integer` and `Text`
//! partition keys, matching `backend_supports("set_kv", _)`.

use crate::error::{CacheError, Result};
use crate::kv::{self, cache_key, query_key};
use crate::CacheBackend;
use async_trait::async_trait;
use partitioncache_core::{CacheStatus, Datatype, FragmentHash, PartitionValue};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::RwLock;

pub const BACKEND_ID: &str = "set_kv";

pub struct SetBackend {
    pool: deadpool_redis::Pool,
    datatypes: RwLock<HashMap<String, Datatype>>,
}

impl SetBackend {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self {
            pool,
            datatypes: RwLock::new(HashMap::new()),
        }
    }

    async fn datatype_of(&self, pk: &str) -> Result<Datatype> {
        if let Some(dt) = self.datatypes.read().unwrap().get(pk) {
            return Ok(*dt);
        }
        let mut conn = kv::connection(&self.pool).await?;
        let raw: Option<String> = conn.get(kv::metadata_key(pk)).await?;
        let dt: Datatype = raw
            .ok_or_else(|| CacheError::InvalidArgument(format!("partition key '{pk}' is not registered")))?
            .parse()
            .map_err(|_| CacheError::InvalidArgument(format!("corrupt datatype record for '{pk}'")))?;
        self.datatypes.write().unwrap().insert(pk.to_string(), dt);
        Ok(dt)
    }

    fn encode(values: &[PartitionValue]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn decode(raw: Vec<String>, datatype: Datatype) -> Result<Vec<PartitionValue>> {
        raw.into_iter()
            .map(|s| match datatype {
                Datatype::Integer => s
                    .parse::<i64>()
                    .map(PartitionValue::Integer)
                    .map_err(|_| CacheError::InvalidArgument(format!("non-integer member '{s}' in set_kv entry"))),
                Datatype::Text => Ok(PartitionValue::Text(s)),
                other => Err(CacheError::DatatypeUnsupported {
                    backend: BACKEND_ID.to_string(),
                    datatype: other,
                }),
            })
            .collect()
    }
}

#[async_trait]
impl CacheBackend for SetBackend {
    fn backend_id(&self) -> &'static str {
        BACKEND_ID
    }

    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()> {
        kv::check_or_record_datatype(&self.pool, BACKEND_ID, pk, datatype).await?;
        self.datatypes.write().unwrap().insert(pk.to_string(), datatype);
        Ok(())
    }

    // `partitions()` below intentionally prefers the shared Redis-side
    // record over this in-memory cache, which only exists to skip a round
    // trip on the read/write path, not to double as the source of truth.

    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool> {
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let _: () = conn.del(&key).await?;
        let members = Self::encode(values);
        if !members.is_empty() {
            let _: () = conn.sadd(&key, members).await?;
        } else {
            // an empty set still needs to exist so `exists` is true; Redis
            // has no empty-set representation, so use a placeholder member
            // the decode path strips back out.
            let _: () = conn.sadd(&key, "__empty__").await?;
            let _: () = conn.srem(&key, "__empty__").await?;
            let _: () = conn.set(format!("{key}:present"), 1).await?;
        }
        Ok(true)
    }

    async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> Result<bool> {
        Err(CacheError::InvalidArgument(
            "set_kv has no co-located SQL engine to run set_lazy against".to_string(),
        ))
    }

    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>> {
        if self.is_null(hash, pk).await? {
            return Ok(None);
        }
        if !self.exists(hash, pk).await? {
            return Ok(None);
        }
        let datatype = self.datatype_of(pk).await?;
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let members: Vec<String> = conn.smembers(&key).await?;
        Ok(Some(Self::decode(members, datatype)?))
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
        let datatype = self.datatype_of(pk).await?;
        let mut conn = kv::connection(&self.pool).await?;
        let keys: Vec<String> = existing.iter().map(|h| cache_key(pk, h.as_str())).collect();
        let members: Vec<String> = conn.sinter(keys).await?;
        Ok((Some(Self::decode(members, datatype)?), hits))
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
        let placeholder_present: bool = conn.exists(format!("{key}:present")).await?;
        let is_null: bool = conn.exists(format!("{key}:null")).await?;
        Ok(placeholder_present || is_null)
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
        let mut conn = kv::connection(&self.pool).await?;
        let key = cache_key(pk, hash.as_str());
        let existed = self.exists(hash, pk).await?;
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
