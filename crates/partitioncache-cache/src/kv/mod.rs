//! Redis-backed cache variants (§4.2): three backends sharing one key
//! namespace scheme instead of one table-per-partition like the relational
//! side — `cache:<pk>:<hash>` for entries, `query:<pk>:<hash>` for the
//! fragment's source text and status, `_partition_metadata:<pk>` for the
//! registered datatype.
//!
//! Grounded on `deadpool-redis`'s pool-handle pattern: every backend holds a
//! `deadpool_redis::Pool` and calls `.get().await` per operation rather than
//! holding a single long-lived connection, the same shape `sqlx::PgPool`
//! gives the relational side.

pub mod bit;
pub mod roaring_bit;
pub mod set;

use crate::error::{CacheError, Result};
use partitioncache_core::Datatype;
use redis::AsyncCommands;

pub fn cache_key(pk: &str, hash: &str) -> String {
    format!("cache:{pk}:{hash}")
}

pub fn query_key(pk: &str, hash: &str) -> String {
    format!("query:{pk}:{hash}")
}

pub fn metadata_key(pk: &str) -> String {
    format!("_partition_metadata:{pk}")
}

pub fn cache_key_prefix(pk: &str) -> String {
    format!("cache:{pk}:")
}

pub(crate) async fn connection(
    pool: &deadpool_redis::Pool,
) -> Result<deadpool_redis::Connection> {
    pool.get().await.map_err(CacheError::from)
}

/// Reads the datatype a partition key was registered with, or registers it
/// if this is the first write. Redis has no schema to consult, so every
/// backend variant stores its own copy of this association and checks it on
/// every `register_partition_key` call.
pub(crate) async fn check_or_record_datatype(
    pool: &deadpool_redis::Pool,
    backend_id: &'static str,
    pk: &str,
    datatype: Datatype,
) -> Result<()> {
    let mut conn = connection(pool).await?;
    let key = metadata_key(pk);
    let existing: Option<String> = conn.get(&key).await?;
    match existing {
        Some(registered) => {
            let registered: Datatype = registered
                .parse()
                .map_err(|_| CacheError::InvalidArgument(format!("corrupt datatype record for '{pk}'")))?;
            if registered != datatype {
                return Err(CacheError::DatatypeConflict {
                    partition_key: pk.to_string(),
                    registered,
                    attempted: datatype,
                });
            }
            Ok(())
        }
        None => {
            if !partitioncache_core::datatype::backend_supports(backend_id, datatype) {
                return Err(CacheError::DatatypeUnsupported {
                    backend: backend_id.to_string(),
                    datatype,
                });
            }
            let _: () = conn.set(&key, datatype.as_str()).await?;
            Ok(())
        }
    }
}

/// Enumerates every hash cached under `pk` by scanning the `cache:<pk>:*`
/// namespace. Used by `list_queries`-adjacent callers and the eviction
/// manager; never used on the hot read/write path.
pub(crate) async fn scan_cache_keys(pool: &deadpool_redis::Pool, pk: &str) -> Result<Vec<String>> {
    let mut conn = connection(pool).await?;
    let pattern = format!("{}*", cache_key_prefix(pk));
    let mut iter = conn.scan_match::<_, String>(&pattern).await?;
    let mut keys = Vec::new();
    while let Some(key) = iter.next_item().await {
        keys.push(key);
    }
    drop(iter);
    Ok(keys)
}

/// Enumerates every partition key any kv backend has registered, by
/// scanning `_partition_metadata:*`. All three kv backends share this
/// namespace, so this lists partitions registered under any of them.
pub(crate) async fn list_partitions(pool: &deadpool_redis::Pool) -> Result<Vec<(String, Datatype)>> {
    let mut conn = connection(pool).await?;
    let mut iter = conn.scan_match::<_, String>("_partition_metadata:*").await?;
    let mut keys = Vec::new();
    while let Some(key) = iter.next_item().await {
        keys.push(key);
    }
    drop(iter);
    let mut out = Vec::new();
    for key in keys {
        let pk = key.trim_start_matches("_partition_metadata:").to_string();
        let raw: Option<String> = conn.get(&key).await?;
        if let Some(raw) = raw {
            if let Ok(dt) = raw.parse::<Datatype>() {
                out.push((pk, dt));
            }
        }
    }
    Ok(out)
}
