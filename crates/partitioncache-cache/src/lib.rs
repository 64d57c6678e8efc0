//! Pluggable per-partition cache backends (§4.2): a uniform async contract
//! over five storage variants across two substrates — relational (Postgres,
//! one table per partition key) and key-value (Redis, namespaced keys).
//!
//! The contract is a capability set, not an inheritance hierarchy (§9
//! "Polymorphic backends"): every variant below implements the same
//! [`CacheBackend`] trait with its own storage representation and its own
//! supported-datatype set, and callers pick a concrete backend by id through
//! [`backend_id`][CacheBackend::backend_id], not by type.

pub mod error;
pub mod kv;
pub mod relational;

pub use error::{CacheError, Result};

use async_trait::async_trait;
use partitioncache_core::{CacheStatus, Datatype, FragmentHash, PartitionValue};

/// The uniform contract every cache backend variant implements (§4.2).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Stable identifier used by `backend_supports` and job configuration
    /// rows (e.g. `"array_pg"`, `"bit_kv"`).
    fn backend_id(&self) -> &'static str;

    /// Idempotent. Fails with `DatatypeConflict` if `pk` is already
    /// registered with a different datatype, `DatatypeUnsupported` if this
    /// backend cannot represent `datatype`.
    async fn register_partition_key(&self, pk: &str, datatype: Datatype) -> Result<()>;

    /// Full replacement: a second `set` for the same `(hash, pk)` overwrites
    /// rather than merges (§3 "Cache entry" lifecycle).
    async fn set(&self, hash: &FragmentHash, values: &[PartitionValue], pk: &str) -> Result<bool>;

    /// Backends co-located with the source database may execute
    /// `fragment_sql` as part of the write and avoid a client round trip.
    /// Backends without that capability fall back to returning
    /// `InvalidArgument`.
    async fn set_lazy(&self, hash: &FragmentHash, fragment_sql: &str, pk: &str) -> Result<bool>;

    /// `None` for both "not cached" and the null sentinel (§4.2 "Null
    /// sentinel"); use [`is_null`][CacheBackend::is_null] to tell them apart.
    async fn get(&self, hash: &FragmentHash, pk: &str) -> Result<Option<Vec<PartitionValue>>>;

    /// Intersects every present entry among `hashes`. `hits_count` is the
    /// number of hashes that had an entry, independent of whether the
    /// intersection itself is non-empty.
    async fn get_intersected(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<Vec<PartitionValue>>, usize)>;

    /// Like [`get_intersected`][CacheBackend::get_intersected] but returns a
    /// SQL snippet expressing the intersection instead of materializing it.
    /// Backends without a co-located SQL engine return `Ok((None, 0))`.
    async fn get_intersected_lazy(
        &self,
        hashes: &[FragmentHash],
        pk: &str,
    ) -> Result<(Option<String>, usize)>;

    /// `true` for both an ordinary entry and the null sentinel.
    async fn exists(&self, hash: &FragmentHash, pk: &str) -> Result<bool>;

    async fn filter_existing(&self, hashes: &[FragmentHash], pk: &str) -> Result<Vec<FragmentHash>>;

    async fn delete(&self, hash: &FragmentHash, pk: &str) -> Result<bool>;

    /// Marks `(hash, pk)` as "computed; empty result" (distinct from
    /// "not cached").
    async fn set_null(&self, hash: &FragmentHash, pk: &str) -> Result<()>;

    async fn is_null(&self, hash: &FragmentHash, pk: &str) -> Result<bool>;

    async fn set_status(&self, hash: &FragmentHash, pk: &str, status: CacheStatus) -> Result<()>;

    async fn get_status(&self, hash: &FragmentHash, pk: &str) -> Result<Option<CacheStatus>>;

    async fn set_query(&self, hash: &FragmentHash, text: &str, pk: &str) -> Result<()>;

    async fn get_query(&self, hash: &FragmentHash, pk: &str) -> Result<Option<String>>;

    async fn list_queries(&self, pk: &str) -> Result<Vec<(FragmentHash, String)>>;

    async fn partitions(&self) -> Result<Vec<(String, Datatype)>>;
}

/// Intersects sorted value sets the same way every relational array/roaring
/// backend does once the raw sets are in memory: fold with a sorted merge.
/// Shared here so backend modules don't each reimplement it slightly
/// differently.
pub(crate) fn intersect_value_sets(sets: Vec<Vec<PartitionValue>>) -> Vec<PartitionValue> {
    let Some((first, rest)) = sets.split_first() else {
        return Vec::new();
    };
    let mut acc: Vec<PartitionValue> = first.clone();
    for set in rest {
        acc.retain(|v| set.contains(v));
    }
    acc
}
