//! Advisory-lock helpers shared by the cache, queue and executor crates.
//!
//! Grounded on the teacher's `pg_advisory_xact_lock` migration guard
//! (single global key); generalized here to two-part keys so independent
//! `(partition_key, fragment_hash)` entries, bitsize expansions and queue
//! upserts don't serialize against each other through one shared lock.

use crate::error::Result;
use sqlx::{Executor, Postgres};
use std::hash::{Hash, Hasher};

/// Locks taken for the life of the enclosing transaction never need an
/// explicit unlock; committing or rolling back releases them.
///
/// `namespace` domain-separates unrelated lock spaces (cache writes, bitsize
/// expansion, eviction) from each other; `key` is hashed into the lock's
/// second 32 bits so distinct keys within a namespace don't collide.
fn lock_keys(namespace: i32, key: &str) -> (i32, i32) {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    (namespace, hasher.finish() as i32)
}

pub mod namespace {
    pub const CACHE_ENTRY: i32 = 1;
    pub const BITSIZE_EXPANSION: i32 = 2;
    pub const MIGRATION: i32 = 3;
    pub const QUEUE_UPSERT: i32 = 4;
}

/// Blocks until the advisory lock is acquired. Used for the migration guard
/// and for bitsize expansion, where waiting briefly is acceptable.
pub async fn acquire<'e, E>(executor: E, namespace: i32, key: &str) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    let (a, b) = lock_keys(namespace, key);
    sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
        .bind(a)
        .bind(b)
        .execute(executor)
        .await?;
    Ok(())
}

/// Attempts to acquire the advisory lock without blocking. Returns `false`
/// immediately if another transaction holds it (the non-blocking contract
/// required of queue upsert and cache-write serialization, §4.3/§5).
pub async fn try_acquire<'e, E>(executor: E, namespace: i32, key: &str) -> Result<bool>
where
    E: Executor<'e, Database = Postgres>,
{
    let (a, b) = lock_keys(namespace, key);
    let row: (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1, $2)")
        .bind(a)
        .bind(b)
        .fetch_one(executor)
        .await?;
    Ok(row.0)
}

/// Lock key for a `(partition_key, fragment_hash)` cache entry, shared by
/// the executor and the eviction manager (§5 Shared resource policy).
pub fn cache_entry_key(partition_key: &str, fragment_hash: &str) -> String {
    format!("{partition_key}\u{0}{fragment_hash}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_namespace_separated() {
        let a = lock_keys(namespace::CACHE_ENTRY, "zipcode\u{0}abc");
        let b = lock_keys(namespace::CACHE_ENTRY, "zipcode\u{0}abc");
        assert_eq!(a, b);
        let c = lock_keys(namespace::BITSIZE_EXPANSION, "zipcode\u{0}abc");
        assert_ne!(a, c);
    }
}
