//! Key-value `Queue` implementation (§4.3 "Provider parity"): for
//! client-side pollers rather than the in-database executor. Entries live
//! in a Redis list (`FIFO` order via `RPUSH`/`LPOP`) with a companion hash
//! tracking priority and payload per key, so a duplicate push can bump
//! priority without a second list entry — Redis's single-threaded command
//! execution makes each hash read-modify-write atomic without an explicit
//! lock, which is what stands in for the relational side's `SKIP LOCKED`.

use crate::error::Result;
use crate::{check_equal_lengths, FragmentItem, OriginalItem, Queue, QueueLengths, UpsertOutcome};
use async_trait::async_trait;
use partitioncache_core::{Datatype, FragmentHash};
use redis::AsyncCommands;
use std::time::Duration;

const ORIGINAL_LIST: &str = "queue:original:order";
const ORIGINAL_HASH: &str = "queue:original:items";
const FRAGMENT_LIST: &str = "queue:fragment:order";
const FRAGMENT_HASH: &str = "queue:fragment:items";

fn original_member(query: &str, pk: &str) -> String {
    format!("{pk}\u{0}{query}")
}

fn fragment_member(hash: &str, pk: &str) -> String {
    format!("{pk}\u{0}{hash}")
}

pub struct RedisQueue {
    pool: deadpool_redis::Pool,
}

impl RedisQueue {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl Queue for RedisQueue {
    async fn push_original(&self, query: &str, pk: &str, datatype: Datatype) -> Result<UpsertOutcome> {
        let mut conn = self.connection().await?;
        let member = original_member(query, pk);
        let existing: Option<String> = conn.hget(ORIGINAL_HASH, &member).await?;
        match existing {
            Some(payload) => {
                let priority = payload
                    .rsplit('\u{0}')
                    .next()
                    .and_then(|p| p.parse::<i64>().ok())
                    .unwrap_or(1)
                    + 1;
                let new_payload = format!("{}\u{0}{}\u{0}{priority}", query, datatype.as_str());
                let _: () = conn.hset(ORIGINAL_HASH, &member, new_payload).await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let payload = format!("{}\u{0}{}\u{0}1", query, datatype.as_str());
                let _: () = conn.hset(ORIGINAL_HASH, &member, payload).await?;
                let _: () = conn.rpush(ORIGINAL_LIST, &member).await?;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn push_originals_batch(
        &self,
        queries: &[&str],
        pks: &[&str],
        datatypes: &[Datatype],
    ) -> Result<Vec<UpsertOutcome>> {
        check_equal_lengths(&[queries.len(), pks.len(), datatypes.len()])?;
        let mut out = Vec::with_capacity(queries.len());
        for ((query, pk), datatype) in queries.iter().zip(pks).zip(datatypes) {
            out.push(self.push_original(query, pk, *datatype).await?);
        }
        Ok(out)
    }

    async fn push_fragments(
        &self,
        fragments: &[(String, FragmentHash)],
        pk: &str,
        datatype: Datatype,
        backend_hint: Option<&str>,
    ) -> Result<Vec<UpsertOutcome>> {
        let mut out = Vec::with_capacity(fragments.len());
        let mut conn = self.connection().await?;
        for (text, hash) in fragments {
            let member = fragment_member(hash.as_str(), pk);
            let existing: Option<String> = conn.hget(FRAGMENT_HASH, &member).await?;
            let outcome = match existing {
                Some(payload) => {
                    let priority = payload
                        .rsplit('\u{0}')
                        .next()
                        .and_then(|p| p.parse::<i64>().ok())
                        .unwrap_or(1)
                        + 1;
                    let new_payload = format!(
                        "{}\u{0}{}\u{0}{}\u{0}{priority}",
                        text,
                        datatype.as_str(),
                        backend_hint.unwrap_or("")
                    );
                    let _: () = conn.hset(FRAGMENT_HASH, &member, new_payload).await?;
                    UpsertOutcome::Updated
                }
                None => {
                    let payload = format!(
                        "{}\u{0}{}\u{0}{}\u{0}1",
                        text,
                        datatype.as_str(),
                        backend_hint.unwrap_or("")
                    );
                    let _: () = conn.hset(FRAGMENT_HASH, &member, payload).await?;
                    let _: () = conn.rpush(FRAGMENT_LIST, &member).await?;
                    UpsertOutcome::Inserted
                }
            };
            out.push(outcome);
        }
        Ok(out)
    }

    async fn pop_original(&self, timeout: Option<Duration>) -> Result<Option<OriginalItem>> {
        let mut conn = self.connection().await?;
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            let member: Option<String> = conn.lpop(ORIGINAL_LIST, None).await?;
            if let Some(member) = member {
                let payload: Option<String> = conn.hget(ORIGINAL_HASH, &member).await?;
                let _: () = conn.hdel(ORIGINAL_HASH, &member).await?;
                let Some(payload) = payload else { continue };
                let mut parts = payload.splitn(3, '\u{0}');
                let query = parts.next().unwrap_or_default().to_string();
                let datatype = parts.next().unwrap_or("text").parse::<Datatype>().unwrap_or(Datatype::Text);
                let partition_key = member.split('\u{0}').next().unwrap_or_default().to_string();
                return Ok(Some(OriginalItem {
                    query,
                    partition_key,
                    datatype,
                }));
            }
            match deadline {
                Some(deadline) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn pop_fragment(&self, timeout: Option<Duration>) -> Result<Option<FragmentItem>> {
        let mut conn = self.connection().await?;
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            let member: Option<String> = conn.lpop(FRAGMENT_LIST, None).await?;
            if let Some(member) = member {
                let payload: Option<String> = conn.hget(FRAGMENT_HASH, &member).await?;
                let _: () = conn.hdel(FRAGMENT_HASH, &member).await?;
                let Some(payload) = payload else { continue };
                let mut parts = payload.splitn(4, '\u{0}');
                let fragment_text = parts.next().unwrap_or_default().to_string();
                let datatype = parts.next().unwrap_or("text").parse::<Datatype>().unwrap_or(Datatype::Text);
                let backend_hint = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
                let mut member_parts = member.splitn(2, '\u{0}');
                let partition_key = member_parts.next().unwrap_or_default().to_string();
                let hash_hex = member_parts.next().unwrap_or_default().to_string();
                return Ok(Some(FragmentItem {
                    fragment_text,
                    hash: FragmentHash::from_hex(hash_hex),
                    partition_key,
                    datatype,
                    cache_backend_hint: backend_hint,
                }));
            }
            match deadline {
                Some(deadline) if std::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                _ => return Ok(None),
            }
        }
    }

    async fn lengths(&self) -> Result<QueueLengths> {
        let mut conn = self.connection().await?;
        let original: u64 = conn.llen(ORIGINAL_LIST).await?;
        let fragment: u64 = conn.llen(FRAGMENT_LIST).await?;
        Ok(QueueLengths { original, fragment })
    }

    async fn clear_original(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.llen(ORIGINAL_LIST).await?;
        let _: () = conn.del(ORIGINAL_LIST).await?;
        let _: () = conn.del(ORIGINAL_HASH).await?;
        Ok(len)
    }

    async fn clear_fragment(&self) -> Result<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = conn.llen(FRAGMENT_LIST).await?;
        let _: () = conn.del(FRAGMENT_LIST).await?;
        let _: () = conn.del(FRAGMENT_HASH).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_member_round_trips_pk_and_hash() {
        let member = fragment_member("abc123", "account_id");
        let mut parts = member.splitn(2, '\u{0}');
        assert_eq!(parts.next(), Some("account_id"));
        assert_eq!(parts.next(), Some("abc123"));
    }

    #[test]
    fn original_member_round_trips_pk_and_query() {
        let member = original_member("select 1", "account_id");
        let mut parts = member.splitn(2, '\u{0}');
        assert_eq!(parts.next(), Some("account_id"));
        assert_eq!(parts.next(), Some("select 1"));
    }
}
