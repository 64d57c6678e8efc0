//! Two durable FIFO queues — original queries and fragments — behind one
//! `Queue` contract (§4.3), with a relational implementation for the
//! in-database pipeline executor and a key-value implementation for
//! client-side pollers.
//!
//! Grounded on `other_examples/…Xevion-banner…jobs.rs.rs`'s job-queue shape:
//! `FOR UPDATE SKIP LOCKED` for non-blocking pop, an atomic
//! conditional-update for retry/priority bumps.

pub mod error;
pub mod postgres;
pub mod redis_queue;

pub use error::{QueueError, Result};
pub use postgres::PostgresQueue;
pub use redis_queue::RedisQueue;

use async_trait::async_trait;
use partitioncache_core::{Datatype, FragmentHash};
use std::time::Duration;

/// Outcome of a non-blocking upsert (§4.3 "Non-blocking upsert").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    SkippedLocked,
    SkippedConcurrent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginalItem {
    pub query: String,
    pub partition_key: String,
    pub datatype: Datatype,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentItem {
    pub fragment_text: String,
    pub hash: FragmentHash,
    pub partition_key: String,
    pub datatype: Datatype,
    pub cache_backend_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueLengths {
    pub original: u64,
    pub fragment: u64,
}

/// Shared behavioral contract for both queue substrates (§4.3).
#[async_trait]
pub trait Queue: Send + Sync {
    async fn push_original(&self, query: &str, pk: &str, datatype: Datatype) -> Result<UpsertOutcome>;

    /// Equal-length parallel arrays; `QueueError::InvalidArgument` if they
    /// disagree.
    async fn push_originals_batch(
        &self,
        queries: &[&str],
        pks: &[&str],
        datatypes: &[Datatype],
    ) -> Result<Vec<UpsertOutcome>>;

    /// All fragments in `fragments` share `pk`/`datatype`/`backend_hint`;
    /// returns one outcome per fragment.
    async fn push_fragments(
        &self,
        fragments: &[(String, FragmentHash)],
        pk: &str,
        datatype: Datatype,
        backend_hint: Option<&str>,
    ) -> Result<Vec<UpsertOutcome>>;

    async fn pop_original(&self, timeout: Option<Duration>) -> Result<Option<OriginalItem>>;

    async fn pop_fragment(&self, timeout: Option<Duration>) -> Result<Option<FragmentItem>>;

    async fn lengths(&self) -> Result<QueueLengths>;

    async fn clear_original(&self) -> Result<u64>;

    async fn clear_fragment(&self) -> Result<u64>;

    async fn clear_all(&self) -> Result<(u64, u64)> {
        let original = self.clear_original().await?;
        let fragment = self.clear_fragment().await?;
        Ok((original, fragment))
    }
}

pub(crate) fn check_equal_lengths(lens: &[usize]) -> Result<()> {
    if lens.windows(2).all(|w| w[0] == w[1]) {
        Ok(())
    } else {
        Err(QueueError::InvalidArgument(
            "parallel arrays must have equal length".to_string(),
        ))
    }
}
