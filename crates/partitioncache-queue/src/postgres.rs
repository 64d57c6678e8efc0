//! Relational `Queue` implementation: one row per distinct `(query, pk)` or
//! `(hash, pk)`, non-blocking upsert via `SELECT ... FOR UPDATE SKIP LOCKED`
//! plus `INSERT ... ON CONFLICT DO NOTHING`, non-blocking pop via the same
//! `SKIP LOCKED` pattern followed by delete.
//!
//! Grounded directly on `other_examples/…Xevion-banner…jobs.rs.rs`'s
//! `fetch_and_lock_job` (`FOR UPDATE SKIP LOCKED`, oldest-first) and
//! `unlock_and_increment_retry` (atomic conditional update inside the same
//! transaction that took the lock).

use crate::error::{QueueError, Result};
use crate::{check_equal_lengths, FragmentItem, OriginalItem, Queue, QueueLengths, UpsertOutcome};
use async_trait::async_trait;
use partitioncache_core::{Datatype, FragmentHash};
use sqlx::{PgPool, Row};
use std::time::Duration;

pub struct PostgresQueue {
    pool: PgPool,
    prefix: String,
}

impl PostgresQueue {
    pub fn new(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    fn original_table(&self) -> String {
        format!("{}_queue_original", self.prefix)
    }

    fn fragment_table(&self) -> String {
        format!("{}_queue_fragment", self.prefix)
    }

    pub async fn ensure_tables(&self) -> Result<()> {
        let original = self.original_table();
        let fragment = self.fragment_table();
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {original} (
                query_text TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                datatype TEXT NOT NULL,
                priority INT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (query_text, partition_key)
            )"
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {fragment} (
                fragment_hash TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                fragment_text TEXT NOT NULL,
                datatype TEXT NOT NULL,
                cache_backend_hint TEXT,
                priority INT NOT NULL DEFAULT 1,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_seen TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (fragment_hash, partition_key)
            )"
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// The non-blocking upsert shared by every `push_*` call: try to lock
    /// the existing row without blocking; bump priority if we got it; tell
    /// the caller apart `skipped_locked` (someone else holds it) from
    /// `skipped_concurrent` (a concurrent insert beat us to it).
    async fn upsert_original(&self, query: &str, pk: &str, datatype: Datatype) -> Result<UpsertOutcome> {
        let table = self.original_table();
        let mut tx = self.pool.begin().await?;
        let locked = sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE query_text = $1 AND partition_key = $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(query)
        .bind(pk)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_some() {
            sqlx::query(&format!(
                "UPDATE {table} SET priority = priority + 1, last_seen = now()
                 WHERE query_text = $1 AND partition_key = $2"
            ))
            .bind(query)
            .bind(pk)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(UpsertOutcome::Updated);
        }

        let exists = sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE query_text = $1 AND partition_key = $2"
        ))
        .bind(query)
        .bind(pk)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            tx.rollback().await?;
            return Ok(UpsertOutcome::SkippedLocked);
        }

        let result = sqlx::query(&format!(
            "INSERT INTO {table} (query_text, partition_key, datatype)
             VALUES ($1, $2, $3)
             ON CONFLICT (query_text, partition_key) DO NOTHING"
        ))
        .bind(query)
        .bind(pk)
        .bind(datatype.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(if result.rows_affected() == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::SkippedConcurrent
        })
    }

    async fn upsert_fragment(
        &self,
        fragment_text: &str,
        hash: &FragmentHash,
        pk: &str,
        datatype: Datatype,
        backend_hint: Option<&str>,
    ) -> Result<UpsertOutcome> {
        let table = self.fragment_table();
        let mut tx = self.pool.begin().await?;
        let locked = sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE fragment_hash = $1 AND partition_key = $2 FOR UPDATE SKIP LOCKED"
        ))
        .bind(hash.as_str())
        .bind(pk)
        .fetch_optional(&mut *tx)
        .await?;

        if locked.is_some() {
            sqlx::query(&format!(
                "UPDATE {table} SET priority = priority + 1, last_seen = now()
                 WHERE fragment_hash = $1 AND partition_key = $2"
            ))
            .bind(hash.as_str())
            .bind(pk)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(UpsertOutcome::Updated);
        }

        let exists = sqlx::query(&format!(
            "SELECT 1 FROM {table} WHERE fragment_hash = $1 AND partition_key = $2"
        ))
        .bind(hash.as_str())
        .bind(pk)
        .fetch_optional(&mut *tx)
        .await?;
        if exists.is_some() {
            tx.rollback().await?;
            return Ok(UpsertOutcome::SkippedLocked);
        }

        let result = sqlx::query(&format!(
            "INSERT INTO {table} (fragment_hash, partition_key, fragment_text, datatype, cache_backend_hint)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (fragment_hash, partition_key) DO NOTHING"
        ))
        .bind(hash.as_str())
        .bind(pk)
        .bind(fragment_text)
        .bind(datatype.as_str())
        .bind(backend_hint)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(if result.rows_affected() == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::SkippedConcurrent
        })
    }

    async fn try_pop_original_once(&self) -> Result<Option<OriginalItem>> {
        let table = self.original_table();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT query_text, partition_key, datatype FROM {table}
             ORDER BY priority DESC, created_at ASC
             LIMIT 1 FOR UPDATE SKIP LOCKED"
        ))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let query_text: String = row.try_get("query_text")?;
        let partition_key: String = row.try_get("partition_key")?;
        let datatype: String = row.try_get("datatype")?;
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE query_text = $1 AND partition_key = $2"
        ))
        .bind(&query_text)
        .bind(&partition_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        let datatype: Datatype = datatype
            .parse()
            .map_err(|_| QueueError::InvalidArgument("corrupt datatype in queue row".to_string()))?;
        Ok(Some(OriginalItem {
            query: query_text,
            partition_key,
            datatype,
        }))
    }

    async fn try_pop_fragment_once(&self) -> Result<Option<FragmentItem>> {
        let table = self.fragment_table();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "SELECT fragment_hash, partition_key, fragment_text, datatype, cache_backend_hint
             FROM {table}
             ORDER BY priority DESC, created_at ASC
             LIMIT 1 FOR UPDATE SKIP LOCKED"
        ))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let fragment_hash: String = row.try_get("fragment_hash")?;
        let partition_key: String = row.try_get("partition_key")?;
        let fragment_text: String = row.try_get("fragment_text")?;
        let datatype: String = row.try_get("datatype")?;
        let cache_backend_hint: Option<String> = row.try_get("cache_backend_hint")?;
        sqlx::query(&format!(
            "DELETE FROM {table} WHERE fragment_hash = $1 AND partition_key = $2"
        ))
        .bind(&fragment_hash)
        .bind(&partition_key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        let datatype: Datatype = datatype
            .parse()
            .map_err(|_| QueueError::InvalidArgument("corrupt datatype in queue row".to_string()))?;
        Ok(Some(FragmentItem {
            fragment_text,
            hash: FragmentHash::from_hex(fragment_hash),
            partition_key,
            datatype,
            cache_backend_hint,
        }))
    }
}

#[async_trait]
impl Queue for PostgresQueue {
    async fn push_original(&self, query: &str, pk: &str, datatype: Datatype) -> Result<UpsertOutcome> {
        self.upsert_original(query, pk, datatype).await
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
            out.push(self.upsert_original(query, pk, *datatype).await?);
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
        for (text, hash) in fragments {
            out.push(self.upsert_fragment(text, hash, pk, datatype, backend_hint).await?);
        }
        Ok(out)
    }

    async fn pop_original(&self, timeout: Option<Duration>) -> Result<Option<OriginalItem>> {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            if let Some(item) = self.try_pop_original_once().await? {
                return Ok(Some(item));
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
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        loop {
            if let Some(item) = self.try_pop_fragment_once().await? {
                return Ok(Some(item));
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
        let original_table = self.original_table();
        let fragment_table = self.fragment_table();
        let original: (i64,) = sqlx::query_as(&format!("SELECT count(*) FROM {original_table}"))
            .fetch_one(&self.pool)
            .await?;
        let fragment: (i64,) = sqlx::query_as(&format!("SELECT count(*) FROM {fragment_table}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(QueueLengths {
            original: original.0 as u64,
            fragment: fragment.0 as u64,
        })
    }

    async fn clear_original(&self) -> Result<u64> {
        let table = self.original_table();
        let result = sqlx::query(&format!("DELETE FROM {table}")).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn clear_fragment(&self) -> Result<u64> {
        let table = self.fragment_table();
        let result = sqlx::query(&format!("DELETE FROM {table}")).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
