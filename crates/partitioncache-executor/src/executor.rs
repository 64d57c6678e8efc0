//! Drains the fragment queue into the cache, bounded by concurrency (§4.4).
//!
//! The dispatch loop is grounded directly on the teacher's
//! `run_tasks_forever`: a bounded `tokio::task::JoinSet`, spawning a new job
//! whenever the set has room and joining the oldest once it's full. Each
//! job's `execute_job` is the teacher's `EveryHourTask::run` shape — do the
//! work, log the outcome — generalized to the optimistic-status /
//! run-then-replace pseudocode of §4.4 instead of view materialization.

use crate::config::JobConfig;
use crate::error::{ExecutorError, Result};
use crate::log;
use crate::source;
use partitioncache_cache::CacheBackend;
use partitioncache_core::{lock, CacheStatus, ExecutionSource};
use partitioncache_queue::{FragmentItem, Queue};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Bundles everything one tick of the pipeline needs: the pool the advisory
/// lock and processor log live on (the database co-located with the queue
/// and cache, per §4.4 "Placement"), the source database fragments run
/// against, and the cache/queue handles for the partition this executor
/// serves.
#[derive(Clone)]
pub struct PipelineExecutor {
    lock_pool: PgPool,
    source_pool: PgPool,
    cache: Arc<dyn CacheBackend>,
    queue: Arc<dyn Queue>,
    config: JobConfig,
}

impl PipelineExecutor {
    pub fn new(
        lock_pool: PgPool,
        source_pool: PgPool,
        cache: Arc<dyn CacheBackend>,
        queue: Arc<dyn Queue>,
        config: JobConfig,
    ) -> Self {
        Self {
            lock_pool,
            source_pool,
            cache,
            queue,
            config,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Runs one fragment job to completion (§4.4 "execute_job"). The cache
    /// write and query-record update happen inside the window where the
    /// `(partition_key, fragment_hash)` advisory lock is held, so a
    /// concurrent eviction of the same entry blocks until this job commits
    /// or fails.
    pub async fn execute_job(&self, item: FragmentItem, source: ExecutionSource) -> Result<()> {
        let job_id = Uuid::new_v4();
        let prefix = &self.config.table_prefix;
        log::ensure_log_table(&self.lock_pool, prefix).await?;
        log::record_started(&self.lock_pool, prefix, job_id, item.hash.as_str(), &item.partition_key, source).await?;
        let started_at = Instant::now();

        // Optimistic: assume success before the fragment has even run, the
        // same way the pseudocode in §4.4 does.
        self.cache.set_status(&item.hash, &item.partition_key, CacheStatus::Ok).await?;

        let mut lock_tx = self.lock_pool.begin().await?;
        lock::acquire(
            &mut *lock_tx,
            lock::namespace::CACHE_ENTRY,
            &lock::cache_entry_key(&item.partition_key, item.hash.as_str()),
        )
        .await?;

        let outcome = source::run_sql(
            &self.source_pool,
            &item.fragment_text,
            item.datatype,
            Duration::from_secs(self.config.timeout_seconds),
        )
        .await;

        match outcome {
            Ok(values) => {
                // Full replacement, never a merge (§4.4 "Idempotency").
                self.cache.set(&item.hash, &values, &item.partition_key).await?;
                self.cache
                    .set_query(&item.hash, &item.fragment_text, &item.partition_key)
                    .await?;
                lock_tx.commit().await?;
                let elapsed_ms = started_at.elapsed().as_millis() as i64;
                log::record_success(
                    &self.lock_pool,
                    prefix,
                    job_id,
                    item.hash.as_str(),
                    &item.partition_key,
                    source,
                    values.len(),
                    elapsed_ms,
                )
                .await?;
                Ok(())
            }
            Err(ExecutorError::Timeout(seconds)) => {
                lock_tx.rollback().await?;
                self.cache
                    .set_status(&item.hash, &item.partition_key, CacheStatus::Timeout)
                    .await?;
                log::record_failure(
                    &self.lock_pool,
                    prefix,
                    job_id,
                    item.hash.as_str(),
                    &item.partition_key,
                    source,
                    "timeout",
                    &format!("fragment execution exceeded {seconds}s"),
                )
                .await?;
                Ok(())
            }
            Err(e) => {
                lock_tx.rollback().await?;
                self.cache
                    .set_status(&item.hash, &item.partition_key, CacheStatus::Failed)
                    .await?;
                log::record_failure(
                    &self.lock_pool,
                    prefix,
                    job_id,
                    item.hash.as_str(),
                    &item.partition_key,
                    source,
                    "failed",
                    &e.to_string(),
                )
                .await?;
                Ok(())
            }
        }
    }

    /// One cron tick: pop up to `max_parallel_jobs` non-blocking fragments
    /// and run each to completion, bounded by a `JoinSet` the same way
    /// `run_tasks_forever` bounds its own dispatch.
    pub async fn run_tick(&self) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }
        let mut join_set: JoinSet<Result<()>> = JoinSet::new();
        let mut dispatched = 0usize;
        for _ in 0..self.config.max_parallel_jobs {
            let item = match self.queue.pop_fragment(Some(Duration::ZERO)).await? {
                Some(item) => item,
                None => break,
            };
            dispatched += 1;
            let executor = self.clone();
            join_set.spawn(async move { executor.execute_job(item, ExecutionSource::Cron).await });
            if join_set.len() >= self.config.max_parallel_jobs {
                if let Some(res) = join_set.join_next().await {
                    report_job_result(res);
                }
            }
        }
        while let Some(res) = join_set.join_next().await {
            report_job_result(res);
        }
        Ok(dispatched)
    }

    /// Synchronous batch trigger (§4.4 "Manual trigger"): pops and executes
    /// up to `batch_size` items without waiting for the next cron tick.
    pub async fn manual_process(&self, batch_size: usize) -> Result<(usize, String)> {
        let mut processed = 0usize;
        for _ in 0..batch_size {
            let item = match self.queue.pop_fragment(Some(Duration::ZERO)).await? {
                Some(item) => item,
                None => break,
            };
            self.execute_job(item, ExecutionSource::Manual).await?;
            processed += 1;
        }
        let message = format!("processed {processed} item(s)");
        Ok((processed, message))
    }

    /// Client-side equivalent of the cron-driven stored procedure (§4.4
    /// "Placement" permits this): ticks on `frequency_seconds`, forever.
    pub async fn run_forever(&self) -> Result<()> {
        loop {
            if let Err(e) = self.run_tick().await {
                tracing::error!("pipeline tick failed: {e}");
            }
            tokio::time::sleep(Duration::from_secs(self.config.frequency_seconds.max(1) as u64)).await;
        }
    }
}

fn report_job_result(res: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match res {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("fragment job failed: {e}"),
        Err(e) => tracing::error!("fragment job panicked: {e}"),
    }
}
