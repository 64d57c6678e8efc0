//! PartitionCache ties the SQL processor, cache backends, queue and
//! pipeline executor together behind one entry point: [`apply_cache::apply_cache`]
//! turns a user query plus a partition key into a cache-enhanced query,
//! falling back to the original query unchanged whenever the cache has
//! nothing useful to offer.

pub mod apply_cache;
pub mod error;

pub use apply_cache::{apply_cache, ApplyCacheConfig, ApplyCacheResult, ApplyCacheStats, CacheMode};
pub use error::{Error, Result};

pub use partitioncache_cache::{CacheBackend, CacheError};
pub use partitioncache_core::{
    CacheStatus, Datatype, ExecutionSource, Fragment, FragmentHash, PartitionValue,
};
pub use partitioncache_executor::{
    evict_job_name, process_queue_job_name, EvictionManager, EvictionStrategy, ExecutorError,
    JobConfig, PipelineExecutor,
};
pub use partitioncache_queue::{FragmentItem, OriginalItem, Queue, QueueError, QueueLengths};
pub use partitioncache_sql::{generate_fragments, rewrite_with_partition_keys, FragmentOptions, RewriteMethod};
