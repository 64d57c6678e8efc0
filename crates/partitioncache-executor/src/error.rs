use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("cache error: {0}")]
    Cache(#[from] partitioncache_cache::CacheError),

    #[error("queue error: {0}")]
    Queue(#[from] partitioncache_queue::QueueError),

    #[error("fragment execution exceeded {0}s")]
    Timeout(u64),

    #[error("execution error: {0}")]
    ExecutionError(String),
}

pub type Result<T> = std::result::Result<T, ExecutorError>;

impl From<partitioncache_core::Error> for ExecutorError {
    fn from(e: partitioncache_core::Error) -> Self {
        match e {
            partitioncache_core::Error::Sqlx(e) => ExecutorError::Sqlx(e),
            partitioncache_core::Error::InvalidArgument(m) => ExecutorError::InvalidArgument(m),
            partitioncache_core::Error::Timeout(s) => ExecutorError::Timeout(s),
            other => ExecutorError::ExecutionError(other.to_string()),
        }
    }
}
