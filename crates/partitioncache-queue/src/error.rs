use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl From<partitioncache_core::Error> for QueueError {
    fn from(e: partitioncache_core::Error) -> Self {
        match e {
            partitioncache_core::Error::Sqlx(e) => QueueError::Sqlx(e),
            partitioncache_core::Error::InvalidArgument(m) => QueueError::InvalidArgument(m),
            other => QueueError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<QueueError> for partitioncache_core::Error {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::InvalidArgument(m) => partitioncache_core::Error::InvalidArgument(m),
            QueueError::Sqlx(e) => partitioncache_core::Error::Sqlx(e),
            QueueError::Redis(e) => partitioncache_core::Error::ExecutionError(e.to_string()),
            QueueError::RedisPool(e) => partitioncache_core::Error::ExecutionError(e.to_string()),
        }
    }
}
