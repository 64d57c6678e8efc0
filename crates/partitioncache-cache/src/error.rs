use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("partition key {partition_key} is already registered as {registered:?}, cannot register as {attempted:?}")]
    DatatypeConflict {
        partition_key: String,
        registered: partitioncache_core::Datatype,
        attempted: partitioncache_core::Datatype,
    },

    #[error("backend {backend} does not support datatype {datatype:?}")]
    DatatypeUnsupported {
        backend: String,
        datatype: partitioncache_core::Datatype,
    },

    #[error("value {value} for partition key {partition_key} exceeds bitsize {bitsize} and expansion failed")]
    CapacityExceeded {
        partition_key: String,
        value: i64,
        bitsize: u32,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("redis pool error: {0}")]
    RedisPool(#[from] deadpool_redis::PoolError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl From<partitioncache_core::Error> for CacheError {
    fn from(e: partitioncache_core::Error) -> Self {
        match e {
            partitioncache_core::Error::Sqlx(e) => CacheError::Sqlx(e),
            partitioncache_core::Error::InvalidArgument(m) => CacheError::InvalidArgument(m),
            other => CacheError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<CacheError> for partitioncache_core::Error {
    fn from(e: CacheError) -> Self {
        match e {
            CacheError::DatatypeConflict {
                partition_key,
                registered,
                attempted,
            } => partitioncache_core::Error::DatatypeConflict {
                partition_key,
                registered: registered.to_string(),
                attempted: attempted.to_string(),
            },
            CacheError::DatatypeUnsupported { backend, datatype } => {
                partitioncache_core::Error::DatatypeUnsupported {
                    backend,
                    datatype: datatype.to_string(),
                }
            }
            CacheError::CapacityExceeded {
                partition_key,
                value,
                bitsize,
            } => partitioncache_core::Error::CapacityExceeded {
                partition_key,
                value,
                bitsize,
            },
            CacheError::InvalidArgument(m) => partitioncache_core::Error::InvalidArgument(m),
            CacheError::Sqlx(e) => partitioncache_core::Error::Sqlx(e),
            CacheError::Redis(e) => partitioncache_core::Error::ExecutionError(e.to_string()),
            CacheError::RedisPool(e) => partitioncache_core::Error::ExecutionError(e.to_string()),
        }
    }
}
