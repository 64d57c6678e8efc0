use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("sql processing error: {0}")]
    Sql(#[from] partitioncache_sql::SqlError),

    #[error("cache error: {0}")]
    Cache(#[from] partitioncache_cache::CacheError),

    #[error(transparent)]
    Core(#[from] partitioncache_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
