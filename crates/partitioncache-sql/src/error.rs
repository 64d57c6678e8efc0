use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqlError {
    #[error("could not parse query: {0}")]
    Parse(String),

    #[error("query must be a read-only SELECT")]
    NotASelect,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, SqlError>;

impl From<SqlError> for partitioncache_core::Error {
    fn from(e: SqlError) -> Self {
        partitioncache_core::Error::InvalidArgument(e.to_string())
    }
}
