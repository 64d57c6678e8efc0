use thiserror::Error;

/// Error kinds shared by every PartitionCache subsystem.
///
/// Fragment-level failures (timeouts, execution errors against the source
/// database) are recorded in the processor log and the cache status column
/// rather than bubbling up through this type; see the executor crate.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(
        "partition key '{partition_key}' is registered as {registered} but this write is {attempted}"
    )]
    DatatypeConflict {
        partition_key: String,
        registered: String,
        attempted: String,
    },

    #[error("backend '{backend}' does not support datatype '{datatype}'")]
    DatatypeUnsupported { backend: String, datatype: String },

    #[error(
        "value {value} exceeds bitsize {bitsize} for partition key '{partition_key}' and expansion failed"
    )]
    CapacityExceeded {
        partition_key: String,
        value: i64,
        bitsize: u32,
    },

    #[error("fragment execution exceeded {0}s")]
    Timeout(u64),

    #[error("execution error: {0}")]
    ExecutionError(String),

    #[error("could not acquire a non-blocking lock, caller should retry or defer")]
    Contention,

    #[error("not found")]
    NotFound,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
