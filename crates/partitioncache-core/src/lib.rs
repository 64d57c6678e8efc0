//! Shared data model, error types and advisory-lock helpers used by every
//! PartitionCache subsystem: the SQL processor, the cache backends, the
//! queue handlers and the pipeline executor.

pub mod datatype;
pub mod error;
pub mod fragment;
pub mod lock;
pub mod singleton;

pub use datatype::{Datatype, PartitionValue};
pub use error::{Error, Result};
pub use fragment::{CacheStatus, ExecutionSource, Fragment, FragmentHash};
