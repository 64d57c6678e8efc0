//! Drains the fragment queue into the cache (§4.4) and prunes stale cache
//! entries and processor logs (§4.6).
//!
//! Grounded on the teacher's `servers/maintenance.rs` (`run_tasks_forever`'s
//! bounded `JoinSet` dispatch) and `servers/cron_task.rs` (`TaskCallback`),
//! generalized from view materialization to the fragment-execution
//! pseudocode of §4.4; the eviction side is grounded on `analytics/src/
//! delete.rs`'s batched-delete-loop shape.

pub mod config;
pub mod error;
pub mod eviction;
pub mod executor;
pub mod log;
pub mod source;

pub use config::{evict_job_name, process_queue_job_name, JobConfig};
pub use error::{ExecutorError, Result};
pub use eviction::{EvictionManager, EvictionStrategy};
pub use executor::PipelineExecutor;
