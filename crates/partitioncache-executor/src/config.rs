//! One configuration row per `(queue_prefix, target_database, job_name)`
//! (§4.4 "Configuration row"). A scheduler external to this crate reads
//! `enabled`/`frequency_seconds` to decide when to call [`run_tick`][crate::run_tick];
//! this module only owns the row shape and the job-naming algorithm both the
//! SQL and client-side constructors must agree on.

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub queue_prefix: String,
    pub target_database: String,
    pub table_prefix: String,
    pub enabled: bool,
    pub max_parallel_jobs: usize,
    pub frequency_seconds: u32,
    pub timeout_seconds: u64,
    pub cache_backend: String,
    pub default_bitsize: u32,
    pub job_owner: String,
}

impl JobConfig {
    pub fn process_queue_job_name(&self) -> String {
        process_queue_job_name(&self.target_database, &self.table_prefix)
    }

    pub fn evict_job_name(&self) -> String {
        evict_job_name(&self.target_database, &self.table_prefix)
    }

    /// `N seconds` when `frequency_seconds < 60`, `*/M * * * *` otherwise
    /// (§4.4 "Configuration row").
    pub fn cron_schedule(&self) -> String {
        if self.frequency_seconds < 60 {
            format!("{} seconds", self.frequency_seconds)
        } else {
            format!("*/{} * * * *", (self.frequency_seconds / 60).max(1))
        }
    }
}

fn table_prefix_suffix(table_prefix: &str) -> String {
    let suffix = table_prefix
        .strip_prefix("partitioncache")
        .unwrap_or(table_prefix)
        .trim_matches('_');
    if suffix.is_empty() {
        "default".to_string()
    } else {
        suffix.to_string()
    }
}

/// `partitioncache_process_queue_<db>_<suffix>` (§4.4 "Job name uniqueness").
pub fn process_queue_job_name(target_database: &str, table_prefix: &str) -> String {
    format!(
        "partitioncache_process_queue_{target_database}_{}",
        table_prefix_suffix(table_prefix)
    )
}

/// `partitioncache_evict_<db>_<suffix>` (§4.6), same suffix algorithm as
/// the pipeline's job name, no truncation.
pub fn evict_job_name(target_database: &str, table_prefix: &str) -> String {
    format!(
        "partitioncache_evict_{target_database}_{}",
        table_prefix_suffix(table_prefix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_partitioncache_and_leading_underscore() {
        assert_eq!(table_prefix_suffix("partitioncache_zipcode"), "zipcode");
        assert_eq!(table_prefix_suffix("partitioncache"), "default");
        assert_eq!(table_prefix_suffix("zipcode"), "zipcode");
    }

    #[test]
    fn process_queue_and_evict_names_share_db_and_suffix() {
        let db = "analytics";
        let prefix = "partitioncache_zipcode";
        assert_eq!(
            process_queue_job_name(db, prefix),
            "partitioncache_process_queue_analytics_zipcode"
        );
        assert_eq!(
            evict_job_name(db, prefix),
            "partitioncache_evict_analytics_zipcode"
        );
    }

    #[test]
    fn sub_minute_frequency_uses_seconds_form() {
        let cfg = JobConfig {
            queue_prefix: "pc".into(),
            target_database: "analytics".into(),
            table_prefix: "partitioncache".into(),
            enabled: true,
            max_parallel_jobs: 4,
            frequency_seconds: 15,
            timeout_seconds: 30,
            cache_backend: "array_pg".into(),
            default_bitsize: 1024,
            job_owner: "pc_admin".into(),
        };
        assert_eq!(cfg.cron_schedule(), "15 seconds");
        assert_eq!(cfg.process_queue_job_name(), "partitioncache_process_queue_analytics_default");
    }

    #[test]
    fn minute_or_slower_frequency_uses_star_form() {
        let cfg = JobConfig {
            queue_prefix: "pc".into(),
            target_database: "analytics".into(),
            table_prefix: "partitioncache".into(),
            enabled: true,
            max_parallel_jobs: 4,
            frequency_seconds: 120,
            timeout_seconds: 30,
            cache_backend: "array_pg".into(),
            default_bitsize: 1024,
            job_owner: "pc_admin".into(),
        };
        assert_eq!(cfg.cron_schedule(), "*/2 * * * *");
    }
}
