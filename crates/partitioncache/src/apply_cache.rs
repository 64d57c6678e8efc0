//! Given a user query, a cache handle and a partition key, returns an
//! enhanced query string with cache-derived restrictions injected (§4.5).
//!
//! Lives here rather than in `partitioncache-sql` because it is the one
//! component that depends on both the SQL processor and the cache
//! contract; grounded on `partitioncache_sql::rewrite`'s injection methods,
//! composed with `CacheBackend::get_intersected`/`get_intersected_lazy`.

use crate::error::{Error, Result};
use partitioncache_cache::CacheBackend;
use partitioncache_core::{Fragment, FragmentHash};
use partitioncache_sql::normalize::{parse_select, table_name_and_alias, top_select, top_select_mut};
use partitioncache_sql::{and_predicate, parse_predicate_expr, parse_table_with_joins, rewrite_with_partition_keys, FragmentOptions, RewriteMethod};
use sqlparser::ast::{Query, Select};
use std::collections::{BTreeSet, HashMap};

/// Eager calls `get_intersected` and materializes the set client-side;
/// lazy calls `get_intersected_lazy` and injects a SQL snippet instead
/// (§4.5 "Two modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Eager,
    Lazy,
}

#[derive(Debug, Clone)]
pub struct ApplyCacheConfig {
    pub partition_key: String,
    pub fragment_options: FragmentOptions,
    pub mode: CacheMode,
    pub method: RewriteMethod,
    /// Minimum number of cache hits among the generated fragments before
    /// the rewriter bothers injecting a restriction at all.
    pub eager_hit_threshold: usize,
    /// Overrides alias detection outright (`p0_alias=…` in spec.md §4.5).
    pub alias_override: Option<String>,
    /// Partition keys with a registered partition-join materialized view,
    /// mapping `partition_key -> view_name`. Consulted only when the query
    /// doesn't already contain a partition-join table (§4.5 "p0 rewrite").
    pub p0_registry: HashMap<String, String>,
}

impl Default for ApplyCacheConfig {
    fn default() -> Self {
        Self {
            partition_key: String::new(),
            fragment_options: FragmentOptions::default(),
            mode: CacheMode::Eager,
            method: RewriteMethod::InList,
            eager_hit_threshold: 1,
            alias_override: None,
            p0_registry: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ApplyCacheStats {
    pub generated_variants: usize,
    pub cache_hits: usize,
    pub enhanced: bool,
    pub p0_rewritten: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyCacheResult {
    pub setup_statements: Vec<String>,
    pub query: String,
    pub stats: ApplyCacheStats,
}

fn passthrough(
    query_text: impl Into<String>,
    generated_variants: usize,
    cache_hits: usize,
    p0_rewritten: bool,
) -> ApplyCacheResult {
    ApplyCacheResult {
        setup_statements: Vec::new(),
        query: query_text.into(),
        stats: ApplyCacheStats {
            generated_variants,
            cache_hits,
            enhanced: false,
            p0_rewritten,
        },
    }
}

/// Never fails a client query that would otherwise have run (§7): any
/// error from fragment generation, parsing, rewriting or the cache backend
/// itself falls back to the original query unmodified with `enhanced =
/// false`, rather than propagating to the caller.
pub async fn apply_cache(
    query: &str,
    cache: &dyn CacheBackend,
    config: &ApplyCacheConfig,
) -> Result<ApplyCacheResult> {
    let pk = config.partition_key.as_str();
    let fragments: Vec<Fragment> =
        match partitioncache_sql::generate_fragments(query, pk, &config.fragment_options) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(error = %err, partition_key = pk, "apply_cache: fragment generation failed, passing query through unmodified");
                return Ok(passthrough(query, 0, 0, false));
            }
        };
    let generated_variants = fragments.len();
    let hashes: Vec<FragmentHash> = fragments.iter().map(|f| f.hash.clone()).collect();

    match try_enhance(query, pk, &hashes, cache, config).await {
        Ok((query, stats)) => Ok(ApplyCacheResult {
            setup_statements: Vec::new(),
            query,
            stats: ApplyCacheStats {
                generated_variants,
                ..stats
            },
        }),
        Err(err) => {
            tracing::warn!(error = %err, partition_key = pk, "apply_cache: rewrite failed, passing query through unmodified");
            Ok(passthrough(query, generated_variants, 0, false))
        }
    }
}

/// The fallible core of [`apply_cache`]: parses, rewrites and queries the
/// cache. Kept separate so every error path, regardless of which step
/// produces it, funnels through the single fallback in `apply_cache`.
async fn try_enhance(
    query: &str,
    pk: &str,
    hashes: &[FragmentHash],
    cache: &dyn CacheBackend,
    config: &ApplyCacheConfig,
) -> Result<(String, ApplyCacheStats)> {
    let parsed = parse_select(query)?;
    let (mut rewritten, p0_rewritten) = apply_p0_rewrite(&parsed, pk, config)?;
    let target_alias = if p0_rewritten {
        Some("p0".to_string())
    } else {
        config.alias_override.clone()
    };

    match config.mode {
        CacheMode::Eager => {
            let (values, hits) = cache.get_intersected(hashes, pk).await.map_err(Error::from)?;
            match values {
                Some(values) if !values.is_empty() && hits >= config.eager_hit_threshold => {
                    let out = rewrite_with_partition_keys(
                        &rewritten,
                        &values,
                        pk,
                        config.method,
                        target_alias.as_deref(),
                    )?;
                    Ok((
                        out.query.to_string(),
                        ApplyCacheStats {
                            generated_variants: 0,
                            cache_hits: hits,
                            enhanced: true,
                            p0_rewritten,
                        },
                    ))
                }
                _ => Ok((
                    rewritten.to_string(),
                    ApplyCacheStats {
                        generated_variants: 0,
                        cache_hits: hits,
                        enhanced: false,
                        p0_rewritten,
                    },
                )),
            }
        }
        CacheMode::Lazy => {
            let (snippet, hits) = cache
                .get_intersected_lazy(hashes, pk)
                .await
                .map_err(Error::from)?;
            match snippet {
                Some(snippet) if hits >= config.eager_hit_threshold => {
                    let alias = target_alias.unwrap_or(default_alias_of(&rewritten)?);
                    let column = format!("{alias}.{pk}");
                    let expr = parse_predicate_expr(&format!("{column} IN ({snippet})"))?;
                    let select = top_select_mut(&mut rewritten)?;
                    and_predicate(select, expr);
                    Ok((
                        rewritten.to_string(),
                        ApplyCacheStats {
                            generated_variants: 0,
                            cache_hits: hits,
                            enhanced: true,
                            p0_rewritten,
                        },
                    ))
                }
                _ => Ok((
                    rewritten.to_string(),
                    ApplyCacheStats {
                        generated_variants: 0,
                        cache_hits: hits,
                        enhanced: false,
                        p0_rewritten,
                    },
                )),
            }
        }
    }
}

fn default_alias_of(query: &Query) -> Result<String> {
    Ok(partitioncache_sql::rewrite::default_alias(query)?)
}

fn collect_aliases(select: &Select) -> Vec<String> {
    let mut aliases = Vec::new();
    for twj in &select.from {
        if let Some((_, alias)) = table_name_and_alias(&twj.relation) {
            aliases.push(alias);
        }
        for join in &twj.joins {
            if let Some((_, alias)) = table_name_and_alias(&join.relation) {
                aliases.push(alias);
            }
        }
    }
    aliases
}

/// Inserts `<mv> AS p0` into the `FROM` list and an equijoin predicate
/// against the default alias, when `partition_key` has a registered
/// materialized view and the query doesn't already carry one (§4.5 "p0
/// rewrite"). Must run on the original, not-yet-cache-rewritten query.
fn apply_p0_rewrite(
    query: &Query,
    partition_key: &str,
    config: &ApplyCacheConfig,
) -> Result<(Query, bool)> {
    let select = top_select(query)?;
    let aliases = collect_aliases(select);
    let known: BTreeSet<String> = aliases.iter().cloned().collect();
    let conditions = partitioncache_sql::conditions::extract_conditions(
        select.selection.as_ref(),
        &known,
        partition_key,
    );
    let detected = partitioncache_sql::graph::detect_partition_join_table(
        &aliases,
        &conditions,
        partition_key,
        config.alias_override.as_deref(),
    );
    if detected.is_some() {
        // Already has a partition-join table in the FROM list (possibly a
        // prior p0 rewrite); pass through unchanged.
        return Ok((query.clone(), false));
    }
    let Some(mv_table) = config.p0_registry.get(partition_key) else {
        return Ok((query.clone(), false));
    };

    let mut rewritten = query.clone();
    let target_alias = default_alias_of(&rewritten)?;
    let from_snippet = format!("{mv_table} AS p0");
    let twj = parse_table_with_joins(&from_snippet)?;
    let equijoin = parse_predicate_expr(&format!(
        "{target_alias}.{partition_key} = p0.{partition_key}"
    ))?;

    let select = top_select_mut(&mut rewritten)?;
    select.from.push(twj);
    and_predicate(select, equijoin);

    Ok((rewritten, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use partitioncache_cache::Result as CacheResult;
    use partitioncache_core::{CacheStatus, Datatype, PartitionValue};

    struct FakeCache {
        values: Vec<PartitionValue>,
        hits: usize,
    }

    #[async_trait]
    impl CacheBackend for FakeCache {
        fn backend_id(&self) -> &'static str {
            "fake"
        }
        async fn register_partition_key(&self, _pk: &str, _datatype: Datatype) -> CacheResult<()> {
            Ok(())
        }
        async fn set(&self, _hash: &FragmentHash, _values: &[PartitionValue], _pk: &str) -> CacheResult<bool> {
            Ok(true)
        }
        async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn get(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<Option<Vec<PartitionValue>>> {
            Ok(None)
        }
        async fn get_intersected(
            &self,
            _hashes: &[FragmentHash],
            _pk: &str,
        ) -> CacheResult<(Option<Vec<PartitionValue>>, usize)> {
            Ok((Some(self.values.clone()), self.hits))
        }
        async fn get_intersected_lazy(
            &self,
            _hashes: &[FragmentHash],
            _pk: &str,
        ) -> CacheResult<(Option<String>, usize)> {
            Ok((Some("SELECT pk FROM some_snapshot".to_string()), self.hits))
        }
        async fn exists(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn filter_existing(&self, _hashes: &[FragmentHash], _pk: &str) -> CacheResult<Vec<FragmentHash>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn set_null(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn is_null(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn set_status(&self, _hash: &FragmentHash, _pk: &str, _status: CacheStatus) -> CacheResult<()> {
            Ok(())
        }
        async fn get_status(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<Option<CacheStatus>> {
            Ok(None)
        }
        async fn set_query(&self, _hash: &FragmentHash, _text: &str, _pk: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn get_query(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<Option<String>> {
            Ok(None)
        }
        async fn list_queries(&self, _pk: &str) -> CacheResult<Vec<(FragmentHash, String)>> {
            Ok(Vec::new())
        }
        async fn partitions(&self) -> CacheResult<Vec<(String, Datatype)>> {
            Ok(Vec::new())
        }
    }

    fn config() -> ApplyCacheConfig {
        ApplyCacheConfig {
            partition_key: "zipcode".to_string(),
            ..ApplyCacheConfig::default()
        }
    }

    #[tokio::test]
    async fn eager_mode_injects_an_in_list_on_a_hit() {
        let cache = FakeCache {
            values: vec![PartitionValue::Integer(1), PartitionValue::Integer(2)],
            hits: 2,
        };
        let result = apply_cache("SELECT * FROM orders o WHERE o.total > 10", &cache, &config())
            .await
            .unwrap();
        assert!(result.stats.enhanced);
        assert!(result.query.contains("o.zipcode IN (1, 2)"));
    }

    #[tokio::test]
    async fn eager_mode_passes_through_below_threshold() {
        let cache = FakeCache {
            values: vec![PartitionValue::Integer(1)],
            hits: 0,
        };
        let mut cfg = config();
        cfg.eager_hit_threshold = 5;
        let result = apply_cache("SELECT * FROM orders o WHERE o.total > 10", &cache, &cfg)
            .await
            .unwrap();
        assert!(!result.stats.enhanced);
        assert!(!result.query.contains("zipcode"));
    }

    #[tokio::test]
    async fn lazy_mode_injects_an_in_subquery() {
        let cache = FakeCache {
            values: vec![PartitionValue::Integer(1)],
            hits: 3,
        };
        let mut cfg = config();
        cfg.mode = CacheMode::Lazy;
        let result = apply_cache("SELECT * FROM orders o WHERE o.total > 10", &cache, &cfg)
            .await
            .unwrap();
        assert!(result.stats.enhanced);
        assert!(result.query.contains("o.zipcode IN (SELECT pk FROM some_snapshot)"));
    }

    #[tokio::test]
    async fn p0_rewrite_inserts_materialized_view_and_equijoin() {
        let cache = FakeCache {
            values: vec![PartitionValue::Integer(1)],
            hits: 1,
        };
        let mut cfg = config();
        cfg.p0_registry.insert("zipcode".to_string(), "zipcode_mv".to_string());
        let result = apply_cache("SELECT * FROM orders o WHERE o.total > 10", &cache, &cfg)
            .await
            .unwrap();
        assert!(result.stats.p0_rewritten);
        assert!(result.query.contains("zipcode_mv AS p0"));
        assert!(result.query.contains("o.zipcode = p0.zipcode"));
        assert!(result.query.contains("p0.zipcode IN (1)"));
    }

    #[tokio::test]
    async fn existing_p0_alias_is_passed_through() {
        let cache = FakeCache {
            values: vec![PartitionValue::Integer(1)],
            hits: 1,
        };
        let mut cfg = config();
        cfg.p0_registry.insert("zipcode".to_string(), "zipcode_mv".to_string());
        let result = apply_cache(
            "SELECT * FROM orders o, zipcode_mv p0 WHERE o.zipcode = p0.zipcode",
            &cache,
            &cfg,
        )
        .await
        .unwrap();
        assert!(!result.stats.p0_rewritten);
        assert_eq!(result.query.matches("zipcode_mv").count(), 1);
    }

    struct FailingCache;

    #[async_trait]
    impl CacheBackend for FailingCache {
        fn backend_id(&self) -> &'static str {
            "failing"
        }
        async fn register_partition_key(&self, _pk: &str, _datatype: Datatype) -> CacheResult<()> {
            Ok(())
        }
        async fn set(&self, _hash: &FragmentHash, _values: &[PartitionValue], _pk: &str) -> CacheResult<bool> {
            Ok(true)
        }
        async fn set_lazy(&self, _hash: &FragmentHash, _fragment_sql: &str, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn get(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<Option<Vec<PartitionValue>>> {
            Ok(None)
        }
        async fn get_intersected(
            &self,
            _hashes: &[FragmentHash],
            _pk: &str,
        ) -> CacheResult<(Option<Vec<PartitionValue>>, usize)> {
            Err(partitioncache_cache::CacheError::InvalidArgument(
                "connection reset".to_string(),
            ))
        }
        async fn get_intersected_lazy(
            &self,
            _hashes: &[FragmentHash],
            _pk: &str,
        ) -> CacheResult<(Option<String>, usize)> {
            Err(partitioncache_cache::CacheError::InvalidArgument(
                "connection reset".to_string(),
            ))
        }
        async fn exists(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn filter_existing(&self, _hashes: &[FragmentHash], _pk: &str) -> CacheResult<Vec<FragmentHash>> {
            Ok(Vec::new())
        }
        async fn delete(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn set_null(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn is_null(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<bool> {
            Ok(false)
        }
        async fn set_status(&self, _hash: &FragmentHash, _pk: &str, _status: CacheStatus) -> CacheResult<()> {
            Ok(())
        }
        async fn get_status(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<Option<CacheStatus>> {
            Ok(None)
        }
        async fn set_query(&self, _hash: &FragmentHash, _text: &str, _pk: &str) -> CacheResult<()> {
            Ok(())
        }
        async fn get_query(&self, _hash: &FragmentHash, _pk: &str) -> CacheResult<Option<String>> {
            Ok(None)
        }
        async fn list_queries(&self, _pk: &str) -> CacheResult<Vec<(FragmentHash, String)>> {
            Ok(Vec::new())
        }
        async fn partitions(&self) -> CacheResult<Vec<(String, Datatype)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn cache_backend_error_falls_back_to_the_original_query() {
        let cache = FailingCache;
        let original = "SELECT * FROM orders o WHERE o.total > 10";
        let result = apply_cache(original, &cache, &config()).await.unwrap();
        assert!(!result.stats.enhanced);
        assert_eq!(result.stats.cache_hits, 0);
        assert_eq!(result.query, original);
    }

    #[tokio::test]
    async fn unsupported_query_shape_falls_back_to_the_original_query() {
        let cache = FailingCache;
        let original = "SELECT a FROM t1 UNION SELECT a FROM t2";
        let result = apply_cache(original, &cache, &config()).await.unwrap();
        assert!(!result.stats.enhanced);
        assert_eq!(result.stats.generated_variants, 0);
        assert_eq!(result.query, original);
    }
}
