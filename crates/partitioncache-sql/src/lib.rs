//! Parses a user query into canonical, hashable fragments and rewrites
//! queries to carry cache-derived partition-key restrictions. See
//! `generate_fragments` for the decomposition entry point and
//! `rewrite_with_partition_keys` for the restriction-injection entry point.

pub mod bucket;
pub mod canonicalize;
pub mod conditions;
pub mod dialect;
pub mod error;
pub mod fragments;
pub mod graph;
pub mod hash;
pub mod normalize;
pub mod rewrite;

pub use error::{Result, SqlError};
pub use fragments::FragmentOptions;
pub use rewrite::{
    and_predicate, parse_predicate_expr, parse_table_with_joins, rewrite_with_partition_keys,
    RewriteMethod, Rewritten,
};

use partitioncache_core::{Fragment, FragmentHash};

/// Hashes already-canonical fragment text into a [`FragmentHash`].
pub fn hash(canonical_sql: &str) -> FragmentHash {
    hash::hash_fragment(canonical_sql)
}

/// Decomposes `query` into its candidate fragments with respect to
/// `partition_key`, returning each fragment's canonical text paired with
/// its stable hash. Order is not significant; callers that need
/// deduplication should go through the returned hashes.
pub fn generate_fragments(
    query: &str,
    partition_key: &str,
    opts: &FragmentOptions,
) -> Result<Vec<Fragment>> {
    let normalized = normalize::normalize(query)?;
    let raw_fragments = fragments::enumerate_fragments(&normalized, partition_key, opts)?;

    let mut out = Vec::with_capacity(raw_fragments.len());
    let mut seen = std::collections::HashSet::new();
    for raw in raw_fragments {
        let mut q = raw.query;
        let text = canonicalize::canonicalize(&mut q)?;
        let hash = hash::hash_fragment(&text);
        if seen.insert(hash.clone()) {
            out.push(Fragment { text, hash });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renaming_aliases_consistently_yields_same_hash_set() {
        let opts = FragmentOptions::default();
        let a = generate_fragments(
            "SELECT * FROM foo x, bar y WHERE x.zipcode = y.zipcode AND x.a = 1",
            "zipcode",
            &opts,
        )
        .unwrap();
        let b = generate_fragments(
            "SELECT * FROM foo p, bar q WHERE p.zipcode = q.zipcode AND p.a = 1",
            "zipcode",
            &opts,
        )
        .unwrap();
        let mut a_hashes: Vec<_> = a.iter().map(|f| f.hash.clone()).collect();
        let mut b_hashes: Vec<_> = b.iter().map(|f| f.hash.clone()).collect();
        a_hashes.sort();
        b_hashes.sort();
        assert_eq!(a_hashes, b_hashes);
    }

    #[test]
    fn presentation_clauses_do_not_change_hash_set() {
        let opts = FragmentOptions::default();
        let a = generate_fragments("SELECT * FROM foo x WHERE x.a = 1", "zipcode", &opts).unwrap();
        let b = generate_fragments(
            "SELECT * FROM foo x WHERE x.a = 1 ORDER BY x.a LIMIT 10",
            "zipcode",
            &opts,
        )
        .unwrap();
        let mut a_hashes: Vec<_> = a.iter().map(|f| f.hash.clone()).collect();
        let mut b_hashes: Vec<_> = b.iter().map(|f| f.hash.clone()).collect();
        a_hashes.sort();
        b_hashes.sort();
        assert_eq!(a_hashes, b_hashes);
    }

    #[test]
    fn distance_bucketing_produces_identical_fragment_hash() {
        let opts = FragmentOptions {
            bucket_step: 1.0,
            min_component_size: 2,
            max_component_size: 2,
            ..FragmentOptions::default()
        };
        let a = generate_fragments(
            "SELECT * FROM t1 a, t2 b WHERE dist(a.g, b.g) <= 0.1",
            "zipcode",
            &opts,
        )
        .unwrap();
        let b = generate_fragments(
            "SELECT * FROM t1 a, t2 b WHERE dist(a.g, b.g) <= 0.7",
            "zipcode",
            &opts,
        )
        .unwrap();
        assert_eq!(a[0].hash, b[0].hash);

        let c = generate_fragments(
            "SELECT * FROM t1 a, t2 b WHERE dist(a.g, b.g) <= 1.1",
            "zipcode",
            &opts,
        )
        .unwrap();
        assert_ne!(a[0].hash, c[0].hash);
    }
}
