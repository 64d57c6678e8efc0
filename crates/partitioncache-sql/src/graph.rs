//! The alias-join graph (§4.1 "Fragment enumeration"): vertices are
//! `FROM`-list aliases, edges are two-alias conditions. Connected subgraphs
//! of this graph, within a configurable size range, become candidate
//! fragments. Partition-join table detection (the "spine" every fragment
//! re-attaches to) also lives here, since it is a property of the same
//! graph.

use crate::conditions::{mentions_column, ConditionSet};
use std::collections::BTreeSet;

/// An edge between two aliases, always stored with the lexicographically
/// smaller alias first so `(a, b)` and `(b, a)` compare equal.
pub type Edge = (String, String);

fn normalize_edge(a: &str, b: &str) -> Edge {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// Builds the edge set from a [`ConditionSet`]'s two-alias conditions.
pub fn edges_from_conditions(conditions: &ConditionSet) -> BTreeSet<Edge> {
    conditions
        .distance_conditions
        .keys()
        .map(|(a, b)| normalize_edge(a, b))
        .collect()
}

fn is_connected(subset: &BTreeSet<String>, edges: &BTreeSet<Edge>) -> bool {
    let Some(start) = subset.iter().next() else {
        return false;
    };
    let mut visited = BTreeSet::new();
    let mut stack = vec![start.clone()];
    while let Some(node) = stack.pop() {
        if !visited.insert(node.clone()) {
            continue;
        }
        for (a, b) in edges {
            let neighbor = if a == &node && subset.contains(b) {
                Some(b.clone())
            } else if b == &node && subset.contains(a) {
                Some(a.clone())
            } else {
                None
            };
            if let Some(n) = neighbor {
                if !visited.contains(&n) {
                    stack.push(n);
                }
            }
        }
    }
    visited.len() == subset.len()
}

/// Enumerates every subset of `aliases` whose size falls in
/// `[min_size, max_size]`. When `follow_graph` is `true`, only connected
/// subgraphs of the alias-join graph are returned; otherwise every subset in
/// range is returned regardless of connectivity.
///
/// `aliases` is expected to be small (a handful of `FROM`-list entries per
/// query), so a bitmask powerset walk is simpler and just as fast as a
/// canonical-extension subgraph enumerator would be at this scale.
pub fn enumerate_subsets(
    aliases: &[String],
    edges: &BTreeSet<Edge>,
    min_size: usize,
    max_size: usize,
    follow_graph: bool,
) -> Vec<BTreeSet<String>> {
    let n = aliases.len();
    assert!(n <= 24, "alias graph too large for powerset enumeration");
    let mut results = Vec::new();
    for mask in 1u32..(1u32 << n) {
        let size = mask.count_ones() as usize;
        if size < min_size || size > max_size {
            continue;
        }
        let subset: BTreeSet<String> = (0..n)
            .filter(|i| mask & (1 << i) != 0)
            .map(|i| aliases[i].clone())
            .collect();
        if follow_graph && !is_connected(&subset, edges) {
            continue;
        }
        results.push(subset);
    }
    results
}

/// Returns `true` when every edge from `candidate` to another alias in
/// `all_aliases` is a pure partition-key equijoin (`candidate.pk = other.pk`)
/// and `candidate` carries no one-alias attribute conditions of its own.
fn is_pure_partition_join_table(
    candidate: &str,
    all_aliases: &[String],
    conditions: &ConditionSet,
    partition_key: &str,
) -> bool {
    if conditions.attribute_conditions.contains_key(candidate) {
        return false;
    }
    let others: Vec<&String> = all_aliases.iter().filter(|a| a.as_str() != candidate).collect();
    if others.is_empty() {
        return false;
    }
    others.iter().all(|other| {
        let key = normalize_edge(candidate, other);
        conditions
            .distance_conditions
            .get(&key)
            .is_some_and(|exprs| {
                exprs
                    .iter()
                    .any(|e| mentions_column(e, partition_key))
            })
    })
}

/// Determines the partition-join ("spine") alias for a query, following
/// the detection rules in order: an explicit override, then the `p0_`
/// naming convention, then smart-detection (requires at least three
/// tables).
pub fn detect_partition_join_table(
    all_aliases: &[String],
    conditions: &ConditionSet,
    partition_key: &str,
    explicit: Option<&str>,
) -> Option<String> {
    if let Some(alias) = explicit {
        return Some(alias.to_string());
    }
    for alias in all_aliases {
        if alias.starts_with("p0_") && !conditions.attribute_conditions.contains_key(alias) {
            return Some(alias.clone());
        }
    }
    if all_aliases.len() < 3 {
        return None;
    }
    all_aliases
        .iter()
        .find(|candidate| {
            is_pure_partition_join_table(candidate, all_aliases, conditions, partition_key)
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &str)]) -> BTreeSet<Edge> {
        pairs
            .iter()
            .map(|(a, b)| normalize_edge(a, b))
            .collect()
    }

    #[test]
    fn connected_subsets_only() {
        let aliases = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let e = edges(&[("a", "b")]);
        let subsets = enumerate_subsets(&aliases, &e, 2, 2, true);
        assert_eq!(subsets.len(), 1);
        assert!(subsets[0].contains("a") && subsets[0].contains("b"));
    }

    #[test]
    fn unconnected_mode_returns_every_subset_in_range() {
        let aliases = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let e = edges(&[]);
        let subsets = enumerate_subsets(&aliases, &e, 2, 2, false);
        assert_eq!(subsets.len(), 3);
    }
}
