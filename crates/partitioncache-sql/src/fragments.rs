//! Fragment enumeration (§4.1 "Fragment enumeration"): walk the connected
//! subgraphs of the alias-join graph and, for each one in range, rebuild a
//! standalone `SELECT` containing that subgraph's tables, the partition-join
//! spine (if any), and every condition whose referenced aliases are all
//! present in the fragment.

use crate::conditions::{extract_conditions, ConditionSet};
use crate::error::{Result, SqlError};
use crate::graph::{detect_partition_join_table, edges_from_conditions, enumerate_subsets};
use crate::normalize::{table_name_and_alias, top_select};
use sqlparser::ast::{
    Expr, Query, Select, SelectItem, SetExpr, TableFactor, TableWithJoins,
};
use std::collections::BTreeSet;

/// Tuning knobs for fragment enumeration, distance bucketing and
/// projection handling.
#[derive(Debug, Clone)]
pub struct FragmentOptions {
    pub bucket_step: f64,
    pub min_component_size: usize,
    pub max_component_size: usize,
    pub follow_graph: bool,
    pub partition_join_alias: Option<String>,
    pub include_partition_key_conditions: bool,
    pub strip_select: bool,
    pub warn_on_missing_partition_key: bool,
}

impl Default for FragmentOptions {
    fn default() -> Self {
        Self {
            bucket_step: crate::bucket::DEFAULT_BUCKET_STEP,
            min_component_size: 1,
            max_component_size: usize::MAX,
            follow_graph: true,
            partition_join_alias: None,
            include_partition_key_conditions: true,
            strip_select: true,
            warn_on_missing_partition_key: true,
        }
    }
}

/// One candidate sub-query, still as a parsed `Query` — not yet
/// canonicalized or hashed.
pub struct RawFragment {
    pub query: Query,
    pub aliases: BTreeSet<String>,
}

/// Enumerates every candidate fragment of `query` with respect to
/// `partition_key`. `query` must already be normalized (§4.1 steps 1-4).
pub fn enumerate_fragments(
    query: &Query,
    partition_key: &str,
    opts: &FragmentOptions,
) -> Result<Vec<RawFragment>> {
    let select = top_select(query)?;

    if opts.warn_on_missing_partition_key
        && crate::conditions::missing_partition_key_warning(select.selection.as_ref(), partition_key)
    {
        tracing::warn!(partition_key, "no WHERE condition references the declared partition key; fragment may be unindexable");
    }

    let table_factors = table_factors_by_alias(select)?;
    let all_aliases: Vec<String> = table_factors.keys().cloned().collect();
    let known: BTreeSet<String> = all_aliases.iter().cloned().collect();

    let mut conditions = extract_conditions(select.selection.as_ref(), &known, partition_key);
    crate::bucket::bucket_distance_conditions(&mut conditions.distance_conditions, opts.bucket_step);

    let partition_join = detect_partition_join_table(
        &all_aliases,
        &conditions,
        partition_key,
        opts.partition_join_alias.as_deref(),
    );

    let candidate_aliases: Vec<String> = match &partition_join {
        Some(pj) => all_aliases.iter().filter(|a| *a != pj).cloned().collect(),
        None => all_aliases.clone(),
    };

    let edges = edges_from_conditions(&conditions);

    let subsets: Vec<BTreeSet<String>> = if candidate_aliases.is_empty() {
        vec![BTreeSet::new()]
    } else {
        enumerate_subsets(
            &candidate_aliases,
            &edges,
            opts.min_component_size,
            opts.max_component_size.min(candidate_aliases.len()),
            opts.follow_graph,
        )
    };

    let mut fragments = Vec::with_capacity(subsets.len());
    for subset in subsets {
        let mut available = subset.clone();
        if let Some(pj) = &partition_join {
            available.insert(pj.clone());
        }
        let where_expr = build_fragment_where(&conditions, &available, opts.include_partition_key_conditions);
        let from = build_fragment_from(&table_factors, &subset, partition_join.as_deref())?;
        let projection = build_fragment_projection(select, partition_key, &available, opts.strip_select);

        let mut new_select = select.clone();
        new_select.from = from;
        new_select.selection = where_expr;
        new_select.projection = projection;

        // `query` is already normalized, so everything outside `body`
        // (ORDER BY, LIMIT, CTEs, …) is already stripped; cloning it and
        // swapping only the inner SELECT avoids hand-reconstructing the
        // rest of the `Query` struct.
        let mut new_query = query.clone();
        *new_query.body = SetExpr::Select(Box::new(new_select));
        fragments.push(RawFragment {
            query: new_query,
            aliases: available,
        });
    }
    Ok(fragments)
}

fn table_factors_by_alias(select: &Select) -> Result<indexmap_like::OrderedMap> {
    let mut map = indexmap_like::OrderedMap::new();
    for twj in &select.from {
        if let Some((_, alias)) = table_name_and_alias(&twj.relation) {
            map.insert(alias, twj.relation.clone());
        } else {
            return Err(SqlError::InvalidArgument(
                "fragment enumeration requires plain table references in FROM".to_string(),
            ));
        }
    }
    Ok(map)
}

fn build_fragment_from(
    table_factors: &indexmap_like::OrderedMap,
    subset: &BTreeSet<String>,
    partition_join: Option<&str>,
) -> Result<Vec<TableWithJoins>> {
    let mut from = Vec::new();
    if let Some(pj) = partition_join {
        let relation = table_factors
            .get(pj)
            .ok_or_else(|| SqlError::InvalidArgument(format!("unknown partition-join alias {pj}")))?;
        from.push(TableWithJoins {
            relation: relation.clone(),
            joins: Vec::new(),
        });
    }
    for alias in subset {
        let relation = table_factors
            .get(alias)
            .ok_or_else(|| SqlError::InvalidArgument(format!("unknown alias {alias}")))?;
        from.push(TableWithJoins {
            relation: relation.clone(),
            joins: Vec::new(),
        });
    }
    if from.is_empty() {
        return Err(SqlError::InvalidArgument(
            "fragment has no tables to select from".to_string(),
        ));
    }
    Ok(from)
}

fn build_fragment_where(
    conditions: &ConditionSet,
    available: &BTreeSet<String>,
    include_partition_key_conditions: bool,
) -> Option<Expr> {
    let mut conjuncts: Vec<Expr> = Vec::new();
    conjuncts.extend(conditions.literal_conditions.iter().cloned());
    for (alias, exprs) in &conditions.attribute_conditions {
        if available.contains(alias) {
            conjuncts.extend(exprs.iter().cloned());
        }
    }
    for ((a, b), exprs) in &conditions.distance_conditions {
        if available.contains(a) && available.contains(b) {
            conjuncts.extend(exprs.iter().cloned());
        }
    }
    for (aliases, exprs) in &conditions.other_functions {
        if aliases.iter().all(|a| available.contains(a)) {
            conjuncts.extend(exprs.iter().cloned());
        }
    }
    for (aliases, exprs) in &conditions.or_conditions {
        if aliases.iter().all(|a| available.contains(a)) {
            conjuncts.extend(exprs.iter().cloned());
        }
    }
    if include_partition_key_conditions {
        conjuncts.extend(conditions.partition_key_conditions.iter().cloned());
    }
    conjuncts.into_iter().reduce(|acc, next| Expr::BinaryOp {
        left: Box::new(acc),
        op: sqlparser::ast::BinaryOperator::And,
        right: Box::new(next),
    })
}

fn build_fragment_projection(
    original: &Select,
    partition_key: &str,
    available: &BTreeSet<String>,
    strip_select: bool,
) -> Vec<SelectItem> {
    if !strip_select {
        return original.projection.clone();
    }
    let qualifier = available.iter().next().cloned();
    let expr = match qualifier {
        Some(alias) => Expr::CompoundIdentifier(vec![
            sqlparser::ast::Ident::new(alias),
            sqlparser::ast::Ident::new(partition_key),
        ]),
        None => Expr::Identifier(sqlparser::ast::Ident::new(partition_key)),
    };
    vec![SelectItem::UnnamedExpr(expr)]
}

/// A tiny insertion-ordered map so `FROM`-list iteration order stays
/// deterministic without pulling in the `indexmap` crate for one use site.
mod indexmap_like {
    use sqlparser::ast::TableFactor;

    #[derive(Default)]
    pub struct OrderedMap {
        entries: Vec<(String, TableFactor)>,
    }

    impl OrderedMap {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&mut self, key: String, value: TableFactor) {
            if let Some(existing) = self.entries.iter_mut().find(|(k, _)| *k == key) {
                existing.1 = value;
            } else {
                self.entries.push((key, value));
            }
        }

        pub fn get(&self, key: &str) -> Option<&TableFactor> {
            self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
        }

        pub fn keys(&self) -> impl Iterator<Item = &String> {
            self.entries.iter().map(|(k, _)| k)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[test]
    fn single_table_query_yields_one_fragment() {
        let q = normalize("SELECT * FROM foo x WHERE x.zipcode = 1").unwrap();
        let opts = FragmentOptions::default();
        let frags = enumerate_fragments(&q, "zipcode", &opts).unwrap();
        assert_eq!(frags.len(), 1);
    }

    #[test]
    fn two_table_distance_query_yields_connected_fragment() {
        let q = normalize(
            "SELECT * FROM a a1, b b1 WHERE dist(a1.g, b1.g) <= 1 AND a1.zipcode = 5",
        )
        .unwrap();
        let opts = FragmentOptions {
            min_component_size: 2,
            max_component_size: 2,
            ..FragmentOptions::default()
        };
        let frags = enumerate_fragments(&q, "zipcode", &opts).unwrap();
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].aliases.len(), 2);
    }

    #[test]
    fn single_alias_threshold_keeps_its_exact_literal() {
        let opts = FragmentOptions {
            bucket_step: 100.0,
            ..FragmentOptions::default()
        };
        let a = normalize("SELECT * FROM orders o WHERE o.total > 9.5").unwrap();
        let b = normalize("SELECT * FROM orders o WHERE o.total > 9.7").unwrap();
        let frag_a = &enumerate_fragments(&a, "zipcode", &opts).unwrap()[0];
        let frag_b = &enumerate_fragments(&b, "zipcode", &opts).unwrap()[0];
        // A single-alias attribute filter is not a distance threshold: it
        // must never be bucketed, so the two queries stay distinct fragments.
        assert_ne!(frag_a.query.to_string(), frag_b.query.to_string());
        assert!(frag_a.query.to_string().contains("9.5"));
        assert!(frag_b.query.to_string().contains("9.7"));
    }
}
