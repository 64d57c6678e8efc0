//! Condition extraction (§4.1 "Condition extraction"): group the top-level
//! conjunctive `WHERE` predicates by the set of distinct table aliases each
//! one references.

use sqlparser::ast::{Expr, SetExpr, Statement};
use std::collections::{BTreeMap, BTreeSet};

/// The buckets a single top-level conjunct can fall into, keyed by how many
/// distinct aliases (from the query's `FROM` list) it references.
#[derive(Debug, Default, Clone)]
pub struct ConditionSet {
    /// Conditions referencing exactly one alias.
    pub attribute_conditions: BTreeMap<String, Vec<Expr>>,
    /// Conditions referencing exactly two aliases. The label is historical:
    /// not every entry is a geometric distance predicate.
    pub distance_conditions: BTreeMap<(String, String), Vec<Expr>>,
    /// Conditions referencing three or more aliases.
    pub other_functions: BTreeMap<Vec<String>, Vec<Expr>>,
    /// Conditions referencing zero aliases (literal/constant expressions).
    pub literal_conditions: Vec<Expr>,
    /// Disjunctions (`OR` groups), keyed by the aliases they reference.
    pub or_conditions: BTreeMap<Vec<String>, Vec<Expr>>,
    /// Explicit restrictions on the partition key (`pk IN (...)`, `pk = v`).
    pub partition_key_conditions: Vec<Expr>,
}

/// Splits a `WHERE` expression into its top-level `AND`-conjuncts. `OR` at
/// the top level is treated as a single conjunct (it becomes one entry in
/// `or_conditions`), matching the spec's "OR-groups" bucket.
pub fn split_conjuncts(expr: &Expr) -> Vec<Expr> {
    match expr {
        Expr::BinaryOp {
            left,
            op: sqlparser::ast::BinaryOperator::And,
            right,
        } => {
            let mut out = split_conjuncts(left);
            out.extend(split_conjuncts(right));
            out
        }
        Expr::Nested(inner) => split_conjuncts(inner),
        other => vec![other.clone()],
    }
}

fn is_or(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::BinaryOp {
            op: sqlparser::ast::BinaryOperator::Or,
            ..
        }
    )
}

/// Collects the set of `FROM`-list aliases an expression references, by
/// walking every identifier and compound identifier in it.
pub fn referenced_aliases(expr: &Expr, known_aliases: &BTreeSet<String>) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    collect_aliases_rec(expr, known_aliases, &mut found);
    found
}

fn collect_aliases_rec(expr: &Expr, known: &BTreeSet<String>, out: &mut BTreeSet<String>) {
    use Expr::*;
    match expr {
        CompoundIdentifier(parts) => {
            if let Some(first) = parts.first() {
                if known.contains(&first.value) {
                    out.insert(first.value.clone());
                }
            }
        }
        Identifier(_) => {}
        BinaryOp { left, right, .. } => {
            collect_aliases_rec(left, known, out);
            collect_aliases_rec(right, known, out);
        }
        UnaryOp { expr, .. } | Nested(expr) | Cast { expr, .. } | IsNull(expr) | IsNotNull(expr) => {
            collect_aliases_rec(expr, known, out);
        }
        Between {
            expr, low, high, ..
        } => {
            collect_aliases_rec(expr, known, out);
            collect_aliases_rec(low, known, out);
            collect_aliases_rec(high, known, out);
        }
        InList { expr, list, .. } => {
            collect_aliases_rec(expr, known, out);
            for item in list {
                collect_aliases_rec(item, known, out);
            }
        }
        InSubquery { expr, .. } => {
            collect_aliases_rec(expr, known, out);
        }
        Function(func) => {
            if let sqlparser::ast::FunctionArguments::List(list) = &func.args {
                for arg in &list.args {
                    if let sqlparser::ast::FunctionArg::Unnamed(
                        sqlparser::ast::FunctionArgExpr::Expr(e),
                    )
                    | sqlparser::ast::FunctionArg::Named {
                        arg: sqlparser::ast::FunctionArgExpr::Expr(e),
                        ..
                    } = arg
                    {
                        collect_aliases_rec(e, known, out);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Returns `true` if any identifier in `expr` names `column_name`,
/// regardless of which alias (or none) qualifies it. Partition-key
/// detection is textual by design (§4.1).
pub fn mentions_column(expr: &Expr, column_name: &str) -> bool {
    use Expr::*;
    match expr {
        Identifier(ident) => ident.value.eq_ignore_ascii_case(column_name),
        CompoundIdentifier(parts) => parts
            .last()
            .is_some_and(|p| p.value.eq_ignore_ascii_case(column_name)),
        BinaryOp { left, right, .. } => {
            mentions_column(left, column_name) || mentions_column(right, column_name)
        }
        UnaryOp { expr, .. } | Nested(expr) | Cast { expr, .. } | IsNull(expr) | IsNotNull(expr) => {
            mentions_column(expr, column_name)
        }
        InList { expr, .. } | InSubquery { expr, .. } | Between { expr, .. } => {
            mentions_column(expr, column_name)
        }
        _ => false,
    }
}

fn is_partition_key_condition(expr: &Expr, partition_key: &str) -> bool {
    match expr {
        Expr::BinaryOp {
            left,
            op: sqlparser::ast::BinaryOperator::Eq,
            right,
        } => mentions_column(left, partition_key) || mentions_column(right, partition_key),
        Expr::InList { expr, negated, .. } if !negated => mentions_column(expr, partition_key),
        Expr::InSubquery { expr, negated, subquery } if !negated => {
            mentions_column(expr, partition_key)
                && matches!(subquery.body.as_ref(), SetExpr::Values(_))
        }
        _ => false,
    }
}

/// Groups every top-level conjunct of `where_expr` into a [`ConditionSet`].
pub fn extract_conditions(
    where_expr: Option<&Expr>,
    known_aliases: &BTreeSet<String>,
    partition_key: &str,
) -> ConditionSet {
    let mut set = ConditionSet::default();
    let Some(where_expr) = where_expr else {
        return set;
    };
    for conjunct in split_conjuncts(where_expr) {
        if is_partition_key_condition(&conjunct, partition_key) {
            set.partition_key_conditions.push(conjunct);
            continue;
        }
        let aliases = referenced_aliases(&conjunct, known_aliases);
        if is_or(&conjunct) {
            let key: Vec<String> = aliases.into_iter().collect();
            set.or_conditions.entry(key).or_default().push(conjunct);
            continue;
        }
        match aliases.len() {
            0 => set.literal_conditions.push(conjunct),
            1 => {
                let alias = aliases.into_iter().next().unwrap();
                set.attribute_conditions.entry(alias).or_default().push(conjunct);
            }
            2 => {
                let mut it = aliases.into_iter();
                let a = it.next().unwrap();
                let b = it.next().unwrap();
                set.distance_conditions.entry((a, b)).or_default().push(conjunct);
            }
            _ => {
                let key: Vec<String> = aliases.into_iter().collect();
                set.other_functions.entry(key).or_default().push(conjunct);
            }
        }
    }
    set
}

/// Returns `true` when no conjunct of `where_expr` mentions `partition_key`
/// by name, which signals a likely unindexable fragment (§4.1).
pub fn missing_partition_key_warning(where_expr: Option<&Expr>, partition_key: &str) -> bool {
    match where_expr {
        None => true,
        Some(expr) => !mentions_column(expr, partition_key),
    }
}

/// Convenience used by callers that still hold the parsed `Statement`.
pub fn is_select(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Query(_))
}
