//! Canonicalization (§4.1 "Canonicalization"): rename every `FROM`-list
//! alias to `t1, t2, …` in order of first appearance, sort the top-level
//! `WHERE` conjuncts lexicographically, lowercase SQL keywords and drop the
//! trailing semicolon. Two queries that differ only in alias spelling or
//! conjunct order must canonicalize to byte-identical text, since that text
//! is what gets hashed into a fragment identifier.
//!
//! Alias renaming walks the parsed AST (`Ident`/`CompoundIdentifier` nodes),
//! never the rendered text, so a rename of `t1` can never also clobber `t10`.

use crate::conditions::split_conjuncts;
use crate::normalize::top_select_mut;
use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Query, Select, SelectItem, SetExpr,
    TableFactor,
};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Renames every alias in `select`'s `FROM` list to `t1, t2, …` in order of
/// first appearance, and rewrites every reference to those aliases in the
/// projection list and `WHERE` clause. Returns the old-alias -> new-alias
/// mapping.
pub fn rename_aliases(select: &mut Select) -> BTreeMap<String, String> {
    let mut mapping = BTreeMap::new();
    let mut next = 1usize;
    for twj in &mut select.from {
        if let TableFactor::Table { alias, name, .. } = &mut twj.relation {
            let old = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| name.to_string());
            let new_name = format!("t{next}");
            next += 1;
            if let Some(alias) = alias {
                alias.name.value = new_name.clone();
            } else {
                *alias = Some(sqlparser::ast::TableAlias {
                    name: sqlparser::ast::Ident::new(new_name.clone()),
                    columns: Vec::new(),
                });
            }
            mapping.insert(old, new_name);
        }
    }
    for item in &mut select.projection {
        rename_select_item(item, &mapping);
    }
    if let Some(expr) = &mut select.selection {
        rename_expr_aliases(expr, &mapping);
    }
    mapping
}

fn rename_select_item(item: &mut SelectItem, mapping: &BTreeMap<String, String>) {
    match item {
        SelectItem::UnnamedExpr(e) | SelectItem::ExprWithAlias { expr: e, .. } => {
            rename_expr_aliases(e, mapping);
        }
        _ => {}
    }
}

fn rename_expr_aliases(expr: &mut Expr, mapping: &BTreeMap<String, String>) {
    match expr {
        Expr::CompoundIdentifier(parts) => {
            if let Some(first) = parts.first_mut() {
                if let Some(new_name) = mapping.get(&first.value) {
                    first.value = new_name.clone();
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            rename_expr_aliases(left, mapping);
            rename_expr_aliases(right, mapping);
        }
        Expr::UnaryOp { expr, .. }
        | Expr::Nested(expr)
        | Expr::Cast { expr, .. }
        | Expr::IsNull(expr)
        | Expr::IsNotNull(expr) => rename_expr_aliases(expr, mapping),
        Expr::Between {
            expr, low, high, ..
        } => {
            rename_expr_aliases(expr, mapping);
            rename_expr_aliases(low, mapping);
            rename_expr_aliases(high, mapping);
        }
        Expr::InList { expr, list, .. } => {
            rename_expr_aliases(expr, mapping);
            for item in list {
                rename_expr_aliases(item, mapping);
            }
        }
        Expr::InSubquery { expr, .. } => rename_expr_aliases(expr, mapping),
        Expr::Function(func) => {
            if let FunctionArguments::List(list) = &mut func.args {
                for arg in &mut list.args {
                    let expr = match arg {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e))
                        | FunctionArg::Named {
                            arg: FunctionArgExpr::Expr(e),
                            ..
                        } => Some(e),
                        _ => None,
                    };
                    if let Some(e) = expr {
                        rename_expr_aliases(e, mapping);
                    }
                }
            }
        }
        _ => {}
    }
}

/// Sorts the top-level `AND`-conjuncts of `expr` lexicographically by their
/// rendered text and rejoins them. Leaves a lone conjunct (no top-level
/// `AND`) unchanged.
pub fn sort_conjuncts(expr: Expr) -> Expr {
    let mut parts = split_conjuncts(&expr);
    if parts.len() <= 1 {
        return expr;
    }
    parts.sort_by_key(|e| e.to_string());
    let mut iter = parts.into_iter();
    let first = iter.next().unwrap();
    iter.fold(first, |acc, next| Expr::BinaryOp {
        left: Box::new(acc),
        op: sqlparser::ast::BinaryOperator::And,
        right: Box::new(next),
    })
}

fn keyword_re() -> &'static regex::Regex {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let keywords = [
            "SELECT", "FROM", "WHERE", "AND", "OR", "AS", "JOIN", "ON", "IN", "NOT", "NULL", "IS",
            "BETWEEN", "LIKE", "ORDER", "BY", "GROUP", "HAVING", "LIMIT", "OFFSET", "DISTINCT",
            "CASE", "WHEN", "THEN", "ELSE", "END", "VALUES", "EXISTS",
        ];
        let pattern = format!(r"(?i)\b({})\b", keywords.join("|"));
        regex::Regex::new(&pattern).unwrap()
    })
}

/// Lowercases every recognized SQL keyword in `sql`, leaving identifiers,
/// string literals and numbers untouched (they never match the keyword
/// list's word-boundary pattern).
pub fn lowercase_keywords(sql: &str) -> String {
    keyword_re()
        .replace_all(sql, |caps: &regex::Captures| caps[0].to_lowercase())
        .to_string()
}

/// Renames aliases, sorts conjuncts and renders `query` to its canonical
/// text form: no trailing semicolon, lowercased keywords, and (per the
/// empty-`WHERE` safety rule) no trailing `WHERE` token when there is no
/// predicate left to render.
pub fn canonicalize(query: &mut Query) -> crate::error::Result<String> {
    let select = top_select_mut(query)?;
    rename_aliases(select);
    if let Some(expr) = select.selection.take() {
        select.selection = Some(sort_conjuncts(expr));
    }
    if matches!(query.body.as_ref(), SetExpr::Select(s) if s.selection.is_none()) {
        // Nothing to do: sqlparser's Display already omits `WHERE` when
        // `selection` is `None`, so there is no trailing-WHERE token to
        // strip.
    }
    let rendered = query.to_string();
    let trimmed = rendered.trim().trim_end_matches(';').trim();
    Ok(lowercase_keywords(trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;

    #[test]
    fn aliases_renamed_in_order_of_first_appearance() {
        let mut q = normalize("SELECT x.a FROM foo x, bar y WHERE x.a = y.b").unwrap();
        let canonical = canonicalize(&mut q).unwrap();
        assert!(canonical.contains("t1.a"));
        assert!(canonical.contains("t2.b"));
        assert!(!canonical.contains("x.a"));
    }

    #[test]
    fn t1_rename_does_not_corrupt_t10() {
        let mut q = normalize("SELECT t10.a FROM foo t10 WHERE t10.a = 1").unwrap();
        let canonical = canonicalize(&mut q).unwrap();
        assert!(canonical.contains("t1.a = 1"));
    }

    #[test]
    fn conjuncts_are_sorted_regardless_of_source_order() {
        let mut a = normalize("SELECT * FROM foo x WHERE x.b = 2 AND x.a = 1").unwrap();
        let mut b = normalize("SELECT * FROM foo x WHERE x.a = 1 AND x.b = 2").unwrap();
        assert_eq!(canonicalize(&mut a).unwrap(), canonicalize(&mut b).unwrap());
    }

    #[test]
    fn keywords_are_lowercased() {
        let mut q = normalize("SELECT * FROM foo x WHERE x.a = 1").unwrap();
        let canonical = canonicalize(&mut q).unwrap();
        assert!(canonical.starts_with("select"));
        assert!(canonical.contains(" from "));
        assert!(canonical.contains(" where "));
    }

    #[test]
    fn no_trailing_where_when_predicate_is_empty() {
        let mut q = normalize("SELECT * FROM foo x").unwrap();
        let canonical = canonicalize(&mut q).unwrap();
        assert!(!canonical.trim_end().to_lowercase().ends_with("where"));
    }

    #[test]
    fn no_trailing_semicolon() {
        let mut q = normalize("SELECT * FROM foo x WHERE x.a = 1;").unwrap();
        let canonical = canonicalize(&mut q).unwrap();
        assert!(!canonical.ends_with(';'));
    }
}
