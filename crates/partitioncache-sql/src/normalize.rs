//! Step 1-4 of the normalization pipeline (§4.1): strip comments and
//! collapse whitespace at the text level, then operate on the parsed AST to
//! drop presentation clauses, flatten joins into comma-joins and remove
//! redundant outer parentheses around the top-level `WHERE`. Every step is
//! idempotent, per the spec's testable property that `canonicalize` is
//! idempotent.

use crate::dialect::dialect;
use crate::error::{Result, SqlError};
use regex::Regex;
use sqlparser::ast::{
    Expr, GroupByExpr, Join, JoinConstraint, JoinOperator, Query, Select, SetExpr, Statement,
    TableFactor, TableWithJoins,
};
use sqlparser::parser::Parser;
use std::sync::OnceLock;

fn line_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"--[^\n]*").unwrap())
}

fn block_comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)/\*.*?\*/").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Strips `--` and `/* */` comments, then collapses runs of whitespace to a
/// single space.
pub fn strip_comments_and_collapse_whitespace(sql: &str) -> String {
    let no_line_comments = line_comment_re().replace_all(sql, "");
    let no_comments = block_comment_re().replace_all(&no_line_comments, " ");
    whitespace_re()
        .replace_all(no_comments.trim(), " ")
        .to_string()
}

/// Parses a normalized, single-statement `SELECT` query.
pub fn parse_select(sql: &str) -> Result<Query> {
    let stripped = strip_comments_and_collapse_whitespace(sql);
    let statements = Parser::parse_sql(&dialect(), &stripped)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = statements
        .into_iter()
        .next()
        .ok_or_else(|| SqlError::Parse("empty query".to_string()))?;
    match stmt {
        Statement::Query(q) => Ok(*q),
        _ => Err(SqlError::NotASelect),
    }
}

/// Removes `ORDER BY`, `LIMIT`/`OFFSET`, `GROUP BY` and `HAVING` from the
/// outermost query only (step 2). Fragments are for set membership, which
/// these clauses never affect.
pub fn strip_presentation_clauses(query: &mut Query) {
    query.order_by = None;
    query.limit = None;
    query.offset = None;
    query.fetch = None;
    if let SetExpr::Select(select) = query.body.as_mut() {
        select.group_by = GroupByExpr::Expressions(Vec::new(), Vec::new());
        select.having = None;
    }
}

/// Converts `FROM a JOIN b ON cond` into `FROM a, b WHERE cond AND …` on the
/// outermost `SELECT` only (step 3). Joins nested inside `EXISTS`,
/// `IN (SELECT …)`, CTEs and scalar subqueries are left untouched because
/// this function never recurses into `Expr` subqueries.
pub fn flatten_joins_to_comma(query: &mut Query) {
    if let SetExpr::Select(select) = query.body.as_mut() {
        flatten_select_joins(select);
    }
}

fn flatten_select_joins(select: &mut Select) {
    let mut flattened_from = Vec::new();
    let mut extra_conditions = Vec::new();
    for twj in select.from.drain(..) {
        flattened_from.push(TableWithJoins {
            relation: twj.relation,
            joins: Vec::new(),
        });
        for join in twj.joins {
            let Join {
                relation,
                join_operator,
                ..
            } = join;
            if let Some(cond) = join_constraint_to_expr(&join_operator) {
                extra_conditions.push(cond);
            }
            flattened_from.push(TableWithJoins {
                relation,
                joins: Vec::new(),
            });
        }
    }
    select.from = flattened_from;
    for cond in extra_conditions {
        select.selection = Some(match select.selection.take() {
            Some(existing) => Expr::BinaryOp {
                left: Box::new(existing),
                op: sqlparser::ast::BinaryOperator::And,
                right: Box::new(cond),
            },
            None => cond,
        });
    }
}

fn join_constraint_to_expr(op: &JoinOperator) -> Option<Expr> {
    let constraint = match op {
        JoinOperator::Inner(c)
        | JoinOperator::LeftOuter(c)
        | JoinOperator::RightOuter(c)
        | JoinOperator::FullOuter(c) => c,
        _ => return None,
    };
    match constraint {
        JoinConstraint::On(expr) => Some(expr.clone()),
        _ => None,
    }
}

/// Unwraps redundant parentheses directly around the top-level `WHERE`
/// expression (step 4). Nested parens inside individual conjuncts are left
/// alone; only the outermost wrapper is flattened.
pub fn flatten_outer_parens(query: &mut Query) {
    if let SetExpr::Select(select) = query.body.as_mut() {
        if let Some(expr) = select.selection.take() {
            select.selection = Some(unwrap_nested(expr));
        }
    }
}

fn unwrap_nested(expr: Expr) -> Expr {
    match expr {
        Expr::Nested(inner) => unwrap_nested(*inner),
        other => other,
    }
}

/// Returns the single top-level `SELECT` of a query, erroring on set
/// operations (`UNION`, etc.) which the decomposer does not support.
pub fn top_select(query: &Query) -> Result<&Select> {
    match query.body.as_ref() {
        SetExpr::Select(s) => Ok(s),
        _ => Err(SqlError::InvalidArgument(
            "only single SELECT statements can be decomposed into fragments".to_string(),
        )),
    }
}

pub fn top_select_mut(query: &mut Query) -> Result<&mut Select> {
    match query.body.as_mut() {
        SetExpr::Select(s) => Ok(s),
        _ => Err(SqlError::InvalidArgument(
            "only single SELECT statements can be decomposed into fragments".to_string(),
        )),
    }
}

/// Applies steps 1-4 in order and returns the parsed, flattened query.
pub fn normalize(sql: &str) -> Result<Query> {
    let mut query = parse_select(sql)?;
    strip_presentation_clauses(&mut query);
    flatten_joins_to_comma(&mut query);
    flatten_outer_parens(&mut query);
    Ok(query)
}

/// Returns `true` when `relation` is a plain table reference (as opposed to
/// a derived table, CTE reference resolved elsewhere, or a function call).
pub fn table_name_and_alias(relation: &TableFactor) -> Option<(String, String)> {
    match relation {
        TableFactor::Table { name, alias, .. } => {
            let table_name = name.to_string();
            let alias_name = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| table_name.clone());
            Some((table_name, alias_name))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_line_and_block_comments() {
        let sql = "SELECT * -- comment\nFROM t /* block \n comment */ WHERE 1=1";
        let out = strip_comments_and_collapse_whitespace(sql);
        assert_eq!(out, "SELECT * FROM t WHERE 1=1");
    }

    #[test]
    fn join_becomes_comma_join_with_and_condition() {
        let mut q = parse_select(
            "SELECT * FROM a JOIN b ON a.id = b.id WHERE a.x = 1",
        )
        .unwrap();
        flatten_joins_to_comma(&mut q);
        let select = top_select(&q).unwrap();
        assert_eq!(select.from.len(), 2);
        assert!(select.from.iter().all(|t| t.joins.is_empty()));
        let rendered = select.selection.as_ref().unwrap().to_string();
        assert!(rendered.contains("a.id = b.id"));
        assert!(rendered.contains("a.x = 1"));
    }

    #[test]
    fn presentation_clauses_are_removed() {
        let mut q = parse_select(
            "SELECT a.x FROM a WHERE a.x > 1 GROUP BY a.x HAVING count(*) > 1 ORDER BY a.x LIMIT 10",
        )
        .unwrap();
        strip_presentation_clauses(&mut q);
        assert!(q.order_by.is_none());
        assert!(q.limit.is_none());
        let select = top_select(&q).unwrap();
        assert!(select.having.is_none());
    }
}
