//! `rewrite_with_partition_keys` (§4.1 public contract) and the five
//! injection methods it supports. Each method adds the same logical
//! restriction — "this alias's partition key is one of these values" — in a
//! different shape, trading client-side memory, planner friendliness and
//! setup cost against each other (§4.5 describes when a caller would pick
//! one over another).

use crate::dialect::dialect;
use crate::error::{Result, SqlError};
use crate::normalize::top_select_mut;
use partitioncache_core::PartitionValue;
use sqlparser::ast::{Expr, Query, SetExpr, TableWithJoins};
use sqlparser::parser::Parser;

/// Which of the five shapes to inject the partition-key restriction as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMethod {
    InList,
    ValuesList,
    InSubquery,
    TempTableIn,
    TempTableJoin,
}

/// The result of a rewrite: the statements a caller must run before the
/// main query (temp-table creation/population, empty unless the method
/// needs one) and the rewritten query itself.
pub struct Rewritten {
    pub setup_statements: Vec<String>,
    pub query: Query,
}

fn quote_literal(value: &PartitionValue) -> String {
    match value {
        PartitionValue::Integer(i) => i.to_string(),
        PartitionValue::Float(f) => f.to_string(),
        PartitionValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        PartitionValue::Timestamp(t) => format!("'{}'", t.to_rfc3339()),
        PartitionValue::Geometry(g) => format!("'{}'", g.replace('\'', "''")),
    }
}

/// Parses a boolean expression snippet (e.g. `"x.a IN (1, 2)"`) standing
/// alone, the way a `WHERE` clause would contain it. Exposed for the
/// facade's lazy-snippet injection, which builds its own predicate text
/// from a cache-backend SQL fragment rather than a list of literal values.
pub fn parse_predicate_expr(snippet: &str) -> Result<Expr> {
    parse_expr(snippet)
}

fn parse_expr(snippet: &str) -> Result<Expr> {
    let sql = format!("SELECT 1 WHERE {snippet}");
    let statements =
        Parser::parse_sql(&dialect(), &sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = statements
        .into_iter()
        .next()
        .ok_or_else(|| SqlError::Parse("empty expression".to_string()))?;
    match stmt {
        sqlparser::ast::Statement::Query(q) => match *q.body {
            SetExpr::Select(select) => select
                .selection
                .ok_or_else(|| SqlError::Parse("expected expression".to_string())),
            _ => Err(SqlError::Parse("expected a SELECT".to_string())),
        },
        _ => Err(SqlError::Parse("expected a SELECT".to_string())),
    }
}

/// Parses a `FROM`-list snippet (e.g. `"foo AS p0"` or `"dummy JOIN foo ON
/// …"`) into a single [`TableWithJoins`] entry. Exposed beyond this module
/// because the facade's p0 rewrite needs the same primitive to splice a
/// materialized-view table into an existing `FROM` list.
pub fn parse_table_with_joins(snippet: &str) -> Result<TableWithJoins> {
    let sql = format!("SELECT 1 FROM {snippet}");
    let statements =
        Parser::parse_sql(&dialect(), &sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = statements
        .into_iter()
        .next()
        .ok_or_else(|| SqlError::Parse("empty FROM clause".to_string()))?;
    match stmt {
        sqlparser::ast::Statement::Query(q) => match *q.body {
            SetExpr::Select(select) => select
                .from
                .into_iter()
                .next()
                .ok_or_else(|| SqlError::Parse("expected a FROM list".to_string())),
            _ => Err(SqlError::Parse("expected a SELECT".to_string())),
        },
        _ => Err(SqlError::Parse("expected a SELECT".to_string())),
    }
}

/// Returns the alias of the first table in the outermost `FROM` list, the
/// default target when the caller doesn't pass `alias`. Alias detection
/// matches on the parsed `Ident`, never on rendered text, so it can never
/// be fooled by a substring match.
pub fn default_alias(query: &Query) -> Result<String> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::InvalidArgument("query has no FROM list".to_string())),
    };
    let first = select
        .from
        .first()
        .ok_or_else(|| SqlError::InvalidArgument("query has no FROM list".to_string()))?;
    crate::normalize::table_name_and_alias(&first.relation)
        .map(|(_, alias)| alias)
        .ok_or_else(|| SqlError::InvalidArgument("FROM list has no plain table reference".to_string()))
}

/// Rewrites `query` to additionally restrict `alias.partition_key` to
/// `keys`, using the chosen injection `method`. `alias` defaults to the
/// first table in the outermost `FROM` list when `None`.
pub fn rewrite_with_partition_keys(
    query: &Query,
    keys: &[PartitionValue],
    partition_key: &str,
    method: RewriteMethod,
    alias: Option<&str>,
) -> Result<Rewritten> {
    let mut rewritten = query.clone();
    let target_alias = match alias {
        Some(a) => a.to_string(),
        None => default_alias(query)?,
    };
    let column = format!("{target_alias}.{partition_key}");
    let literals: Vec<String> = keys.iter().map(quote_literal).collect();

    let (setup_statements, predicate, extra_join) = match method {
        RewriteMethod::InList => {
            let list = literals.join(", ");
            (Vec::new(), Some(format!("{column} IN ({list})")), None)
        }
        RewriteMethod::ValuesList => {
            let rows: Vec<String> = literals.iter().map(|v| format!("({v})")).collect();
            let predicate = format!("{column} IN (VALUES {})", rows.join(", "));
            (Vec::new(), Some(predicate), None)
        }
        RewriteMethod::InSubquery => {
            let rows: Vec<String> = literals.iter().map(|v| format!("({v})")).collect();
            let predicate = format!(
                "{column} IN (SELECT v FROM (VALUES {}) AS partitioncache_keys(v))",
                rows.join(", ")
            );
            (Vec::new(), Some(predicate), None)
        }
        RewriteMethod::TempTableIn => {
            let (setup, temp_table) = temp_table_setup(partition_key, &literals);
            let predicate = format!("{column} IN (SELECT pk_value FROM {temp_table})");
            (setup, Some(predicate), None)
        }
        RewriteMethod::TempTableJoin => {
            let (setup, temp_table) = temp_table_setup(partition_key, &literals);
            let join_sql = format!("{temp_table} ON {column} = {temp_table}.pk_value");
            let twj = parse_table_with_joins(&format!("dummy JOIN {join_sql}"))?;
            let join = twj
                .joins
                .into_iter()
                .next()
                .ok_or_else(|| SqlError::InvalidArgument("failed to build temp-table join".to_string()))?;
            (setup, None, Some(join))
        }
    };

    let select = top_select_mut(&mut rewritten)?;
    if let Some(predicate) = predicate {
        let expr = parse_expr(&predicate)?;
        and_predicate(select, expr);
    }
    if let Some(join) = extra_join {
        if let Some(twj) = select.from.first_mut() {
            twj.joins.push(join);
        }
    }

    Ok(Rewritten {
        setup_statements,
        query: rewritten,
    })
}

/// ANDs `expr` onto `select`'s existing `WHERE` clause, or sets it as the
/// whole clause if there wasn't one. Exposed for the facade's lazy and p0
/// rewrites, which inject a predicate the same way but build `expr` from a
/// different source (a cache-backend SQL snippet, an equijoin condition).
pub fn and_predicate(select: &mut sqlparser::ast::Select, expr: Expr) {
    select.selection = Some(match select.selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(existing),
            op: sqlparser::ast::BinaryOperator::And,
            right: Box::new(expr),
        },
        None => expr,
    });
}

fn temp_table_setup(partition_key: &str, literals: &[String]) -> (Vec<String>, String) {
    let temp_table = format!("tmp_cache_keys_{partition_key}");
    let rows: Vec<String> = literals.iter().map(|v| format!("({v})")).collect();
    let setup = vec![
        format!("CREATE TEMP TABLE IF NOT EXISTS {temp_table} (pk_value TEXT) ON COMMIT DROP"),
        format!("TRUNCATE {temp_table}"),
        format!("INSERT INTO {temp_table} (pk_value) VALUES {}", rows.join(", ")),
        format!("CREATE INDEX ON {temp_table} (pk_value)"),
    ];
    (setup, temp_table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::parse_select;

    fn keys() -> Vec<PartitionValue> {
        vec![PartitionValue::Integer(1), PartitionValue::Integer(2)]
    }

    #[test]
    fn in_list_injects_literal_list() {
        let q = parse_select("SELECT * FROM foo x WHERE x.a = 1").unwrap();
        let r = rewrite_with_partition_keys(&q, &keys(), "zipcode", RewriteMethod::InList, None)
            .unwrap();
        let text = r.query.to_string();
        assert!(text.contains("x.zipcode IN (1, 2)"));
    }

    #[test]
    fn values_list_uses_values_syntax() {
        let q = parse_select("SELECT * FROM foo x WHERE x.a = 1").unwrap();
        let r = rewrite_with_partition_keys(&q, &keys(), "zipcode", RewriteMethod::ValuesList, None)
            .unwrap();
        assert!(r.query.to_string().contains("VALUES (1), (2)") || r.query.to_string().contains("VALUES (1),(2)"));
    }

    #[test]
    fn temp_table_in_emits_setup_statements() {
        let q = parse_select("SELECT * FROM foo x WHERE x.a = 1").unwrap();
        let r = rewrite_with_partition_keys(&q, &keys(), "zipcode", RewriteMethod::TempTableIn, None)
            .unwrap();
        assert_eq!(r.setup_statements.len(), 4);
        assert!(r.query.to_string().contains("tmp_cache_keys_zipcode"));
    }

    #[test]
    fn alias_override_is_respected() {
        let q = parse_select("SELECT * FROM foo x WHERE x.a = 1").unwrap();
        let r = rewrite_with_partition_keys(
            &q,
            &keys(),
            "zipcode",
            RewriteMethod::InList,
            Some("custom"),
        )
        .unwrap();
        assert!(r.query.to_string().contains("custom.zipcode"));
    }
}
