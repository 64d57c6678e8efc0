//! Distance-predicate bucketing (§4.1 "Bucketing"): round a numeric
//! threshold compared against a two-alias predicate up to the next multiple
//! of `bucket_step`, so that nearby distance queries share the same cache
//! fragment instead of each minting its own. Negative thresholds are left
//! untouched, since "closer than a negative distance" is never satisfiable
//! and rounding it would change its meaning.
//!
//! Only applies to conditions already classified as two-alias
//! (`distance_conditions`, see `conditions.rs`) and only to `<`/`<=`: a
//! single-alias attribute filter like `o.total > 9.5` is not a distance
//! threshold and must keep its own fragment identity per its exact literal.

use sqlparser::ast::{BinaryOperator, Expr, Value};
use std::collections::BTreeMap;

/// Default bucket width applied when a caller does not override it.
pub const DEFAULT_BUCKET_STEP: f64 = 1.0;

/// Rewrites every `<`/`<=` comparison against a non-negative numeric
/// literal in `expr`, rounding the literal up to the next multiple of
/// `bucket_step`. Returns a new expression; `expr` is left untouched.
pub fn bucket_expr(expr: &Expr, bucket_step: f64) -> Expr {
    match expr {
        Expr::BinaryOp { left, op, right } if is_ordering_op(op) => Expr::BinaryOp {
            left: Box::new(bucket_side(left, bucket_step)),
            op: op.clone(),
            right: Box::new(bucket_side(right, bucket_step)),
        },
        Expr::BinaryOp { left, op, right } => Expr::BinaryOp {
            left: Box::new(bucket_expr(left, bucket_step)),
            op: op.clone(),
            right: Box::new(bucket_expr(right, bucket_step)),
        },
        Expr::Nested(inner) => Expr::Nested(Box::new(bucket_expr(inner, bucket_step))),
        other => other.clone(),
    }
}

fn is_ordering_op(op: &BinaryOperator) -> bool {
    matches!(op, BinaryOperator::Lt | BinaryOperator::LtEq)
}

/// Applies [`bucket_expr`] to every already-classified two-alias condition
/// in `distance_conditions`, in place. Single-alias `attribute_conditions`
/// and everything else in a [`ConditionSet`](crate::conditions::ConditionSet)
/// are left alone.
pub fn bucket_distance_conditions(
    distance_conditions: &mut BTreeMap<(String, String), Vec<Expr>>,
    bucket_step: f64,
) {
    for exprs in distance_conditions.values_mut() {
        for expr in exprs.iter_mut() {
            *expr = bucket_expr(expr, bucket_step);
        }
    }
}

fn bucket_side(expr: &Expr, bucket_step: f64) -> Expr {
    if let Expr::Value(Value::Number(raw, long)) = expr {
        if let Some(bucketed) = bucketed_literal(raw, bucket_step) {
            return Expr::Value(Value::Number(bucketed, *long));
        }
    }
    expr.clone()
}

fn bucketed_literal(raw: &str, bucket_step: f64) -> Option<String> {
    if bucket_step <= 0.0 {
        return None;
    }
    let value: f64 = raw.parse().ok()?;
    if value < 0.0 {
        return None;
    }
    let bucketed = (value / bucket_step).ceil() * bucket_step;
    Some(format_number(bucketed))
}

fn format_number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        let s = format!("{v}");
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{parse_select, top_select};

    fn where_expr(sql: &str) -> Expr {
        let q = parse_select(sql).unwrap();
        top_select(&q).unwrap().selection.clone().unwrap()
    }

    #[test]
    fn rounds_up_to_next_multiple() {
        let expr = where_expr("SELECT * FROM a, b WHERE dist(a.geom, b.geom) <= 250");
        let bucketed = bucket_expr(&expr, 100.0);
        assert_eq!(
            bucketed.to_string(),
            "dist(a.geom, b.geom) <= 300"
        );
    }

    #[test]
    fn exact_multiple_is_unchanged() {
        let expr = where_expr("SELECT * FROM a, b WHERE dist(a.geom, b.geom) <= 300");
        let bucketed = bucket_expr(&expr, 100.0);
        assert_eq!(bucketed.to_string(), expr.to_string());
    }

    #[test]
    fn negative_threshold_is_left_untouched() {
        let expr = where_expr("SELECT * FROM a, b WHERE a.delta_x >= -5");
        let bucketed = bucket_expr(&expr, 1.0);
        assert_eq!(bucketed.to_string(), expr.to_string());
    }

    #[test]
    fn greater_than_is_never_bucketed() {
        let expr = where_expr("SELECT * FROM a, b WHERE dist(a.geom, b.geom) > 250");
        let bucketed = bucket_expr(&expr, 100.0);
        assert_eq!(bucketed.to_string(), expr.to_string());
    }

    #[test]
    fn bucket_distance_conditions_leaves_attribute_conditions_untouched() {
        use crate::conditions::extract_conditions;
        use std::collections::BTreeSet;

        let q = parse_select(
            "SELECT * FROM orders o, shipments s WHERE o.total > 9.5 AND dist(o.g, s.g) <= 250",
        )
        .unwrap();
        let select = top_select(&q).unwrap();
        let known: BTreeSet<String> = ["o".to_string(), "s".to_string()].into_iter().collect();
        let mut conditions = extract_conditions(select.selection.as_ref(), &known, "zipcode");
        bucket_distance_conditions(&mut conditions.distance_conditions, 100.0);

        let attribute = conditions.attribute_conditions.get("o").unwrap();
        assert_eq!(attribute[0].to_string(), "o.total > 9.5");

        let distance = conditions
            .distance_conditions
            .values()
            .next()
            .unwrap();
        assert_eq!(distance[0].to_string(), "dist(o.g, s.g) <= 300");
    }
}
