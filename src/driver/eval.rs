//! In-process filter evaluation and value ordering.
//!
//! These are the reference semantics every driver must reproduce:
//! - numbers compare numerically, strings by byte order, mixed types never
//!   satisfy a range comparison;
//! - `=` compares numbers exactly by value (`1 = 1.0`, but no rounding through
//!   `f64` for large integers) and everything else structurally, and
//!   `= null` matches a missing or null field;
//! - `contains`, `startswith`, `endswith` are case-insensitive over strings,
//!   folding ASCII letters only;
//! - `!=`, `nin`, `notcontains` are exact complements of their positive form.

use std::cmp::Ordering;

use serde_json::{Number, Value};

use super::record::lookup;
use crate::ast::{Condition, FilterArray, FilterItem, FilterNode, Logic, Operator, Record};

/// Evaluate a canonical filter array with strict left-to-right reduction.
/// The empty filter matches everything.
pub fn matches(filters: &FilterArray, record: &Record) -> bool {
    reduce(filters, record).unwrap_or(true)
}

fn reduce(filters: &FilterArray, record: &Record) -> Option<bool> {
    let mut acc: Option<bool> = None;
    let mut join = Logic::And;

    for item in filters.items() {
        let value = match item {
            FilterItem::Logic(logic) => {
                join = *logic;
                continue;
            }
            FilterItem::Condition(c) => matches_condition(c, record),
            FilterItem::Group(group) => match reduce(group, record) {
                Some(v) => v,
                None => continue,
            },
        };
        acc = Some(match (acc, join) {
            (None, _) => value,
            (Some(prev), Logic::And) => prev && value,
            (Some(prev), Logic::Or) => prev || value,
        });
    }

    acc
}

/// Evaluate a filter tree directly; `not` is the boolean complement.
pub fn eval_node(node: &FilterNode, record: &Record) -> bool {
    match node {
        FilterNode::Comparison {
            field,
            operator,
            value,
        } => compare(lookup(record, field), *operator, value),
        FilterNode::And { children } => children.iter().all(|c| eval_node(c, record)),
        FilterNode::Or { children } => {
            children.is_empty() || children.iter().any(|c| eval_node(c, record))
        }
        FilterNode::Not { child } => !eval_node(child, record),
    }
}

pub fn matches_condition(condition: &Condition, record: &Record) -> bool {
    compare(
        lookup(record, &condition.field),
        condition.operator,
        &condition.value,
    )
}

/// Apply one operator to a (possibly missing) field value.
pub fn compare(actual: Option<&Value>, operator: Operator, expected: &Value) -> bool {
    let actual = actual.filter(|v| !v.is_null());
    match operator {
        Operator::Eq => equals(actual, expected),
        Operator::Ne => !equals(actual, expected),
        Operator::Gt => range(actual, expected, |o| o == Ordering::Greater),
        Operator::Gte => range(actual, expected, |o| o != Ordering::Less),
        Operator::Lt => range(actual, expected, |o| o == Ordering::Less),
        Operator::Lte => range(actual, expected, |o| o != Ordering::Greater),
        Operator::In => in_list(actual, expected),
        Operator::Nin => !in_list(actual, expected),
        Operator::Contains => text(actual, expected, |a, e| a.contains(e)),
        Operator::NotContains => !text(actual, expected, |a, e| a.contains(e)),
        Operator::StartsWith => text(actual, expected, |a, e| a.starts_with(e)),
        Operator::EndsWith => text(actual, expected, |a, e| a.ends_with(e)),
        Operator::Between => match between_bounds(expected) {
            Some((low, high)) => {
                range(actual, low, |o| o != Ordering::Less)
                    && range(actual, high, |o| o != Ordering::Greater)
            }
            None => false,
        },
    }
}

/// The `[low, high]` pair of a `between` operand.
pub fn between_bounds(expected: &Value) -> Option<(&Value, &Value)> {
    match expected {
        Value::Array(bounds) if bounds.len() == 2 => Some((&bounds[0], &bounds[1])),
        _ => None,
    }
}

/// Elements of an `in` operand; a scalar operand is a one-element list.
pub fn in_elements(expected: &Value) -> &[Value] {
    match expected {
        Value::Array(items) => items,
        other => std::slice::from_ref(other),
    }
}

fn equals(actual: Option<&Value>, expected: &Value) -> bool {
    match (actual, expected) {
        (None, Value::Null) => true,
        (None, _) | (Some(_), Value::Null) => false,
        (Some(a), e) => values_equal(a, e),
    }
}

fn in_list(actual: Option<&Value>, expected: &Value) -> bool {
    in_elements(expected).iter().any(|e| equals(actual, e))
}

fn range(actual: Option<&Value>, expected: &Value, accept: impl Fn(Ordering) -> bool) -> bool {
    actual
        .and_then(|a| compare_values(a, expected))
        .map(accept)
        .unwrap_or(false)
}

fn text(actual: Option<&Value>, expected: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
    match (actual, expected) {
        (Some(Value::String(a)), Value::String(e)) => {
            test(&a.to_ascii_lowercase(), &e.to_ascii_lowercase())
        }
        _ => false,
    }
}

/// Structural equality with numeric comparison of numbers at any depth.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).map(|w| values_equal(v, w)).unwrap_or(false))
        }
        _ => a == b,
    }
}

/// Exact numeric equality: integers compare as integers, an integer equals
/// a float only when the float is that whole number.
fn numbers_equal(x: &Number, y: &Number) -> bool {
    match (integer(x), integer(y)) {
        (Some(i), Some(j)) => i == j,
        (Some(i), None) => y.as_f64().is_some_and(|f| float_is_integer(f, i)),
        (None, Some(j)) => x.as_f64().is_some_and(|f| float_is_integer(f, j)),
        (None, None) => x.as_f64() == y.as_f64(),
    }
}

fn integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

fn float_is_integer(f: f64, i: i128) -> bool {
    f.fract() == 0.0 && f as i128 == i
}

/// Ordering for range operators: defined only for number/number and
/// string/string pairs.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_bytes().cmp(y.as_bytes())),
        _ => None,
    }
}

/// Rank of a value's type in sort order.
pub fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order used for sorting: type rank first, then value. Arrays and
/// objects of the same rank compare equal.
pub fn sort_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x @ Value::Number(_)), Some(y @ Value::Number(_)))
        | (Some(x @ Value::String(_)), Some(y @ Value::String(_))) => {
            compare_values(x, y).unwrap_or(Ordering::Equal)
        }
        _ => Ordering::Equal,
    }
}

/// JSON number for an aggregate result. Whole values become integers so
/// results read the same whichever backend computed them.
pub fn number_value(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Canonical form of a value for grouping and de-duplication: every number
/// becomes its normalised numeric value at any depth.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) => n.as_f64().map(number_value).unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn check(actual: Value, op: Operator, expected: Value) -> bool {
        compare(Some(&actual), op, &expected)
    }

    #[test]
    fn test_numeric_not_lexicographic() {
        assert!(check(json!(10), Operator::Gt, json!(9)));
        assert!(check(json!(10.5), Operator::Gte, json!(10)));
        assert!(!check(json!("10"), Operator::Gt, json!(9)));
        assert!(check(json!("b"), Operator::Gt, json!("a")));
        assert!(check(json!("B"), Operator::Lt, json!("a")));
    }

    #[test]
    fn test_equality_normalises_numbers_only() {
        assert!(check(json!(30), Operator::Eq, json!(30.0)));
        assert!(!check(json!("30"), Operator::Eq, json!(30)));
        assert!(check(json!([1, {"a": 2}]), Operator::Eq, json!([1.0, {"a": 2.0}])));
        assert!(check(json!(true), Operator::Ne, json!(false)));
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        let big = json!(9_007_199_254_740_993_u64);
        assert!(!check(big.clone(), Operator::Eq, json!(9_007_199_254_740_992_u64)));
        assert!(check(big.clone(), Operator::Eq, json!(9_007_199_254_740_993_i64)));
        assert!(!check(big.clone(), Operator::Eq, json!(9_007_199_254_740_992.0)));
        assert!(check(big, Operator::Nin, json!([9_007_199_254_740_992_u64])));
        assert!(check(json!(-3), Operator::Eq, json!(-3.0)));
        assert!(!check(json!(3), Operator::Eq, json!(3.5)));
        assert!(check(json!(0.25), Operator::Eq, json!(0.25)));
    }

    #[test]
    fn test_null_semantics() {
        assert!(compare(None, Operator::Eq, &Value::Null));
        assert!(compare(Some(&Value::Null), Operator::Eq, &Value::Null));
        assert!(!check(json!(0), Operator::Eq, Value::Null));
        assert!(compare(None, Operator::Ne, &json!(5)));
        assert!(!compare(None, Operator::Gt, &json!(5)));
        assert!(!compare(None, Operator::Lte, &json!(5)));
    }

    #[test]
    fn test_text_operators_case_insensitive() {
        assert!(check(json!("Hello World"), Operator::Contains, json!("WORLD")));
        assert!(check(json!("Hello"), Operator::StartsWith, json!("he")));
        assert!(check(json!("Hello"), Operator::EndsWith, json!("LO")));
        assert!(!check(json!(123), Operator::Contains, json!("1")));
        assert!(compare(None, Operator::NotContains, &json!("x")));
    }

    #[test]
    fn test_text_folding_is_ascii_only() {
        assert!(!check(json!("École"), Operator::Contains, json!("éco")));
        assert!(check(json!("École"), Operator::Contains, json!("ÉCO")));
        assert!(check(json!("Straße"), Operator::StartsWith, json!("STR")));
        assert!(!check(json!("STRASSE"), Operator::EndsWith, json!("ße")));
    }

    #[test]
    fn test_in_and_between() {
        assert!(check(json!(2), Operator::In, json!([1, 2, 3])));
        assert!(!check(json!(4), Operator::In, json!([1, 2, 3])));
        assert!(check(json!(4), Operator::Nin, json!([1, 2, 3])));
        assert!(!check(json!(4), Operator::In, json!([])));
        assert!(check(json!("a"), Operator::In, json!("a")));
        assert!(compare(None, Operator::In, &json!([null, 1])));
        assert!(check(json!(5), Operator::Between, json!([5, 10])));
        assert!(check(json!(10), Operator::Between, json!([5, 10])));
        assert!(!check(json!(11), Operator::Between, json!([5, 10])));
        assert!(!check(json!(7), Operator::Between, json!(5)));
    }

    #[test]
    fn test_matches_left_to_right() {
        let filters = FilterArray::from_value(&json!([
            ["age", ">", 25], "or", ["role", "=", "admin"], "and", ["active", "=", true]
        ]))
        .unwrap();
        // (age > 25 or role = admin) and active
        assert!(!matches(&filters, &record(json!({"age": 30, "active": false}))));
        assert!(matches(&filters, &record(json!({"role": "admin", "active": true}))));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(matches(&FilterArray::new(), &record(json!({}))));
        let only_empty_group = FilterArray::from_value(&json!([[]])).unwrap();
        assert!(matches(&only_empty_group, &record(json!({}))));
    }

    #[test]
    fn test_eval_node_agrees_with_translation() {
        let node = FilterNode::and(vec![
            FilterNode::cmp("a", Operator::Eq, 1),
            FilterNode::not(FilterNode::or(vec![
                FilterNode::cmp("b", Operator::Eq, 2),
                FilterNode::cmp("c", Operator::Contains, "x"),
            ])),
        ]);
        let array = crate::ast::translate(&node).unwrap();
        for r in [
            json!({"a": 1}),
            json!({"a": 1, "b": 2}),
            json!({"a": 1, "c": "XY"}),
            json!({"a": 2}),
        ] {
            let r = record(r);
            assert_eq!(eval_node(&node, &r), matches(&array, &r), "{r:?}");
        }
    }

    #[test]
    fn test_sort_cmp_ranks_types() {
        let mut values = vec![
            Some(json!("b")),
            Some(json!(2)),
            None,
            Some(json!(true)),
            Some(json!("a")),
            Some(json!(-1.5)),
            Some(Value::Null),
            Some(json!({"x": 1})),
        ];
        values.sort_by(|a, b| sort_cmp(a.as_ref(), b.as_ref()));
        assert_eq!(type_rank(values[0].as_ref()), 0);
        assert_eq!(type_rank(values[1].as_ref()), 0);
        assert_eq!(values[2], Some(json!(true)));
        assert_eq!(values[3], Some(json!(-1.5)));
        assert_eq!(values[4], Some(json!(2)));
        assert_eq!(values[5], Some(json!("a")));
        assert_eq!(values[6], Some(json!("b")));
    }

    #[test]
    fn test_number_value() {
        assert_eq!(number_value(30.0), json!(30));
        assert_eq!(number_value(2.5), json!(2.5));
        assert_eq!(normalize(&json!({"a": [1.0, 2.5]})), json!({"a": [1, 2.5]}));
    }
}
