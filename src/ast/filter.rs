//! Canonical filter array: the wire-level filter representation.
//!
//! ```text
//! [["age", ">", 25], "or", ["role", "=", "admin"]]
//! ```
//!
//! Elements are comparison triples, the join tokens `"and"` / `"or"`, or nested
//! groups of the same shape. Reduction is strictly left to right with no
//! precedence: `[a, "or", b, "and", c]` reads `(a or b) and c`. Adjacent
//! elements without a token between them are joined by the most recent token
//! (`and` before any token has appeared).

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use super::types::{FilterNode, Operator};
use crate::error::TranslationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Logic {
    And,
    Or,
}

impl Logic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Logic::And => "and",
            Logic::Or => "or",
        }
    }

    fn parse(token: &str) -> Option<Logic> {
        match token.to_ascii_lowercase().as_str() {
            "and" => Some(Logic::And),
            "or" => Some(Logic::Or),
            _ => None,
        }
    }

    pub fn flip(&self) -> Logic {
        match self {
            Logic::And => Logic::Or,
            Logic::Or => Logic::And,
        }
    }
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilterItem {
    Condition(Condition),
    Logic(Logic),
    Group(FilterArray),
}

/// Ordered, order-significant filter sequence.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterArray {
    items: Vec<FilterItem>,
}

impl FilterArray {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_items(items: Vec<FilterItem>) -> Self {
        Self { items }
    }

    /// A filter with a single comparison.
    pub fn single(condition: Condition) -> Self {
        Self {
            items: vec![FilterItem::Condition(condition)],
        }
    }

    pub fn items(&self) -> &[FilterItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<FilterItem> {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push(&mut self, item: FilterItem) {
        self.items.push(item);
    }

    /// Combine two filters so that both must hold.
    pub fn conjoin(self, other: FilterArray) -> FilterArray {
        if self.is_empty() {
            return other;
        }
        if other.is_empty() {
            return self;
        }
        FilterArray {
            items: vec![
                FilterItem::Group(self),
                FilterItem::Logic(Logic::And),
                FilterItem::Group(other),
            ],
        }
    }

    /// Visit every comparison, descending into groups.
    pub fn for_each_condition<'a>(&'a self, f: &mut impl FnMut(&'a Condition)) {
        for item in &self.items {
            match item {
                FilterItem::Condition(c) => f(c),
                FilterItem::Group(g) => g.for_each_condition(f),
                FilterItem::Logic(_) => {}
            }
        }
    }

    /// Reduce the array into a filter tree using strict left-to-right joins.
    /// Returns `None` for an empty filter.
    pub fn to_node(&self) -> Option<FilterNode> {
        let mut acc: Option<FilterNode> = None;
        let mut join = Logic::And;

        for item in &self.items {
            let node = match item {
                FilterItem::Logic(logic) => {
                    join = *logic;
                    continue;
                }
                FilterItem::Condition(c) => FilterNode::Comparison {
                    field: c.field.clone(),
                    operator: c.operator,
                    value: c.value.clone(),
                },
                FilterItem::Group(group) => match group.to_node() {
                    Some(node) => node,
                    None => continue,
                },
            };

            acc = Some(match acc {
                None => node,
                Some(prev) => combine(prev, join, node),
            });
        }

        acc
    }

    /// Parse the wire format. Unknown operators fail immediately.
    pub fn from_value(value: &Value) -> Result<Self, TranslationError> {
        let elements = match value {
            Value::Null => return Ok(FilterArray::new()),
            Value::Array(elements) => elements,
            other => {
                return Err(TranslationError::Malformed(format!(
                    "expected an array, found {other}"
                )))
            }
        };

        // A bare triple at the top level is a one-condition filter.
        if is_condition_shape(elements) {
            return Ok(FilterArray::single(parse_condition(elements)?));
        }

        parse_group(elements)
    }

    pub fn to_value(&self) -> Value {
        Value::Array(
            self.items
                .iter()
                .map(|item| match item {
                    FilterItem::Condition(c) => Value::Array(vec![
                        Value::String(c.field.clone()),
                        Value::String(c.operator.as_str().to_string()),
                        c.value.clone(),
                    ]),
                    FilterItem::Logic(logic) => Value::String(logic.as_str().to_string()),
                    FilterItem::Group(group) => group.to_value(),
                })
                .collect(),
        )
    }
}

/// Join `prev` and `next` with `join`, flattening runs of the same connective.
fn combine(prev: FilterNode, join: Logic, next: FilterNode) -> FilterNode {
    match (prev, join) {
        (FilterNode::And { mut children }, Logic::And) => {
            children.push(next);
            FilterNode::And { children }
        }
        (FilterNode::Or { mut children }, Logic::Or) => {
            children.push(next);
            FilterNode::Or { children }
        }
        (prev, Logic::And) => FilterNode::and(vec![prev, next]),
        (prev, Logic::Or) => FilterNode::or(vec![prev, next]),
    }
}

fn is_condition_shape(elements: &[Value]) -> bool {
    match elements.first() {
        Some(Value::String(first)) => Logic::parse(first).is_none(),
        _ => false,
    }
}

fn parse_condition(elements: &[Value]) -> Result<Condition, TranslationError> {
    if elements.len() != 3 {
        return Err(TranslationError::Malformed(format!(
            "a condition needs [field, operator, value], found {} elements",
            elements.len()
        )));
    }
    let field = elements[0]
        .as_str()
        .ok_or_else(|| TranslationError::Malformed("field name must be a string".into()))?;
    let operator = elements[1]
        .as_str()
        .ok_or_else(|| TranslationError::Malformed("operator must be a string".into()))?;
    Ok(Condition {
        field: field.to_string(),
        operator: Operator::parse(operator)?,
        value: elements[2].clone(),
    })
}

fn parse_group(elements: &[Value]) -> Result<FilterArray, TranslationError> {
    let mut items = Vec::with_capacity(elements.len());
    let mut last_was_token = true;

    for element in elements {
        match element {
            Value::String(token) => {
                let logic = Logic::parse(token).ok_or_else(|| {
                    TranslationError::Malformed(format!("unexpected token '{token}'"))
                })?;
                if last_was_token {
                    return Err(TranslationError::Malformed(format!(
                        "'{logic}' must follow a condition or group"
                    )));
                }
                items.push(FilterItem::Logic(logic));
                last_was_token = true;
            }
            Value::Array(inner) if is_condition_shape(inner) => {
                items.push(FilterItem::Condition(parse_condition(inner)?));
                last_was_token = false;
            }
            Value::Array(inner) => {
                items.push(FilterItem::Group(parse_group(inner)?));
                last_was_token = false;
            }
            other => {
                return Err(TranslationError::Malformed(format!(
                    "unexpected filter element {other}"
                )))
            }
        }
    }

    if last_was_token && !items.is_empty() {
        return Err(TranslationError::Malformed(
            "filter cannot end with a join token".into(),
        ));
    }

    Ok(FilterArray { items })
}

impl Serialize for FilterArray {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FilterArray {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        FilterArray::from_value(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> FilterArray {
        FilterArray::from_value(&value).unwrap()
    }

    #[test]
    fn test_parse_simple_or() {
        let filter = parse(json!([["age", ">", 25], "or", ["role", "=", "admin"]]));
        assert_eq!(filter.len(), 3);
        assert!(matches!(filter.items()[1], FilterItem::Logic(Logic::Or)));
    }

    #[test]
    fn test_bare_triple_is_single_condition() {
        let filter = parse(json!(["age", ">=", 18]));
        assert_eq!(filter, FilterArray::single(Condition::new("age", Operator::Gte, 18)));
    }

    #[test]
    fn test_null_is_empty_filter() {
        assert!(parse(Value::Null).is_empty());
        assert!(parse(json!([])).is_empty());
        assert_eq!(parse(json!([])).to_node(), None);
    }

    #[test]
    fn test_unknown_operator_fails() {
        let err = FilterArray::from_value(&json!([["name", "like", "a%"]])).unwrap_err();
        assert_eq!(err, TranslationError::UnknownOperator("like".into()));
    }

    #[test]
    fn test_misplaced_tokens_fail() {
        assert!(FilterArray::from_value(&json!(["or", ["a", "=", 1]])).is_err());
        assert!(FilterArray::from_value(&json!([["a", "=", 1], "and"])).is_err());
        assert!(FilterArray::from_value(&json!([["a", "=", 1], "and", "or", ["b", "=", 2]])).is_err());
        assert!(FilterArray::from_value(&json!([["a", "=", 1], "xor", ["b", "=", 2]])).is_err());
        assert!(FilterArray::from_value(&json!({"a": 1})).is_err());
    }

    #[test]
    fn test_left_to_right_reduction() {
        // a or b and c  =>  (a or b) and c
        let filter = parse(json!([["a", "=", 1], "or", ["b", "=", 2], "and", ["c", "=", 3]]));
        let expected = FilterNode::and(vec![
            FilterNode::or(vec![
                FilterNode::cmp("a", Operator::Eq, 1),
                FilterNode::cmp("b", Operator::Eq, 2),
            ]),
            FilterNode::cmp("c", Operator::Eq, 3),
        ]);
        assert_eq!(filter.to_node(), Some(expected));
    }

    #[test]
    fn test_implicit_join_uses_preceding_token() {
        let filter = parse(json!([["a", "=", 1], "or", ["b", "=", 2], ["c", "=", 3]]));
        let expected = FilterNode::or(vec![
            FilterNode::cmp("a", Operator::Eq, 1),
            FilterNode::cmp("b", Operator::Eq, 2),
            FilterNode::cmp("c", Operator::Eq, 3),
        ]);
        assert_eq!(filter.to_node(), Some(expected));

        let implicit_and = parse(json!([["a", "=", 1], ["b", "=", 2]]));
        assert!(matches!(implicit_and.to_node(), Some(FilterNode::And { .. })));
    }

    #[test]
    fn test_nested_group_reduces_first() {
        let filter = parse(json!([["a", "=", 1], "and", [["b", "=", 2], "or", ["c", "=", 3]]]));
        let expected = FilterNode::and(vec![
            FilterNode::cmp("a", Operator::Eq, 1),
            FilterNode::or(vec![
                FilterNode::cmp("b", Operator::Eq, 2),
                FilterNode::cmp("c", Operator::Eq, 3),
            ]),
        ]);
        assert_eq!(filter.to_node(), Some(expected));
    }

    #[test]
    fn test_value_round_trip_preserves_wire_shape() {
        let wire = json!([["a", "in", [1, 2]], "or", [["b", "!=", null], "and", ["c", "<", 3]]]);
        assert_eq!(parse(wire.clone()).to_value(), wire);
    }

    #[test]
    fn test_conjoin() {
        let a = FilterArray::single(Condition::new("a", Operator::Eq, 1));
        let b = FilterArray::single(Condition::new("b", Operator::Eq, 2));
        assert_eq!(FilterArray::new().conjoin(a.clone()), a);
        let both = a.conjoin(b);
        assert_eq!(both.len(), 3);
        let mut fields = Vec::new();
        both.for_each_condition(&mut |c| fields.push(c.field.as_str()));
        assert_eq!(fields, vec!["a", "b"]);
    }
}
