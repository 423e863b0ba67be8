/// Filter tree → canonical filter array translation.
///
/// Comparisons become single triples; `and` / `or` nodes concatenate their
/// children with their own join token between consecutive outputs. A child
/// whose output is compound is wrapped in a nested group, so strict
/// left-to-right reduction of the result always reproduces the tree.
use super::filter::{Condition, FilterArray, FilterItem, Logic};
use super::types::FilterNode;
use crate::error::TranslationError;

/// Translate a filter tree into its canonical array form.
pub fn translate(node: &FilterNode) -> Result<FilterArray, TranslationError> {
    Ok(FilterArray::from_items(translate_items(node, false)?))
}

/// Translate an optional filter; `None` is the empty filter.
pub fn translate_opt(node: Option<&FilterNode>) -> Result<FilterArray, TranslationError> {
    match node {
        Some(node) => translate(node),
        None => Ok(FilterArray::new()),
    }
}

fn translate_items(node: &FilterNode, negated: bool) -> Result<Vec<FilterItem>, TranslationError> {
    match node {
        FilterNode::Comparison {
            field,
            operator,
            value,
        } => {
            let operator = if negated {
                operator
                    .negate()
                    .ok_or_else(|| TranslationError::NotNegatable(operator.to_string()))?
            } else {
                *operator
            };
            Ok(vec![FilterItem::Condition(Condition {
                field: field.clone(),
                operator,
                value: value.clone(),
            })])
        }
        FilterNode::And { children } => {
            let join = if negated { Logic::Or } else { Logic::And };
            join_children(children, join, negated)
        }
        FilterNode::Or { children } => {
            let join = if negated { Logic::And } else { Logic::Or };
            join_children(children, join, negated)
        }
        FilterNode::Not { child } => translate_items(child, !negated),
    }
}

/// Concatenate child outputs with `join` between them. Under negation the
/// join has already been flipped (De Morgan) and each child is negated.
fn join_children(
    children: &[FilterNode],
    join: Logic,
    negated: bool,
) -> Result<Vec<FilterItem>, TranslationError> {
    let mut out = Vec::new();
    for child in children {
        let mut items = translate_items(child, negated)?;
        if items.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(FilterItem::Logic(join));
        }
        if items.len() == 1 {
            out.append(&mut items);
        } else {
            out.push(FilterItem::Group(FilterArray::from_items(items)));
        }
    }
    Ok(out)
}
