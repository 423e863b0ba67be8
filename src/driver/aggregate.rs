//! In-process grouping and aggregation.
//!
//! Output rows carry one key per group-by field plus one key per aggregation
//! (see [`Aggregation::output_name`]). `having` is evaluated against output
//! rows. Rows are ordered by the requested sort, then by the group-by fields
//! ascending. Without group-by fields there is always exactly one row.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use super::eval::{matches, normalize, number_value, sort_cmp};
use super::record::lookup;
use super::scan::{compare_by, filter, paginate};
use super::DriverQuery;
use crate::ast::{AggregateFunction, Aggregation, Record};

/// Filter, group, aggregate, apply `having`, sort and paginate.
pub fn aggregate(records: impl IntoIterator<Item = Record>, query: &DriverQuery) -> Vec<Record> {
    let matched = filter(records, &query.filters);

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (Vec<Value>, Vec<Record>)> = HashMap::new();

    if query.group_by.is_empty() {
        order.push(String::new());
        groups.insert(String::new(), (Vec::new(), matched));
    } else {
        for record in matched {
            let key_values: Vec<Value> = query
                .group_by
                .iter()
                .map(|f| lookup(&record, f).cloned().unwrap_or(Value::Null))
                .collect();
            let key = normalize(&Value::Array(key_values.clone())).to_string();
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    (key_values, Vec::new())
                })
                .1
                .push(record);
        }
    }

    let mut rows: Vec<Record> = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|(key_values, members)| build_row(query, key_values, &members))
        .filter(|row| matches(&query.having, row))
        .collect();

    rows.sort_by(|a, b| {
        compare_by(a, b, &query.sort).then_with(|| compare_group_keys(a, b, &query.group_by))
    });

    paginate(rows, query.skip, query.top)
}

fn compare_group_keys(a: &Record, b: &Record, group_by: &[String]) -> Ordering {
    for field in group_by {
        let ord = sort_cmp(a.get(field), b.get(field));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn build_row(query: &DriverQuery, key_values: Vec<Value>, members: &[Record]) -> Record {
    let mut row = Record::new();
    for (field, value) in query.group_by.iter().zip(key_values) {
        row.insert(field.clone(), value);
    }
    for aggregation in &query.aggregations {
        row.insert(aggregation.output_name(), compute(aggregation, members));
    }
    row
}

/// Compute one aggregation over a group's members.
pub fn compute(aggregation: &Aggregation, members: &[Record]) -> Value {
    let field = aggregation.field.as_str();
    if aggregation.function == AggregateFunction::Count {
        let count = match field {
            "*" => members.len(),
            _ => members
                .iter()
                .filter(|r| lookup(r, field).is_some_and(|v| !v.is_null()))
                .count(),
        };
        return Value::from(count as u64);
    }

    let numbers: Vec<f64> = members
        .iter()
        .filter_map(|r| lookup(r, field))
        .filter_map(Value::as_f64)
        .collect();
    if numbers.is_empty() {
        return Value::Null;
    }

    let sum = || numbers.iter().sum::<f64>();
    let result = match aggregation.function {
        AggregateFunction::Avg => sum() / numbers.len() as f64,
        AggregateFunction::Min => numbers.iter().copied().fold(f64::INFINITY, f64::min),
        AggregateFunction::Max => numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregateFunction::Sum | AggregateFunction::Count => sum(),
    };
    number_value(result)
}

/// Distinct non-null values of a field, in sort order.
pub fn distinct_values<'a>(records: impl IntoIterator<Item = &'a Record>, field: &str) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut values: Vec<Value> = records
        .into_iter()
        .filter_map(|r| lookup(r, field))
        .filter(|v| !v.is_null())
        .filter(|v| seen.insert(normalize(v).to_string()))
        .cloned()
        .collect();
    values.sort_by(|a, b| sort_cmp(Some(a), Some(b)));
    values
}
