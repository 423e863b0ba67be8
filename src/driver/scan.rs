//! In-process query pipeline for scan-and-filter backends.
//!
//! The order is fixed: filter → sort → projection → distinct → skip → top.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde_json::Value;

use super::eval::{matches, normalize, sort_cmp};
use super::record::{lookup, project};
use super::DriverQuery;
use crate::ast::{FilterArray, Record, SortDirection, SortField, ID_FIELD};

/// Run a full read over a candidate set.
pub fn apply(records: impl IntoIterator<Item = Record>, query: &DriverQuery) -> Vec<Record> {
    let mut rows = filter(records, &query.filters);
    sort_records(&mut rows, &query.sort);
    let rows = rows
        .into_iter()
        .map(|r| project(r, &query.fields))
        .collect::<Vec<_>>();
    let rows = if query.distinct { dedupe(rows) } else { rows };
    paginate(rows, query.skip, query.top)
}

pub fn filter(records: impl IntoIterator<Item = Record>, filters: &FilterArray) -> Vec<Record> {
    records
        .into_iter()
        .filter(|r| matches(filters, r))
        .collect()
}

/// Stable sort by the requested keys, then by `id` so results are
/// deterministic whatever order the backend produced.
pub fn sort_records(rows: &mut [Record], sort: &[SortField]) {
    rows.sort_by(|a, b| {
        compare_by(a, b, sort).then_with(|| sort_cmp(a.get(ID_FIELD), b.get(ID_FIELD)))
    });
}

/// Compare two rows by a list of sort keys only.
pub fn compare_by(a: &Record, b: &Record, sort: &[SortField]) -> Ordering {
    for key in sort {
        let ord = sort_cmp(lookup(a, &key.field), lookup(b, &key.field));
        let ord = match key.direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Drop rows equal to an earlier row, keeping first occurrences in order.
pub fn dedupe(rows: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(normalize(&Value::Object(row.clone())).to_string()))
        .collect()
}

pub fn paginate<T>(rows: Vec<T>, skip: Option<usize>, top: Option<usize>) -> Vec<T> {
    let iter = rows.into_iter().skip(skip.unwrap_or(0));
    match top {
        Some(top) => iter.take(top).collect(),
        None => iter.collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Value) -> Vec<Record> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().cloned().unwrap())
            .collect()
    }

    fn ids(rows: &[Record]) -> Vec<&str> {
        rows.iter().map(|r| r["id"].as_str().unwrap()).collect()
    }

    #[test]
    fn test_scenario_b_or_filter() {
        let data = rows(json!([
            {"id": "1", "age": 30, "role": "user"},
            {"id": "2", "age": 20, "role": "admin"},
            {"id": "3", "age": 18, "role": "user"}
        ]));
        let query = DriverQuery::filtered(
            FilterArray::from_value(&json!([["age", ">", 25], "or", ["role", "=", "admin"]]))
                .unwrap(),
        );
        assert_eq!(ids(&apply(data, &query)), vec!["1", "2"]);
    }

    #[test]
    fn test_sort_then_paginate() {
        let data = rows(json!([
            {"id": "a", "n": 3},
            {"id": "b", "n": 1},
            {"id": "c", "n": 2},
            {"id": "d"}
        ]));
        let query = DriverQuery {
            sort: vec![SortField::desc("n")],
            skip: Some(1),
            top: Some(2),
            ..Default::default()
        };
        assert_eq!(ids(&apply(data, &query)), vec!["c", "b"]);
    }

    #[test]
    fn test_ties_broken_by_id() {
        let data = rows(json!([
            {"id": "z", "g": 1},
            {"id": "m", "g": 1},
            {"id": "a", "g": 2}
        ]));
        let query = DriverQuery {
            sort: vec![SortField::asc("g")],
            ..Default::default()
        };
        assert_eq!(ids(&apply(data, &query)), vec!["m", "z", "a"]);
    }

    #[test]
    fn test_projection_then_distinct_then_top() {
        let data = rows(json!([
            {"id": "1", "city": "Oslo"},
            {"id": "2", "city": "Rome"},
            {"id": "3", "city": "Oslo"},
            {"id": "4", "city": "Bern"}
        ]));
        let query = DriverQuery {
            fields: vec!["city".into()],
            distinct: true,
            top: Some(2),
            ..Default::default()
        };
        let out = apply(data, &query);
        assert_eq!(
            out.into_iter().map(Value::Object).collect::<Vec<_>>(),
            vec![json!({"city": "Oslo"}), json!({"city": "Rome"})]
        );
    }

    #[test]
    fn test_paginate_past_end() {
        assert!(paginate(vec![1, 2, 3], Some(5), None).is_empty());
        assert_eq!(paginate(vec![1, 2, 3], None, Some(0)), Vec::<i32>::new());
    }
}
