/// External query request → canonical Query AST.
///
/// The mapping is one-to-one and performs no validation: shapes that a
/// driver cannot serve surface later, at the driver boundary.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::filter::FilterArray;
use super::types::{Aggregation, QueryAst, SortField};

/// Query request as produced by transport, UI or CLI layers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRequest {
    pub fields: Vec<String>,
    pub filters: Option<FilterArray>,
    pub sort: Vec<SortField>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub expand: BTreeMap<String, QueryAst>,
    pub group_by: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub having: Option<FilterArray>,
    pub distinct: bool,
}

/// Build the Query AST for `object` from an external request.
pub fn build_query(object: &str, request: QueryRequest) -> QueryAst {
    QueryAst {
        object: object.to_string(),
        fields: request.fields,
        filter: request.filters.as_ref().and_then(FilterArray::to_node),
        sort: request.sort,
        top: request.limit,
        skip: request.skip,
        expand: request.expand,
        group_by: request.group_by,
        aggregations: request.aggregations,
        having: request.having.as_ref().and_then(FilterArray::to_node),
        distinct: request.distinct,
    }
}
