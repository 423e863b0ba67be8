//! Canonical query and command types.
//!
//! This module defines the backend-agnostic representation shared by the
//! query builder, the filter translator, the services and every driver.
//! The types are:
//! - Backend-agnostic (no driver ever sees anything else)
//! - Ephemeral (built per call, never persisted)
//! - Serde-friendly (the JSON shape is the interchange format)

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::filter::FilterArray;
use crate::error::TranslationError;

/// A stored record: a JSON object whose `id` is an opaque string.
pub type Record = Map<String, Value>;

/// Name of the identifier field on every record.
pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "created_at";
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// Canonical description of a read operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryAst {
    pub object: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterNode>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Relation field name → sub-query over the related object.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub expand: BTreeMap<String, QueryAst>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<Aggregation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub having: Option<FilterNode>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub distinct: bool,
}

impl QueryAst {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortField {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// True when the query groups or aggregates instead of returning records.
    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregations.is_empty()
    }
}

/// Node of the boolean filter tree.
///
/// Children are owned, so a tree can never contain a back-edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FilterNode {
    Comparison {
        field: String,
        operator: Operator,
        value: Value,
    },
    And {
        children: Vec<FilterNode>,
    },
    Or {
        children: Vec<FilterNode>,
    },
    Not {
        child: Box<FilterNode>,
    },
}

impl FilterNode {
    pub fn cmp(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        FilterNode::Comparison {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn and(children: Vec<FilterNode>) -> Self {
        FilterNode::And { children }
    }

    pub fn or(children: Vec<FilterNode>) -> Self {
        FilterNode::Or { children }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(child: FilterNode) -> Self {
        FilterNode::Not {
            child: Box::new(child),
        }
    }

    /// Visit every comparison in the tree, left to right.
    pub fn for_each_comparison<'a>(&'a self, f: &mut impl FnMut(&'a str, Operator, &'a Value)) {
        match self {
            FilterNode::Comparison {
                field,
                operator,
                value,
            } => f(field, *operator, value),
            FilterNode::And { children } | FilterNode::Or { children } => {
                for child in children {
                    child.for_each_comparison(f);
                }
            }
            FilterNode::Not { child } => child.for_each_comparison(f),
        }
    }
}

/// The fixed operator set. Anything else is rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Between,
}

impl Operator {
    pub const ALL: [Operator; 13] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Gt,
        Operator::Gte,
        Operator::Lt,
        Operator::Lte,
        Operator::In,
        Operator::Nin,
        Operator::Contains,
        Operator::NotContains,
        Operator::StartsWith,
        Operator::EndsWith,
        Operator::Between,
    ];

    pub fn parse(token: &str) -> Result<Self, TranslationError> {
        let op = match token.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Operator::Eq,
            "!=" | "<>" => Operator::Ne,
            ">" => Operator::Gt,
            ">=" => Operator::Gte,
            "<" => Operator::Lt,
            "<=" => Operator::Lte,
            "in" => Operator::In,
            "nin" | "not in" => Operator::Nin,
            "contains" => Operator::Contains,
            "notcontains" => Operator::NotContains,
            "startswith" => Operator::StartsWith,
            "endswith" => Operator::EndsWith,
            "between" => Operator::Between,
            _ => return Err(TranslationError::UnknownOperator(token.to_string())),
        };
        Ok(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::In => "in",
            Operator::Nin => "nin",
            Operator::Contains => "contains",
            Operator::NotContains => "notcontains",
            Operator::StartsWith => "startswith",
            Operator::EndsWith => "endswith",
            Operator::Between => "between",
        }
    }

    /// Operator substituted when a comparison appears under `not`. Range
    /// operators map to their opposite range, which never matches a missing
    /// or mistyped field.
    pub fn negate(&self) -> Option<Operator> {
        match self {
            Operator::Eq => Some(Operator::Ne),
            Operator::Ne => Some(Operator::Eq),
            Operator::Gt => Some(Operator::Lte),
            Operator::Lte => Some(Operator::Gt),
            Operator::Gte => Some(Operator::Lt),
            Operator::Lt => Some(Operator::Gte),
            Operator::In => Some(Operator::Nin),
            Operator::Nin => Some(Operator::In),
            Operator::Contains => Some(Operator::NotContains),
            Operator::NotContains => Some(Operator::Contains),
            Operator::StartsWith | Operator::EndsWith | Operator::Between => None,
        }
    }

    pub fn is_equality(&self) -> bool {
        matches!(self, Operator::Eq)
    }

    pub fn is_range(&self) -> bool {
        matches!(
            self,
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte | Operator::Between
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Operator {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Operator {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Operator::parse(&token).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SortSpec")]
pub struct SortField {
    pub field: String,
    pub direction: SortDirection,
}

impl SortField {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

/// Accepted wire shapes for a sort entry: `"name"`, `["name", "desc"]`, or
/// `{"field": "name", "direction": "desc"}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum SortSpec {
    Field(String),
    Pair(String, SortDirection),
    Object {
        field: String,
        #[serde(default)]
        direction: SortDirection,
    },
}

impl From<SortSpec> for SortField {
    fn from(spec: SortSpec) -> Self {
        match spec {
            SortSpec::Field(field) => SortField::asc(field),
            SortSpec::Pair(field, direction) | SortSpec::Object { field, direction } => {
                SortField { field, direction }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    /// Field to aggregate; `*` counts every record in the group.
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Aggregation {
    pub fn new(function: AggregateFunction, field: impl Into<String>) -> Self {
        Self {
            function,
            field: field.into(),
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Key under which the aggregated value appears in result rows.
    pub fn output_name(&self) -> String {
        match &self.alias {
            Some(alias) => alias.clone(),
            None if self.field == "*" => self.function.as_str().to_string(),
            None => format!("{}_{}", self.function.as_str(), self.field),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Create,
    Update,
    Delete,
    BulkCreate,
    BulkUpdate,
    BulkDelete,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Create => "create",
            CommandKind::Update => "update",
            CommandKind::Delete => "delete",
            CommandKind::BulkCreate => "bulkCreate",
            CommandKind::BulkUpdate => "bulkUpdate",
            CommandKind::BulkDelete => "bulkDelete",
        }
    }
}

/// Canonical description of a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandKind,
    pub object: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Record>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterArray>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<Record>>,
}

impl Command {
    fn bare(kind: CommandKind, object: impl Into<String>) -> Self {
        Self {
            kind,
            object: object.into(),
            id: None,
            data: None,
            filters: None,
            records: None,
        }
    }

    pub fn create(object: impl Into<String>, data: Record) -> Self {
        Self {
            data: Some(data),
            ..Self::bare(CommandKind::Create, object)
        }
    }

    pub fn update(object: impl Into<String>, id: impl Into<String>, data: Record) -> Self {
        Self {
            id: Some(id.into()),
            data: Some(data),
            ..Self::bare(CommandKind::Update, object)
        }
    }

    pub fn delete(object: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::bare(CommandKind::Delete, object)
        }
    }

    pub fn bulk_create(object: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            records: Some(records),
            ..Self::bare(CommandKind::BulkCreate, object)
        }
    }

    pub fn bulk_update(object: impl Into<String>, filters: FilterArray, data: Record) -> Self {
        Self {
            filters: Some(filters),
            data: Some(data),
            ..Self::bare(CommandKind::BulkUpdate, object)
        }
    }

    pub fn bulk_delete(object: impl Into<String>, filters: FilterArray) -> Self {
        Self {
            filters: Some(filters),
            ..Self::bare(CommandKind::BulkDelete, object)
        }
    }
}

/// Outcome of a mutation. `affected` is always the exact mutated count.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn ok(data: Option<Value>, affected: u64) -> Self {
        Self {
            success: true,
            data,
            affected,
            error: None,
        }
    }

    pub fn failure(err: &crate::error::EngineError) -> Self {
        Self {
            success: false,
            data: None,
            affected: 0,
            error: Some(format!("{}: {}", err.code(), err)),
        }
    }
}
