//! Query service: resolves the datasource for an object, translates the
//! Query AST, dispatches it to the driver and resolves `expand` relations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;

use super::datasource::{Datasource, DatasourceRegistry};
use super::metadata::MetadataProvider;
use crate::ast::{
    FilterArray, FilterItem, FilterNode, Operator, QueryAst, Record, ID_FIELD,
};
use crate::driver::record::record_id;
use crate::driver::{DriverContext, DriverQuery, TransactionHandle};
use crate::error::{EngineError, EngineResult};

/// Profiles kept for the analyzer.
const RECENT_PROFILES: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Record timings and the filter shape in [`QueryResult::profile`].
    pub profile: bool,
    pub transaction: Option<TransactionHandle>,
    /// Caller identity, handed to hooks.
    pub user: Option<String>,
}

impl QueryOptions {
    pub fn profiled() -> Self {
        Self {
            profile: true,
            ..Default::default()
        }
    }

    pub fn context(&self) -> DriverContext {
        DriverContext {
            transaction: self.transaction.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub items: Vec<Record>,
    /// Total matches, ignoring `top` / `skip`.
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<QueryProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfiledCondition {
    pub field: String,
    pub operator: Operator,
}

/// Timings and shape of one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryProfile {
    pub object: String,
    pub datasource: String,
    /// Filter array with every value replaced by `"?"`.
    pub shape: Value,
    pub conditions: Vec<ProfiledCondition>,
    pub sort: Vec<String>,
    pub translate_us: u64,
    pub dispatch_us: u64,
    pub total_us: u64,
    pub returned: usize,
    pub matched: u64,
}

pub struct QueryService {
    datasources: Arc<DatasourceRegistry>,
    metadata: Arc<dyn MetadataProvider>,
    recent: Mutex<VecDeque<QueryProfile>>,
}

impl QueryService {
    pub fn new(datasources: Arc<DatasourceRegistry>, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            datasources,
            metadata,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_PROFILES)),
        }
    }

    /// The datasource bound to `object`, or the default one.
    pub fn datasource_for(&self, object: &str) -> EngineResult<&Arc<Datasource>> {
        let bound = self.metadata.datasource_for(object);
        self.datasources.resolve(bound.as_deref())
    }

    pub async fn execute(&self, ast: &QueryAst, options: &QueryOptions) -> EngineResult<QueryResult> {
        self.run(ast, options).await
    }

    /// Number of records of `object` matching `filter`.
    pub async fn count(
        &self,
        object: &str,
        filter: Option<&FilterNode>,
        options: &QueryOptions,
    ) -> EngineResult<u64> {
        check_object(object)?;
        let datasource = self.datasource_for(object)?;
        let filters = crate::ast::translate_opt(filter)?;
        datasource
            .driver()
            .count(object, &filters, &options.context())
            .await
    }

    /// Profiles recorded for `object`, oldest first.
    pub fn recent_profiles(&self, object: &str) -> Vec<QueryProfile> {
        match self.recent.lock() {
            Ok(recent) => recent.iter().filter(|p| p.object == object).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn record_profile(&self, profile: &QueryProfile) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_PROFILES {
                recent.pop_front();
            }
            recent.push_back(profile.clone());
        }
    }

    fn run<'a>(
        &'a self,
        ast: &'a QueryAst,
        options: &'a QueryOptions,
    ) -> BoxFuture<'a, EngineResult<QueryResult>> {
        async move {
            let started = Instant::now();
            check_object(&ast.object)?;
            let datasource = self.datasource_for(&ast.object)?;

            let query = DriverQuery::from_ast(ast)?;
            let translated = started.elapsed();

            let ctx = options.context();
            let mut items = dispatch(datasource, &ast.object, &query, &ctx).await?;
            let count = if query.is_aggregate() || query.distinct {
                if query.top.is_none() && query.skip.is_none() {
                    items.len() as u64
                } else {
                    let unpaged = DriverQuery {
                        top: None,
                        skip: None,
                        ..query.clone()
                    };
                    dispatch(datasource, &ast.object, &unpaged, &ctx).await?.len() as u64
                }
            } else {
                datasource
                    .driver()
                    .count(&ast.object, &query.filters, &ctx)
                    .await?
            };
            let dispatched = started.elapsed() - translated;

            if !ast.expand.is_empty() {
                self.expand(&mut items, ast, options).await?;
            }

            let total = started.elapsed();
            debug!(
                object = %ast.object,
                datasource = datasource.name(),
                returned = items.len(),
                matched = count,
                total_us = micros(total),
                "query executed"
            );

            let profile = options.profile.then(|| {
                let profile = build_profile(
                    ast,
                    datasource.name(),
                    &query,
                    [translated, dispatched, total],
                    items.len(),
                    count,
                );
                self.record_profile(&profile);
                profile
            });

            Ok(QueryResult {
                items,
                count,
                profile,
            })
        }
        .boxed()
    }

    /// Replace relation ids on `items` with the referenced records.
    async fn expand(
        &self,
        items: &mut [Record],
        ast: &QueryAst,
        options: &QueryOptions,
    ) -> EngineResult<()> {
        for (relation, sub) in &ast.expand {
            if sub.is_aggregate() {
                return Err(EngineError::InvalidQuery(format!(
                    "expand '{relation}' cannot group or aggregate"
                )));
            }
            let mut ids = Vec::new();
            for item in items.iter() {
                collect_ids(item.get(relation), &mut ids);
            }
            if ids.is_empty() {
                continue;
            }

            let mut related = sub.clone();
            related.top = None;
            related.skip = None;
            if !related.fields.is_empty() && !related.fields.iter().any(|f| f == ID_FIELD) {
                related.fields.push(ID_FIELD.to_string());
            }
            let by_id = FilterNode::cmp(
                ID_FIELD,
                Operator::In,
                Value::Array(ids.into_iter().map(Value::String).collect()),
            );
            related.filter = Some(match related.filter.take() {
                Some(own) => FilterNode::and(vec![by_id, own]),
                None => by_id,
            });

            let nested = QueryOptions {
                profile: false,
                ..options.clone()
            };
            let found: HashMap<String, Record> = self
                .run(&related, &nested)
                .await?
                .items
                .into_iter()
                .filter_map(|record| Some((record_id(&record)?, record)))
                .collect();

            for item in items.iter_mut() {
                if let Some(value) = item.get_mut(relation) {
                    *value = resolve_ids(value, &found);
                }
            }
        }
        Ok(())
    }
}

fn check_object(object: &str) -> EngineResult<()> {
    if object.trim().is_empty() {
        return Err(EngineError::InvalidQuery(
            "query object must not be empty".to_string(),
        ));
    }
    Ok(())
}

async fn dispatch(
    datasource: &Datasource,
    object: &str,
    query: &DriverQuery,
    ctx: &DriverContext,
) -> EngineResult<Vec<Record>> {
    if query.is_aggregate() {
        datasource.aggregation()?.aggregate(object, query, ctx).await
    } else {
        datasource.driver().find(object, query, ctx).await
    }
}

/// Referenced ids in first-seen order, without duplicates.
fn collect_ids(value: Option<&Value>, ids: &mut Vec<String>) {
    let mut push = |id: &str| {
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    };
    match value {
        Some(Value::String(id)) => push(id),
        Some(Value::Array(elements)) => {
            for element in elements {
                if let Value::String(id) = element {
                    push(id);
                }
            }
        }
        _ => {}
    }
}

/// A single id becomes the record (or null); an id list becomes the list of
/// records that were found, in reference order.
fn resolve_ids(value: &Value, found: &HashMap<String, Record>) -> Value {
    match value {
        Value::String(id) => found
            .get(id)
            .map(|record| Value::Object(record.clone()))
            .unwrap_or(Value::Null),
        Value::Array(elements) => Value::Array(
            elements
                .iter()
                .filter_map(|element| match element {
                    Value::String(id) => found.get(id).map(|r| Value::Object(r.clone())),
                    _ => None,
                })
                .collect(),
        ),
        other => other.clone(),
    }
}

fn build_profile(
    ast: &QueryAst,
    datasource: &str,
    query: &DriverQuery,
    [translated, dispatched, total]: [Duration; 3],
    returned: usize,
    matched: u64,
) -> QueryProfile {
    let mut conditions = Vec::new();
    query.filters.for_each_condition(&mut |c| {
        conditions.push(ProfiledCondition {
            field: c.field.clone(),
            operator: c.operator,
        })
    });
    QueryProfile {
        object: ast.object.clone(),
        datasource: datasource.to_string(),
        shape: shape_of(&query.filters),
        conditions,
        sort: query.sort.iter().map(|s| s.field.clone()).collect(),
        translate_us: micros(translated),
        dispatch_us: micros(dispatched),
        total_us: micros(total),
        returned,
        matched,
    }
}

pub(crate) fn shape_of(filters: &FilterArray) -> Value {
    Value::Array(
        filters
            .items()
            .iter()
            .map(|item| match item {
                FilterItem::Condition(c) => json!([c.field, c.operator.as_str(), "?"]),
                FilterItem::Logic(logic) => json!(logic.as_str()),
                FilterItem::Group(group) => shape_of(group),
            })
            .collect(),
    )
}

fn micros(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AggregateFunction, Aggregation, SortDirection};
    use crate::driver::MemoryDriver;
    use crate::engine::metadata::StaticMetadata;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    async fn service() -> QueryService {
        let driver = MemoryDriver::new();
        driver
            .load(
                "users",
                vec![
                    record(json!({"id": "1", "name": "Ada", "age": 36, "role": "admin", "team": "t1"})),
                    record(json!({"id": "2", "name": "Bob", "age": 22, "role": "user", "team": "t2"})),
                    record(json!({"id": "3", "name": "Cy", "age": 41, "role": "user", "team": "t1"})),
                    record(json!({"id": "4", "name": "Di", "age": 29, "role": "user", "tags": ["t1", "t2", "t9"]})),
                ],
            )
            .await
            .unwrap();
        driver
            .load(
                "teams",
                vec![
                    record(json!({"id": "t1", "title": "Core", "active": true})),
                    record(json!({"id": "t2", "title": "Edge", "active": false})),
                ],
            )
            .await
            .unwrap();
        let mut registry = DatasourceRegistry::new();
        registry
            .insert(Datasource::new("main", Arc::new(driver)))
            .unwrap();
        QueryService::new(Arc::new(registry), Arc::new(StaticMetadata::new()))
    }

    #[tokio::test]
    async fn test_count_ignores_pagination() {
        let service = service().await;
        let ast = QueryAst::new("users")
            .with_filter(FilterNode::cmp("role", Operator::Eq, "user"))
            .sort_by("age", SortDirection::Asc)
            .top(1);
        let result = service.execute(&ast, &QueryOptions::default()).await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0]["name"], "Bob");
        assert_eq!(result.count, 3);
        assert!(result.profile.is_none());
    }

    #[tokio::test]
    async fn test_empty_object_rejected() {
        let service = service().await;
        let err = service
            .execute(&QueryAst::new("  "), &QueryOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
    }

    #[tokio::test]
    async fn test_unbound_datasource_is_reported() {
        let service = QueryService::new(
            Arc::new(DatasourceRegistry::new()),
            Arc::new(StaticMetadata::new().bind("users", "ghost")),
        );
        let err = service
            .execute(&QueryAst::new("users"), &QueryOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDatasource(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_expand_single_and_list_relations() {
        let service = service().await;
        let mut ast = QueryAst::new("users").sort_by("id", SortDirection::Asc);
        let mut teams = QueryAst::new("teams");
        teams.fields = vec!["title".into()];
        ast.expand.insert("team".into(), teams.clone());
        ast.expand.insert("tags".into(), teams);

        let result = service.execute(&ast, &QueryOptions::default()).await.unwrap();
        assert_eq!(result.items[0]["team"], json!({"title": "Core", "id": "t1"}));
        assert_eq!(result.items[1]["team"]["title"], "Edge");
        // Unknown ids in a list are dropped.
        assert_eq!(
            result.items[3]["tags"],
            json!([{"title": "Core", "id": "t1"}, {"title": "Edge", "id": "t2"}])
        );
        assert!(result.items[3].get("team").is_none());
    }

    #[tokio::test]
    async fn test_expand_applies_sub_filter() {
        let service = service().await;
        let mut ast = QueryAst::new("users");
        ast.expand.insert(
            "team".into(),
            QueryAst::new("teams").with_filter(FilterNode::cmp("active", Operator::Eq, true)),
        );
        let result = service.execute(&ast, &QueryOptions::default()).await.unwrap();
        let bob = result.items.iter().find(|r| r["name"] == "Bob").unwrap();
        assert_eq!(bob["team"], Value::Null);
    }

    #[tokio::test]
    async fn test_aggregate_dispatch_and_group_count() {
        let service = service().await;
        let mut ast = QueryAst::new("users").top(1);
        ast.group_by = vec!["role".into()];
        ast.aggregations = vec![Aggregation::new(AggregateFunction::Count, "*")];
        let result = service.execute(&ast, &QueryOptions::default()).await.unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.count, 2);
    }

    #[tokio::test]
    async fn test_profile_records_shape() {
        let service = service().await;
        let ast = QueryAst::new("users").with_filter(FilterNode::or(vec![
            FilterNode::cmp("age", Operator::Gt, 30),
            FilterNode::cmp("role", Operator::Eq, "admin"),
        ]));
        let result = service.execute(&ast, &QueryOptions::profiled()).await.unwrap();
        let profile = result.profile.unwrap();
        assert_eq!(profile.datasource, "main");
        assert_eq!(profile.shape, json!([["age", ">", "?"], "or", ["role", "=", "?"]]));
        assert_eq!(profile.conditions.len(), 2);
        assert_eq!(profile.matched, 2);
        assert!(profile.total_us >= profile.translate_us);
        assert_eq!(service.recent_profiles("users").len(), 1);
        assert!(service.recent_profiles("teams").is_empty());
    }

    #[tokio::test]
    async fn test_count_with_filter() {
        let service = service().await;
        let filter = FilterNode::cmp("age", Operator::Gte, 30);
        let n = service
            .count("users", Some(&filter), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(n, 2);
    }
}
