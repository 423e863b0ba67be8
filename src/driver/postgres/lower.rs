//! Lowering of driver queries onto the SQL AST.
//!
//! Each object is a table `(id TEXT PRIMARY KEY, data JSONB NOT NULL)`. Field
//! paths are resolved with `data #> $n::text[]`, and every operator is
//! expressed so it agrees with the in-process evaluator: numbers order as
//! `float8` and test equal as exact jsonb numerics, strings compare and fold
//! case under `COLLATE "C"`, type mismatches are false.

use std::collections::HashMap;

use serde_json::Value;

use super::sql::{
    BinaryOperator, DeleteQuery, Expression, InsertQuery, OrderByExpr, Query, SelectItem,
    SelectQuery, SqlParam, Statement, TableRef, UpdateQuery,
};
use crate::ast::{Condition, FilterArray, FilterItem, Logic, Operator, SortDirection, SortField};
use crate::ast::{AggregateFunction, Aggregation, Record};
use crate::driver::eval::{between_bounds, in_elements};
use crate::driver::DriverQuery;

pub const ID_COLUMN: &str = "id";
pub const DATA_COLUMN: &str = "data";
const ROW_COLUMN: &str = "row";

/// Collects parameters in `$n` order. Field paths are bound once per
/// statement and reused.
#[derive(Debug, Default)]
pub struct Binder {
    params: Vec<SqlParam>,
    paths: HashMap<String, usize>,
}

impl Binder {
    pub fn bind(&mut self, param: SqlParam) -> Expression {
        self.params.push(param);
        Expression::Parameter(self.params.len())
    }

    fn json(&mut self, value: &Value) -> Expression {
        self.bind(SqlParam::Json(value.clone())).cast("jsonb")
    }

    fn text(&mut self, value: &str) -> Expression {
        self.bind(SqlParam::Text(value.to_string())).cast("text")
    }

    fn path(&mut self, field: &str) -> Expression {
        let index = match self.paths.get(field) {
            Some(index) => *index,
            None => {
                let parts = field.split('.').map(str::to_string).collect();
                self.params.push(SqlParam::TextArray(parts));
                self.paths.insert(field.to_string(), self.params.len());
                self.params.len()
            }
        };
        Expression::Parameter(index).cast("text[]")
    }

    pub fn finish(self, query: &Query) -> Statement {
        Statement::new(query, self.params)
    }
}

/// `(<column> #> $n::text[])`
fn field(binder: &mut Binder, column: &str, name: &str) -> Expression {
    Expression::JsonPath {
        expr: Box::new(Expression::column(column)),
        path: Box::new(binder.path(name)),
        as_text: false,
    }
}

/// Scalar text of a jsonb value: `(x #>> '{}')`.
fn scalar_text(x: Expression) -> Expression {
    Expression::JsonPath {
        expr: Box::new(x),
        path: Box::new(Expression::text("{}")),
        as_text: true,
    }
}

fn typeof_is(x: &Expression, kind: &'static str) -> Expression {
    Expression::call("jsonb_typeof", vec![x.clone()]).eq(Expression::text(kind))
}

/// `CASE WHEN <guard> THEN <then> ELSE FALSE END`
fn guarded(guard: Expression, then: Expression) -> Expression {
    Expression::Case {
        operand: None,
        when_clauses: vec![(guard, then)],
        else_clause: Some(Box::new(Expression::boolean(false))),
    }
}

/// Lower a canonical filter array with strict left-to-right reduction over
/// values stored in `column`. `None` means no filter.
pub fn lower_filters(binder: &mut Binder, column: &str, filters: &FilterArray) -> Option<Expression> {
    let mut acc: Option<Expression> = None;
    let mut join = Logic::And;
    for item in filters.items() {
        let expr = match item {
            FilterItem::Logic(logic) => {
                join = *logic;
                continue;
            }
            FilterItem::Condition(condition) => lower_condition(binder, column, condition),
            FilterItem::Group(group) => match lower_filters(binder, column, group) {
                Some(expr) => expr,
                None => continue,
            },
        };
        acc = Some(match (acc, join) {
            (None, _) => expr,
            (Some(prev), Logic::And) => prev.and(expr),
            (Some(prev), Logic::Or) => prev.or(expr),
        });
    }
    acc
}

pub fn lower_condition(binder: &mut Binder, column: &str, condition: &Condition) -> Expression {
    let x = field(binder, column, &condition.field);
    let value = &condition.value;
    match condition.operator {
        Operator::Eq => equals(binder, &x, value),
        Operator::Ne => equals(binder, &x, value).negate(),
        Operator::Gt => range(binder, &x, BinaryOperator::Gt, value),
        Operator::Gte => range(binder, &x, BinaryOperator::GtEq, value),
        Operator::Lt => range(binder, &x, BinaryOperator::Lt, value),
        Operator::Lte => range(binder, &x, BinaryOperator::LtEq, value),
        Operator::In => in_list(binder, &x, value),
        Operator::Nin => in_list(binder, &x, value).negate(),
        Operator::Contains => text_match(binder, &x, value, TextMatch::Contains),
        Operator::NotContains => text_match(binder, &x, value, TextMatch::Contains).negate(),
        Operator::StartsWith => text_match(binder, &x, value, TextMatch::Prefix),
        Operator::EndsWith => text_match(binder, &x, value, TextMatch::Suffix),
        Operator::Between => match between_bounds(value) {
            Some((low, high)) => range(binder, &x, BinaryOperator::GtEq, low).and(range(
                binder,
                &x,
                BinaryOperator::LtEq,
                high,
            )),
            None => Expression::boolean(false),
        },
    }
}

fn equals(binder: &mut Binder, x: &Expression, value: &Value) -> Expression {
    if value.is_null() {
        // Missing and JSON null both match.
        return Expression::call(
            "COALESCE",
            vec![Expression::call("jsonb_typeof", vec![x.clone()]), Expression::text("null")],
        )
        .eq(Expression::text("null"));
    }
    Expression::call(
        "COALESCE",
        vec![x.clone().eq(binder.json(value)), Expression::boolean(false)],
    )
}

fn range(binder: &mut Binder, x: &Expression, op: BinaryOperator, value: &Value) -> Expression {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) => {
                let bound = binder.bind(SqlParam::Float(f)).cast("float8");
                guarded(
                    typeof_is(x, "number"),
                    Expression::binary(scalar_text(x.clone()).cast("float8"), op, bound),
                )
            }
            None => Expression::boolean(false),
        },
        Value::String(s) => {
            let bound = binder.text(s);
            guarded(
                typeof_is(x, "string"),
                Expression::binary(scalar_text(x.clone()).collate_c(), op, bound),
            )
        }
        _ => Expression::boolean(false),
    }
}

fn in_list(binder: &mut Binder, x: &Expression, value: &Value) -> Expression {
    in_elements(value)
        .iter()
        .map(|e| equals(binder, x, e))
        .reduce(Expression::or)
        .unwrap_or_else(|| Expression::boolean(false))
}

enum TextMatch {
    Contains,
    Prefix,
    Suffix,
}

fn text_match(binder: &mut Binder, x: &Expression, value: &Value, kind: TextMatch) -> Expression {
    let Value::String(needle) = value else {
        return Expression::boolean(false);
    };
    // Under "C", lower() folds ASCII letters only, matching the evaluator
    // whatever the database's LC_CTYPE is.
    let haystack = Expression::call("lower", vec![scalar_text(x.clone()).collate_c()]);
    let needle = Expression::call("lower", vec![binder.text(needle).collate_c()]);
    let test = match kind {
        TextMatch::Contains => Expression::binary(
            Expression::call("strpos", vec![haystack, needle]),
            BinaryOperator::Gt,
            Expression::int(0),
        ),
        TextMatch::Prefix => Expression::call("starts_with", vec![haystack, needle]),
        TextMatch::Suffix => {
            let len = Expression::call("char_length", vec![needle.clone()]);
            Expression::call("right", vec![haystack, len]).eq(needle)
        }
    };
    guarded(typeof_is(x, "string"), test)
}

/// The three ORDER BY terms for one sort key: type rank, numeric value,
/// text value. Arrays and objects of equal rank tie.
fn sort_terms(binder: &mut Binder, column: &str, key: &SortField) -> Vec<OrderByExpr> {
    let x = field(binder, column, &key.field);
    let asc = key.direction == SortDirection::Asc;
    let kind = Expression::call("jsonb_typeof", vec![x.clone()]);

    let rank = Expression::Case {
        operand: Some(Box::new(kind)),
        when_clauses: [("boolean", 1), ("number", 2), ("string", 3), ("array", 4), ("object", 5)]
            .into_iter()
            .map(|(k, r)| (Expression::text(k), Expression::int(r)))
            .collect(),
        else_clause: Some(Box::new(Expression::int(0))),
    };
    let number = Expression::Case {
        operand: None,
        when_clauses: vec![(
            typeof_is(&x, "number"),
            scalar_text(x.clone()).cast("float8"),
        )],
        else_clause: None,
    };
    let text = Expression::Case {
        operand: None,
        when_clauses: vec![(
            typeof_is(&x, "string").or(typeof_is(&x, "boolean")),
            scalar_text(x.clone()),
        )],
        else_clause: None,
    }
    .collate_c();

    [rank, number, text]
        .into_iter()
        .map(|expr| OrderByExpr { expr, asc })
        .collect()
}

fn id_order() -> OrderByExpr {
    OrderByExpr {
        expr: Expression::column(ID_COLUMN).collate_c(),
        asc: true,
    }
}

/// `COALESCE((SELECT jsonb_object_agg(key, value) FROM jsonb_each(data)
/// WHERE key = ANY($n::text[])), '{}'::jsonb)`
fn projection(binder: &mut Binder, fields: &[String]) -> Expression {
    let keys = binder.bind(SqlParam::TextArray(fields.to_vec())).cast("text[]");
    let picked = SelectQuery {
        projections: vec![SelectItem::new(Expression::Aggregate {
            name: "jsonb_object_agg",
            args: vec![Expression::column("key"), Expression::column("value")],
            filter: None,
        })],
        from: Some(TableRef::Function {
            name: "jsonb_each",
            args: vec![Expression::column(DATA_COLUMN)],
        }),
        filter: Some(Expression::AnyOf {
            expr: Box::new(Expression::column("key")),
            array: Box::new(keys),
        }),
        ..Default::default()
    };
    Expression::call(
        "COALESCE",
        vec![
            Expression::Subquery(Box::new(picked)),
            Expression::text("{}").cast("jsonb"),
        ],
    )
}

/// `SELECT data ... ORDER BY ... LIMIT ... OFFSET ...`
///
/// With `paginate = false` the LIMIT/OFFSET clauses are left out so the
/// caller can de-duplicate before paginating.
pub fn select_records(table: &str, query: &DriverQuery, paginate: bool) -> Statement {
    let mut binder = Binder::default();
    let data = if query.fields.is_empty() {
        Expression::column(DATA_COLUMN)
    } else {
        projection(&mut binder, &query.fields)
    };
    let filter = lower_filters(&mut binder, DATA_COLUMN, &query.filters);
    let mut order_by: Vec<OrderByExpr> = query
        .sort
        .iter()
        .flat_map(|key| sort_terms(&mut binder, DATA_COLUMN, key))
        .collect();
    order_by.push(id_order());

    let (limit, offset) = if paginate {
        (
            query.top.map(|n| binder.bind(SqlParam::Int(n as i64)).cast("int8")),
            query.skip.map(|n| binder.bind(SqlParam::Int(n as i64)).cast("int8")),
        )
    } else {
        (None, None)
    };

    let select = SelectQuery {
        projections: vec![SelectItem::aliased(data, DATA_COLUMN)],
        from: Some(TableRef::Table(table.to_string())),
        filter,
        order_by,
        limit,
        offset,
        ..Default::default()
    };
    binder.finish(&Query::Select(Box::new(select)))
}

pub fn select_by_id(table: &str, id: &str) -> Statement {
    let mut binder = Binder::default();
    let select = SelectQuery {
        projections: vec![SelectItem::new(Expression::column(DATA_COLUMN))],
        from: Some(TableRef::Table(table.to_string())),
        filter: Some(Expression::column(ID_COLUMN).eq(binder.text(id))),
        ..Default::default()
    };
    binder.finish(&Query::Select(Box::new(select)))
}

pub fn count(table: &str, filters: &FilterArray) -> Statement {
    let mut binder = Binder::default();
    let select = SelectQuery {
        projections: vec![SelectItem::new(Expression::CountStar { filter: None })],
        from: Some(TableRef::Table(table.to_string())),
        filter: lower_filters(&mut binder, DATA_COLUMN, filters),
        ..Default::default()
    };
    binder.finish(&Query::Select(Box::new(select)))
}

/// `SELECT DISTINCT`-equivalent over one field, non-null values only.
pub fn distinct_values(table: &str, field_name: &str, filters: &FilterArray) -> Statement {
    let mut binder = Binder::default();
    let x = field(&mut binder, DATA_COLUMN, field_name);
    let mut filter = Expression::call("jsonb_typeof", vec![x.clone()])
        .eq(Expression::text("null"))
        .negate();
    if let Some(user) = lower_filters(&mut binder, DATA_COLUMN, filters) {
        filter = user.and(filter);
    }
    let select = SelectQuery {
        projections: vec![SelectItem::aliased(x.clone(), "v")],
        from: Some(TableRef::Table(table.to_string())),
        filter: Some(filter),
        group_by: vec![x],
        ..Default::default()
    };
    binder.finish(&Query::Select(Box::new(select)))
}

pub fn insert(table: &str, id: &str, record: &Record) -> Statement {
    let mut binder = Binder::default();
    let insert = InsertQuery {
        table: table.to_string(),
        columns: vec![ID_COLUMN.to_string(), DATA_COLUMN.to_string()],
        values: vec![
            binder.text(id),
            binder.json(&Value::Object(record.clone())),
        ],
        on_conflict_do_nothing: Some(ID_COLUMN.to_string()),
        returning: vec![Expression::column(DATA_COLUMN)],
    };
    binder.finish(&Query::Insert(insert))
}

/// Shallow-merge `patch` into matching rows: `data = data || $n::jsonb`.
/// `target` selects a single id; otherwise `filters` apply.
pub fn update(table: &str, target: UpdateTarget<'_>, patch: &Record) -> Statement {
    let mut binder = Binder::default();
    let merged = Expression::binary(
        Expression::column(DATA_COLUMN),
        BinaryOperator::Concat,
        binder.json(&Value::Object(patch.clone())),
    );
    let filter = target.lower(&mut binder);
    let returning = match target {
        UpdateTarget::Id(_) => vec![Expression::column(DATA_COLUMN)],
        UpdateTarget::Filters(_) => Vec::new(),
    };
    let update = UpdateQuery {
        table: table.to_string(),
        assignments: vec![(DATA_COLUMN.to_string(), merged)],
        filter,
        returning,
    };
    binder.finish(&Query::Update(update))
}

pub fn delete(table: &str, target: UpdateTarget<'_>) -> Statement {
    let mut binder = Binder::default();
    let delete = DeleteQuery {
        table: table.to_string(),
        filter: target.lower(&mut binder),
    };
    binder.finish(&Query::Delete(delete))
}

#[derive(Debug, Clone, Copy)]
pub enum UpdateTarget<'a> {
    Id(&'a str),
    Filters(&'a FilterArray),
}

impl UpdateTarget<'_> {
    fn lower(&self, binder: &mut Binder) -> Option<Expression> {
        match self {
            UpdateTarget::Id(id) => Some(Expression::column(ID_COLUMN).eq(binder.text(id))),
            UpdateTarget::Filters(filters) => lower_filters(binder, DATA_COLUMN, filters),
        }
    }
}

fn aggregate_expr(function: AggregateFunction, field: &str, source: Expression) -> Expression {
    if function == AggregateFunction::Count {
        let filter = (field != "*").then(|| {
            Box::new(
                Expression::call("jsonb_typeof", vec![source.clone()])
                    .eq(Expression::text("null"))
                    .negate(),
            )
        });
        return Expression::CountStar { filter };
    }
    let number = Expression::Case {
        operand: None,
        when_clauses: vec![(
            typeof_is(&source, "number"),
            scalar_text(source.clone()).cast("float8"),
        )],
        else_clause: None,
    };
    Expression::Aggregate {
        name: function.as_str(),
        args: vec![number],
        filter: None,
    }
}

/// Native grouping:
///
/// ```text
/// SELECT row FROM (
///   SELECT jsonb_build_object(<key>, g0, ..., <name>, <agg(a0)>, ...) AS row
///   FROM (SELECT COALESCE(data #> $p, 'null') AS g0, data #> $q AS a0 ... WHERE <filter>) AS src
///   GROUP BY g0, ...
/// ) AS grouped WHERE <having over row> ORDER BY <sort over row>, <group keys> LIMIT OFFSET
/// ```
pub fn aggregate(table: &str, query: &DriverQuery) -> Statement {
    let mut binder = Binder::default();

    let mut source_items = Vec::new();
    for (i, name) in query.group_by.iter().enumerate() {
        let x = field(&mut binder, DATA_COLUMN, name);
        source_items.push(SelectItem::aliased(
            Expression::call("COALESCE", vec![x, Expression::text("null").cast("jsonb")]),
            format!("g{i}"),
        ));
    }
    for (i, aggregation) in query.aggregations.iter().enumerate() {
        if aggregation.field != "*" {
            let x = field(&mut binder, DATA_COLUMN, &aggregation.field);
            source_items.push(SelectItem::aliased(x, format!("a{i}")));
        }
    }
    if source_items.is_empty() {
        source_items.push(SelectItem::aliased(Expression::int(1), "one"));
    }
    let source = SelectQuery {
        projections: source_items,
        from: Some(TableRef::Table(table.to_string())),
        filter: lower_filters(&mut binder, DATA_COLUMN, &query.filters),
        ..Default::default()
    };

    let mut row_args = Vec::new();
    for (i, name) in query.group_by.iter().enumerate() {
        row_args.push(binder.text(name));
        row_args.push(Expression::column(format!("g{i}")));
    }
    for (i, aggregation) in query.aggregations.iter().enumerate() {
        row_args.push(binder.text(&aggregation.output_name()));
        row_args.push(aggregate_for(aggregation, i));
    }
    let grouped = SelectQuery {
        projections: vec![SelectItem::aliased(
            Expression::call("jsonb_build_object", row_args),
            ROW_COLUMN,
        )],
        from: Some(TableRef::Subquery {
            query: Box::new(source),
            alias: "src".into(),
        }),
        group_by: (0..query.group_by.len())
            .map(|i| Expression::column(format!("g{i}")))
            .collect(),
        ..Default::default()
    };

    let mut order_by: Vec<OrderByExpr> = query
        .sort
        .iter()
        .flat_map(|key| sort_terms(&mut binder, ROW_COLUMN, key))
        .collect();
    for name in &query.group_by {
        order_by.extend(sort_terms(&mut binder, ROW_COLUMN, &SortField::asc(name.as_str())));
    }

    let outer = SelectQuery {
        projections: vec![SelectItem::new(Expression::column(ROW_COLUMN))],
        from: Some(TableRef::Subquery {
            query: Box::new(grouped),
            alias: "grouped".into(),
        }),
        filter: lower_filters(&mut binder, ROW_COLUMN, &query.having),
        order_by,
        limit: query
            .top
            .map(|n| binder.bind(SqlParam::Int(n as i64)).cast("int8")),
        offset: query
            .skip
            .map(|n| binder.bind(SqlParam::Int(n as i64)).cast("int8")),
        ..Default::default()
    };
    binder.finish(&Query::Select(Box::new(outer)))
}

fn aggregate_for(aggregation: &Aggregation, index: usize) -> Expression {
    aggregate_expr(
        aggregation.function,
        &aggregation.field,
        Expression::column(format!("a{index}")),
    )
}

pub fn create_table(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY, {} JSONB NOT NULL)",
        super::sql::quote_ident(table),
        ID_COLUMN,
        DATA_COLUMN
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::FilterArray;
    use serde_json::json;

    fn filters(value: Value) -> FilterArray {
        FilterArray::from_value(&value).unwrap()
    }

    #[test]
    fn test_values_are_bound_not_interpolated() {
        let query = DriverQuery::filtered(filters(json!([["name", "=", "x'; DROP TABLE users; --"]])));
        let stmt = select_records("users", &query, true);
        assert!(!stmt.sql.contains("DROP"));
        assert_eq!(
            stmt.sql,
            "SELECT data AS data FROM \"users\" \
             WHERE COALESCE((data #> $1::text[]) = $2::jsonb, FALSE) \
             ORDER BY id COLLATE \"C\" ASC"
        );
        assert_eq!(
            stmt.params,
            vec![
                SqlParam::TextArray(vec!["name".into()]),
                SqlParam::Json(json!("x'; DROP TABLE users; --")),
            ]
        );
    }

    #[test]
    fn test_left_to_right_reduction() {
        let query = DriverQuery::filtered(filters(json!([
            ["age", ">", 25], "or", ["role", "=", "admin"], "and", ["active", "=", true]
        ])));
        let stmt = select_records("users", &query, true);
        let where_clause = stmt.sql.split(" WHERE ").nth(1).unwrap();
        assert!(where_clause.starts_with("(("), "{where_clause}");
        assert!(where_clause.contains(") AND COALESCE"), "{where_clause}");
        assert_eq!(stmt.params.len(), 6);
        assert_eq!(stmt.params[1], SqlParam::Float(25.0));
    }

    #[test]
    fn test_field_path_bound_once() {
        let query = DriverQuery {
            filters: filters(json!([["age", ">", 1], ["age", "<", 9]])),
            sort: vec![SortField::desc("age")],
            ..Default::default()
        };
        let stmt = select_records("users", &query, true);
        let paths = stmt
            .params
            .iter()
            .filter(|p| matches!(p, SqlParam::TextArray(_)))
            .count();
        assert_eq!(paths, 1);
        assert!(stmt.sql.contains("DESC"));
    }

    #[test]
    fn test_dotted_field_path() {
        let stmt = count("users", &filters(json!([["owner.name", "=", "Bob"]])));
        assert_eq!(
            stmt.params[0],
            SqlParam::TextArray(vec!["owner".into(), "name".into()])
        );
        assert!(stmt.sql.starts_with("SELECT count(*) FROM \"users\" WHERE"));
    }

    #[test]
    fn test_pagination_is_parameterised() {
        let query = DriverQuery {
            top: Some(10),
            skip: Some(20),
            ..Default::default()
        };
        let stmt = select_records("users", &query, true);
        assert!(stmt.sql.ends_with("LIMIT $1::int8 OFFSET $2::int8"));
        assert_eq!(stmt.params, vec![SqlParam::Int(10), SqlParam::Int(20)]);

        let unpaged = select_records("users", &query, false);
        assert!(!unpaged.sql.contains("LIMIT"));
    }

    #[test]
    fn test_empty_in_list_is_false() {
        let query = DriverQuery::filtered(filters(json!([["role", "in", []]])));
        let stmt = select_records("users", &query, true);
        assert!(stmt.sql.contains("WHERE FALSE"));
    }

    #[test]
    fn test_null_equality() {
        let stmt = count("users", &filters(json!([["deleted_at", "=", null]])));
        assert!(stmt
            .sql
            .contains("COALESCE(jsonb_typeof((data #> $1::text[])), 'null') = 'null'"));
        assert_eq!(stmt.params.len(), 1);
    }

    #[test]
    fn test_text_operators() {
        let stmt = count("users", &filters(json!([["name", "startswith", "Al"]])));
        assert!(stmt.sql.contains(
            "starts_with(lower(((data #> $1::text[]) #>> '{}') COLLATE \"C\"), lower($2::text COLLATE \"C\"))"
        ));
        let stmt = count("users", &filters(json!([["name", "notcontains", "x"]])));
        assert!(stmt.sql.contains("NOT (CASE WHEN"));
    }

    #[test]
    fn test_projection() {
        let query = DriverQuery {
            fields: vec!["name".into(), "email".into()],
            ..Default::default()
        };
        let stmt = select_records("users", &query, true);
        assert!(stmt.sql.starts_with(
            "SELECT COALESCE((SELECT jsonb_object_agg(key, value) FROM jsonb_each(data) WHERE key = ANY($1::text[])), '{}'::jsonb) AS data"
        ));
        assert_eq!(
            stmt.params[0],
            SqlParam::TextArray(vec!["name".into(), "email".into()])
        );
    }

    #[test]
    fn test_aggregate_statement() {
        let query = DriverQuery {
            group_by: vec!["role".into()],
            aggregations: vec![
                Aggregation::new(AggregateFunction::Count, "*"),
                Aggregation::new(AggregateFunction::Avg, "age"),
            ],
            having: filters(json!([["count", ">", 1]])),
            top: Some(5),
            ..Default::default()
        };
        let stmt = aggregate("users", &query);
        assert!(stmt.sql.starts_with("SELECT row FROM (SELECT jsonb_build_object("));
        assert!(stmt.sql.contains("count(*)"));
        assert!(stmt.sql.contains("avg(CASE WHEN"));
        assert!(stmt.sql.contains("GROUP BY g0"));
        assert!(stmt.sql.contains(") AS grouped WHERE"));
        assert!(stmt.params.contains(&SqlParam::Text("avg_age".into())));
        assert_eq!(stmt.params.last(), Some(&SqlParam::Int(5)));
    }

    #[test]
    fn test_update_merges_patch() {
        let patch = json!({"age": 31}).as_object().cloned().unwrap();
        let stmt = update("users", UpdateTarget::Id("u1"), &patch);
        assert_eq!(
            stmt.sql,
            "UPDATE \"users\" SET data = data || $1::jsonb WHERE id = $2::text RETURNING data"
        );
    }
}
