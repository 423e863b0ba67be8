//! Minimal PostgreSQL statement AST and its renderer.
//!
//! Lowering (see `lower.rs`) builds these nodes; [`compile`] turns them into
//! SQL text. Values never appear here: they are bound parameters (`$n`), and
//! the only literals are fixed constants chosen by the lowering itself.

use serde_json::Value;
use tokio_postgres::types::ToSql;

/// Top-level statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Select(Box<SelectQuery>),
    Insert(InsertQuery),
    Update(UpdateQuery),
    Delete(DeleteQuery),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    pub projections: Vec<SelectItem>,
    pub from: Option<TableRef>,
    pub filter: Option<Expression>,
    pub group_by: Vec<Expression>,
    pub order_by: Vec<OrderByExpr>,
    pub limit: Option<Expression>,
    pub offset: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expression,
    pub alias: Option<String>,
}

impl SelectItem {
    pub fn new(expr: Expression) -> Self {
        Self { expr, alias: None }
    }

    pub fn aliased(expr: Expression, alias: impl Into<String>) -> Self {
        Self {
            expr,
            alias: Some(alias.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableRef {
    /// A quoted table name.
    Table(String),
    Subquery { query: Box<SelectQuery>, alias: String },
    /// Set-returning function: `jsonb_each(data)`
    Function {
        name: &'static str,
        args: Vec<Expression>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Expression>,
    /// `ON CONFLICT (<column>) DO NOTHING`
    pub on_conflict_do_nothing: Option<String>,
    pub returning: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateQuery {
    pub table: String,
    pub assignments: Vec<(String, Expression)>,
    pub filter: Option<Expression>,
    pub returning: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteQuery {
    pub table: String,
    pub filter: Option<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderByExpr {
    pub expr: Expression,
    pub asc: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Unquoted column or alias chosen by the lowering (`data`, `id`, `g0`).
    Column(String),
    Literal(Literal),
    /// Bound parameter `$n` (1-based).
    Parameter(usize),
    BinaryOp {
        left: Box<Expression>,
        op: BinaryOperator,
        right: Box<Expression>,
    },
    Not(Box<Expression>),
    Function {
        name: &'static str,
        args: Vec<Expression>,
    },
    Aggregate {
        name: &'static str,
        args: Vec<Expression>,
        filter: Option<Box<Expression>>,
    },
    /// `count(*)`
    CountStar { filter: Option<Box<Expression>> },
    Case {
        operand: Option<Box<Expression>>,
        when_clauses: Vec<(Expression, Expression)>,
        else_clause: Option<Box<Expression>>,
    },
    /// `expr::type`
    TypeCast {
        expr: Box<Expression>,
        data_type: &'static str,
    },
    /// `expr COLLATE "name"`
    Collate {
        expr: Box<Expression>,
        collation: &'static str,
    },
    /// `(expr #> path)` or `(expr #>> path)`
    JsonPath {
        expr: Box<Expression>,
        path: Box<Expression>,
        as_text: bool,
    },
    /// `expr = ANY(array)`
    AnyOf {
        expr: Box<Expression>,
        array: Box<Expression>,
    },
    Subquery(Box<SelectQuery>),
    Nested(Box<Expression>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Boolean(bool),
    Integer(i64),
    String(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Eq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    /// jsonb `||`
    Concat,
}

// Constructors used by the lowering.
impl Expression {
    pub fn column(name: impl Into<String>) -> Self {
        Expression::Column(name.into())
    }

    pub fn text(s: &'static str) -> Self {
        Expression::Literal(Literal::String(s))
    }

    pub fn boolean(b: bool) -> Self {
        Expression::Literal(Literal::Boolean(b))
    }

    pub fn int(i: i64) -> Self {
        Expression::Literal(Literal::Integer(i))
    }

    pub fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Self {
        Expression::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn eq(self, right: Expression) -> Self {
        Self::binary(self, BinaryOperator::Eq, right)
    }

    pub fn and(self, right: Expression) -> Self {
        Expression::Nested(Box::new(Self::binary(self, BinaryOperator::And, right)))
    }

    pub fn or(self, right: Expression) -> Self {
        Expression::Nested(Box::new(Self::binary(self, BinaryOperator::Or, right)))
    }

    pub fn negate(self) -> Self {
        Expression::Not(Box::new(self))
    }

    pub fn cast(self, data_type: &'static str) -> Self {
        Expression::TypeCast {
            expr: Box::new(self),
            data_type,
        }
    }

    pub fn collate_c(self) -> Self {
        Expression::Collate {
            expr: Box::new(self),
            collation: "C",
        }
    }

    pub fn call(name: &'static str, args: Vec<Expression>) -> Self {
        Expression::Function { name, args }
    }
}

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Json(Value),
    Text(String),
    Float(f64),
    Int(i64),
    TextArray(Vec<String>),
}

impl SqlParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Json(v) => v,
            SqlParam::Text(s) => s,
            SqlParam::Float(f) => f,
            SqlParam::Int(i) => i,
            SqlParam::TextArray(a) => a,
        }
    }
}

/// A rendered statement with its parameters in `$n` order.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl Statement {
    pub fn new(query: &Query, params: Vec<SqlParam>) -> Self {
        Self {
            sql: compile(query),
            params,
        }
    }

    pub fn param_refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.params.iter().map(SqlParam::as_sql).collect()
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn compile(query: &Query) -> String {
    match query {
        Query::Select(s) => compile_select(s),
        Query::Insert(i) => compile_insert(i),
        Query::Update(u) => compile_update(u),
        Query::Delete(d) => compile_delete(d),
    }
}

fn compile_select(select: &SelectQuery) -> String {
    let mut parts = Vec::new();

    let items: Vec<String> = select.projections.iter().map(compile_select_item).collect();
    parts.push(format!("SELECT {}", items.join(", ")));

    if let Some(ref from) = select.from {
        parts.push(format!("FROM {}", compile_table_ref(from)));
    }

    if let Some(ref filter) = select.filter {
        parts.push(format!("WHERE {}", compile_expr(filter)));
    }

    if !select.group_by.is_empty() {
        let groups: Vec<String> = select.group_by.iter().map(compile_expr).collect();
        parts.push(format!("GROUP BY {}", groups.join(", ")));
    }

    if !select.order_by.is_empty() {
        let orders: Vec<String> = select.order_by.iter().map(compile_order_by).collect();
        parts.push(format!("ORDER BY {}", orders.join(", ")));
    }

    if let Some(ref limit) = select.limit {
        parts.push(format!("LIMIT {}", compile_expr(limit)));
    }

    if let Some(ref offset) = select.offset {
        parts.push(format!("OFFSET {}", compile_expr(offset)));
    }

    parts.join(" ")
}

fn compile_select_item(item: &SelectItem) -> String {
    let expr = compile_expr(&item.expr);
    match &item.alias {
        Some(a) => format!("{} AS {}", expr, a),
        None => expr,
    }
}

fn compile_table_ref(table: &TableRef) -> String {
    match table {
        TableRef::Table(name) => quote_ident(name),
        TableRef::Subquery { query, alias } => format!("({}) AS {}", compile_select(query), alias),
        TableRef::Function { name, args } => {
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            format!("{}({})", name, args_str.join(", "))
        }
    }
}

fn compile_insert(insert: &InsertQuery) -> String {
    let values: Vec<String> = insert.values.iter().map(compile_expr).collect();
    let mut s = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&insert.table),
        insert.columns.join(", "),
        values.join(", ")
    );
    if let Some(ref column) = insert.on_conflict_do_nothing {
        s.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", column));
    }
    push_returning(&mut s, &insert.returning);
    s
}

fn compile_update(update: &UpdateQuery) -> String {
    let sets: Vec<String> = update
        .assignments
        .iter()
        .map(|(column, expr)| format!("{} = {}", column, compile_expr(expr)))
        .collect();
    let mut s = format!("UPDATE {} SET {}", quote_ident(&update.table), sets.join(", "));
    if let Some(ref filter) = update.filter {
        s.push_str(&format!(" WHERE {}", compile_expr(filter)));
    }
    push_returning(&mut s, &update.returning);
    s
}

fn compile_delete(delete: &DeleteQuery) -> String {
    let mut s = format!("DELETE FROM {}", quote_ident(&delete.table));
    if let Some(ref filter) = delete.filter {
        s.push_str(&format!(" WHERE {}", compile_expr(filter)));
    }
    s
}

fn push_returning(s: &mut String, returning: &[Expression]) {
    if !returning.is_empty() {
        let items: Vec<String> = returning.iter().map(compile_expr).collect();
        s.push_str(&format!(" RETURNING {}", items.join(", ")));
    }
}

fn compile_expr(expr: &Expression) -> String {
    match expr {
        Expression::Column(name) => name.clone(),
        Expression::Literal(lit) => compile_literal(lit),
        Expression::Parameter(idx) => format!("${}", idx),
        Expression::BinaryOp { left, op, right } => {
            let op_str = match op {
                BinaryOperator::Eq => "=",
                BinaryOperator::Lt => "<",
                BinaryOperator::LtEq => "<=",
                BinaryOperator::Gt => ">",
                BinaryOperator::GtEq => ">=",
                BinaryOperator::And => "AND",
                BinaryOperator::Or => "OR",
                BinaryOperator::Concat => "||",
            };
            format!("{} {} {}", compile_expr(left), op_str, compile_expr(right))
        }
        Expression::Not(inner) => format!("NOT ({})", compile_expr(inner)),
        Expression::Function { name, args } => {
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            format!("{}({})", name, args_str.join(", "))
        }
        Expression::Aggregate { name, args, filter } => {
            let args_str: Vec<String> = args.iter().map(compile_expr).collect();
            let mut s = format!("{}({})", name, args_str.join(", "));
            push_filter(&mut s, filter);
            s
        }
        Expression::CountStar { filter } => {
            let mut s = String::from("count(*)");
            push_filter(&mut s, filter);
            s
        }
        Expression::Case {
            operand,
            when_clauses,
            else_clause,
        } => {
            let mut s = String::from("CASE");
            if let Some(op) = operand {
                s.push_str(&format!(" {}", compile_expr(op)));
            }
            for (when, then) in when_clauses {
                s.push_str(&format!(
                    " WHEN {} THEN {}",
                    compile_expr(when),
                    compile_expr(then)
                ));
            }
            if let Some(else_expr) = else_clause {
                s.push_str(&format!(" ELSE {}", compile_expr(else_expr)));
            }
            s.push_str(" END");
            s
        }
        Expression::TypeCast { expr, data_type } => {
            format!("{}::{}", compile_expr(expr), data_type)
        }
        Expression::Collate { expr, collation } => {
            format!("{} COLLATE {}", compile_expr(expr), quote_ident(collation))
        }
        Expression::JsonPath {
            expr,
            path,
            as_text,
        } => {
            let op = if *as_text { "#>>" } else { "#>" };
            format!("({} {} {})", compile_expr(expr), op, compile_expr(path))
        }
        Expression::AnyOf { expr, array } => {
            format!("{} = ANY({})", compile_expr(expr), compile_expr(array))
        }
        Expression::Subquery(q) => format!("({})", compile_select(q)),
        Expression::Nested(inner) => format!("({})", compile_expr(inner)),
    }
}

fn push_filter(s: &mut String, filter: &Option<Box<Expression>>) {
    if let Some(f) = filter {
        s.push_str(&format!(" FILTER (WHERE {})", compile_expr(f)));
    }
}

fn compile_literal(lit: &Literal) -> String {
    match lit {
        Literal::Boolean(b) => {
            if *b {
                "TRUE".to_string()
            } else {
                "FALSE".to_string()
            }
        }
        Literal::Integer(i) => i.to_string(),
        Literal::String(s) => format!("'{}'", s.replace('\'', "''")),
    }
}

fn compile_order_by(order: &OrderByExpr) -> String {
    let dir = if order.asc { "ASC" } else { "DESC" };
    format!("{} {}", compile_expr(&order.expr), dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_compile_select() {
        let select = SelectQuery {
            projections: vec![SelectItem::new(Expression::column("data"))],
            from: Some(TableRef::Table("users".into())),
            filter: Some(Expression::column("id").eq(Expression::Parameter(1))),
            order_by: vec![OrderByExpr {
                expr: Expression::column("id").collate_c(),
                asc: true,
            }],
            limit: Some(Expression::Parameter(2).cast("int8")),
            ..Default::default()
        };
        assert_eq!(
            compile(&Query::Select(Box::new(select))),
            "SELECT data FROM \"users\" WHERE id = $1 ORDER BY id COLLATE \"C\" ASC LIMIT $2::int8"
        );
    }

    #[test]
    fn test_compile_insert_on_conflict() {
        let insert = InsertQuery {
            table: "users".into(),
            columns: vec!["id".into(), "data".into()],
            values: vec![
                Expression::Parameter(1),
                Expression::Parameter(2).cast("jsonb"),
            ],
            on_conflict_do_nothing: Some("id".into()),
            returning: vec![Expression::column("data")],
        };
        assert_eq!(
            compile(&Query::Insert(insert)),
            "INSERT INTO \"users\" (id, data) VALUES ($1, $2::jsonb) ON CONFLICT (id) DO NOTHING RETURNING data"
        );
    }

    #[test]
    fn test_compile_case_and_aggregate() {
        let case = Expression::Case {
            operand: None,
            when_clauses: vec![(Expression::boolean(true), Expression::int(1))],
            else_clause: Some(Box::new(Expression::int(0))),
        };
        let agg = Expression::Aggregate {
            name: "sum",
            args: vec![case],
            filter: None,
        };
        assert_eq!(compile_expr(&agg), "sum(CASE WHEN TRUE THEN 1 ELSE 0 END)");
        let count = Expression::CountStar {
            filter: Some(Box::new(Expression::boolean(false))),
        };
        assert_eq!(compile_expr(&count), "count(*) FILTER (WHERE FALSE)");
    }

    #[test]
    fn test_and_or_are_parenthesised() {
        let a = Expression::column("a");
        let b = Expression::column("b");
        let c = Expression::column("c");
        assert_eq!(compile_expr(&a.or(b).and(c)), "((a OR b) AND c)");
    }
}
