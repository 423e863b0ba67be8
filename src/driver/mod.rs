//! Driver contract: the capability set every storage backend implements.
//!
//! Mandatory operations live on [`Driver`]. Optional extensions are separate
//! interfaces ([`AggregateDriver`], [`BulkDriver`], [`TransactionalDriver`],
//! [`SchemaIntrospector`]) exposed through accessor methods, and summarised
//! once per datasource in [`DriverCapabilities`] when it is registered.
//!
//! Two adapter strategies satisfy the same observable semantics:
//! - native query backends compose a filtered, sorted, paginated query with
//!   every value bound as a parameter ([`postgres`]);
//! - scan-and-filter backends load the candidate set and run the shared
//!   in-process pipeline in [`scan`] ([`memory`], [`file`]).

pub mod aggregate;
pub mod eval;
pub mod file;
pub mod memory;
pub mod postgres;
pub mod record;
pub mod scan;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::ast::{translate_opt, Aggregation, FilterArray, QueryAst, Record, SortField};
use crate::error::{EngineResult, TranslationError};

pub use file::FileDriver;
pub use memory::MemoryDriver;
pub use postgres::PostgresDriver;

/// Opaque handle to a backend transaction, issued by `begin_transaction`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionHandle(String);

impl TransactionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-call context. The transaction handle is the only state that carries
/// over between calls, and only because the caller passes it explicitly.
#[derive(Debug, Clone, Default)]
pub struct DriverContext {
    pub transaction: Option<TransactionHandle>,
}

impl DriverContext {
    pub fn in_transaction(handle: TransactionHandle) -> Self {
        Self {
            transaction: Some(handle),
        }
    }
}

/// Per-instance driver policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverOptions {
    /// When true, `update` of a missing record fails with `NotFound`;
    /// otherwise it returns `None`.
    pub strict: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self { strict: true }
    }
}

/// A read as a driver sees it: filters already in canonical array form.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DriverQuery {
    pub fields: Vec<String>,
    pub filters: FilterArray,
    pub sort: Vec<SortField>,
    pub top: Option<usize>,
    pub skip: Option<usize>,
    pub distinct: bool,
    pub group_by: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub having: FilterArray,
}

impl DriverQuery {
    /// Translate the filter trees of a Query AST.
    pub fn from_ast(ast: &QueryAst) -> Result<Self, TranslationError> {
        Ok(Self {
            fields: ast.fields.clone(),
            filters: translate_opt(ast.filter.as_ref())?,
            sort: ast.sort.clone(),
            top: ast.top,
            skip: ast.skip,
            distinct: ast.distinct,
            group_by: ast.group_by.clone(),
            aggregations: ast.aggregations.clone(),
            having: translate_opt(ast.having.as_ref())?,
        })
    }

    pub fn filtered(filters: FilterArray) -> Self {
        Self {
            filters,
            ..Default::default()
        }
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty() || !self.aggregations.is_empty()
    }
}

/// Mandatory CRUD surface of a storage backend.
///
/// A driver is bound to exactly one backend connection or pool and keeps no
/// query-level state.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Backend kind, used in logs ("memory", "file", "postgres", ...).
    fn name(&self) -> &str;

    async fn find(
        &self,
        object: &str,
        query: &DriverQuery,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>>;

    async fn find_one(
        &self,
        object: &str,
        id: &str,
        ctx: &DriverContext,
    ) -> EngineResult<Option<Record>>;

    /// Insert a record, assigning an opaque id when `data` has none and
    /// stamping `created_at` / `updated_at`.
    async fn create(&self, object: &str, data: Record, ctx: &DriverContext)
        -> EngineResult<Record>;

    /// Merge `data` onto the stored record.
    async fn update(
        &self,
        object: &str,
        id: &str,
        data: Record,
        ctx: &DriverContext,
    ) -> EngineResult<Option<Record>>;

    /// Idempotent: `true` when a record was removed, `false` otherwise.
    async fn delete(&self, object: &str, id: &str, ctx: &DriverContext) -> EngineResult<bool>;

    async fn count(
        &self,
        object: &str,
        filters: &FilterArray,
        ctx: &DriverContext,
    ) -> EngineResult<u64>;

    fn aggregation(&self) -> Option<&dyn AggregateDriver> {
        None
    }

    fn bulk(&self) -> Option<&dyn BulkDriver> {
        None
    }

    fn transactions(&self) -> Option<&dyn TransactionalDriver> {
        None
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospector> {
        None
    }

    /// Whether `disconnect` releases anything.
    fn holds_connection(&self) -> bool {
        false
    }

    async fn disconnect(&self) -> EngineResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait AggregateDriver: Send + Sync {
    /// Group, aggregate, filter by `having`, sort and paginate.
    async fn aggregate(
        &self,
        object: &str,
        query: &DriverQuery,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>>;

    /// Distinct non-null values of `field` among matching records.
    async fn distinct(
        &self,
        object: &str,
        field: &str,
        filters: &FilterArray,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Value>>;
}

#[async_trait]
pub trait BulkDriver: Send + Sync {
    async fn create_many(
        &self,
        object: &str,
        records: Vec<Record>,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>>;

    /// Returns the exact number of updated records.
    async fn update_many(
        &self,
        object: &str,
        filters: &FilterArray,
        data: Record,
        ctx: &DriverContext,
    ) -> EngineResult<u64>;

    /// Returns the exact number of deleted records.
    async fn delete_many(
        &self,
        object: &str,
        filters: &FilterArray,
        ctx: &DriverContext,
    ) -> EngineResult<u64>;
}

#[async_trait]
pub trait TransactionalDriver: Send + Sync {
    async fn begin_transaction(&self) -> EngineResult<TransactionHandle>;
    async fn commit_transaction(&self, handle: &TransactionHandle) -> EngineResult<()>;
    async fn rollback_transaction(&self, handle: &TransactionHandle) -> EngineResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSchema {
    pub name: String,
    /// JSON type observed for the field ("string", "number", ...), or "mixed".
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
    pub record_count: u64,
}

#[async_trait]
pub trait SchemaIntrospector: Send + Sync {
    async fn introspect_schema(&self) -> EngineResult<Vec<ObjectSchema>>;
}

/// Optional capabilities of a driver, detected once at registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverCapabilities {
    pub aggregate: bool,
    pub bulk: bool,
    pub transactions: bool,
    pub introspection: bool,
    pub disconnect: bool,
}

impl DriverCapabilities {
    pub fn detect(driver: &dyn Driver) -> Self {
        Self {
            aggregate: driver.aggregation().is_some(),
            bulk: driver.bulk().is_some(),
            transactions: driver.transactions().is_some(),
            introspection: driver.introspection().is_some(),
            disconnect: driver.holds_connection(),
        }
    }
}
