//! PostgreSQL document driver.
//!
//! Every object is a table `(id TEXT PRIMARY KEY, data JSONB NOT NULL)`,
//! created on first write. Queries are lowered to a small SQL AST
//! ([`sql`]) by [`lower`] and executed on a deadpool connection pool with every
//! value bound as a parameter.

pub mod connection;
pub mod lower;
pub mod sql;

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Row};
use tracing::{debug, info, warn};

use super::eval::sort_cmp;
use super::memory::FieldKinds;
use super::record::{generate_id, merge_update, prepare_create, validate_object_name};
use super::scan::{dedupe, paginate};
use super::{
    AggregateDriver, BulkDriver, Driver, DriverContext, DriverOptions, DriverQuery, ObjectSchema,
    SchemaIntrospector, TransactionHandle, TransactionalDriver,
};
use crate::ast::{FilterArray, Record};
use crate::error::{EngineError, EngineResult};
pub use connection::{PostgresConfig, SslMode};
use lower::UpdateTarget;
use sql::{quote_ident, Statement};

/// A connection for one call: pooled, or pinned to an open transaction.
enum Conn {
    Pooled(Object),
    Pinned(OwnedMutexGuard<Object>),
}

impl Deref for Conn {
    type Target = Client;

    fn deref(&self) -> &Client {
        match self {
            Conn::Pooled(object) => object,
            Conn::Pinned(guard) => guard,
        }
    }
}

pub struct PostgresDriver {
    pool: Pool,
    options: DriverOptions,
    transactions: Mutex<HashMap<String, Arc<Mutex<Object>>>>,
    known_tables: RwLock<HashSet<String>>,
}

impl PostgresDriver {
    pub fn new(pool: Pool, options: DriverOptions) -> Self {
        Self {
            pool,
            options,
            transactions: Mutex::new(HashMap::new()),
            known_tables: RwLock::new(HashSet::new()),
        }
    }

    pub fn connect(config: &PostgresConfig, options: DriverOptions) -> anyhow::Result<Self> {
        let pool = config.build_pool()?;
        info!(server = %config.display_string(), "postgres pool ready");
        Ok(Self::new(pool, options))
    }

    async fn conn(
        &self,
        ctx: &DriverContext,
        object: &str,
        operation: &'static str,
    ) -> EngineResult<Conn> {
        match &ctx.transaction {
            Some(handle) => {
                let pinned = self
                    .transactions
                    .lock()
                    .await
                    .get(handle.as_str())
                    .cloned()
                    .ok_or_else(|| unknown_transaction(handle))?;
                Ok(Conn::Pinned(pinned.lock_owned().await))
            }
            None => self
                .pool
                .get()
                .await
                .map(Conn::Pooled)
                .map_err(|e| EngineError::driver(object, operation, e)),
        }
    }

    /// Run a statement returning rows. A missing table reads as empty.
    async fn rows(
        &self,
        conn: &Client,
        object: &str,
        operation: &'static str,
        stmt: &Statement,
    ) -> EngineResult<Vec<Row>> {
        debug!(object, operation, sql = %stmt.sql, params = stmt.params.len(), "postgres query");
        match conn.query(stmt.sql.as_str(), &stmt.param_refs()).await {
            Ok(rows) => Ok(rows),
            Err(e) if is_undefined_table(&e) => Ok(Vec::new()),
            Err(e) => Err(EngineError::driver(object, operation, e)),
        }
    }

    /// Run a statement returning an affected-row count. A missing table
    /// affects nothing.
    async fn execute(
        &self,
        conn: &Client,
        object: &str,
        operation: &'static str,
        stmt: &Statement,
    ) -> EngineResult<u64> {
        debug!(object, operation, sql = %stmt.sql, params = stmt.params.len(), "postgres execute");
        match conn.execute(stmt.sql.as_str(), &stmt.param_refs()).await {
            Ok(n) => Ok(n),
            Err(e) if is_undefined_table(&e) => Ok(0),
            Err(e) => Err(EngineError::driver(object, operation, e)),
        }
    }

    async fn ensure_table(&self, conn: &Client, object: &str, ctx: &DriverContext) -> EngineResult<()> {
        validate_object_name(object)?;
        if self.known_tables.read().await.contains(object) {
            return Ok(());
        }
        conn.batch_execute(&lower::create_table(object))
            .await
            .map_err(|e| EngineError::driver(object, "create_table", e))?;
        // A table created inside a transaction disappears on rollback.
        if ctx.transaction.is_none() {
            self.known_tables.write().await.insert(object.to_string());
        }
        Ok(())
    }

    async fn insert(&self, conn: &Client, object: &str, id: &str, record: &Record) -> EngineResult<Record> {
        let stmt = lower::insert(object, id, record);
        let rows = self.rows(conn, object, "create", &stmt).await?;
        match rows.first() {
            Some(row) => decode_record(row, object, "create"),
            None => Err(EngineError::duplicate_key(object, id)),
        }
    }

    async fn records(
        &self,
        conn: &Client,
        object: &str,
        operation: &'static str,
        stmt: &Statement,
    ) -> EngineResult<Vec<Record>> {
        self.rows(conn, object, operation, stmt)
            .await?
            .iter()
            .map(|row| decode_record(row, object, operation))
            .collect()
    }
}

fn is_undefined_table(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNDEFINED_TABLE)
}

fn unknown_transaction(handle: &TransactionHandle) -> EngineError {
    EngineError::InvalidQuery(format!("unknown transaction '{handle}'"))
}

fn decode_record(row: &Row, object: &str, operation: &'static str) -> EngineResult<Record> {
    let value: Value = row
        .try_get(0)
        .map_err(|e| EngineError::driver(object, operation, e))?;
    match value {
        Value::Object(record) => Ok(record),
        other => Err(EngineError::driver(
            object,
            operation,
            anyhow::anyhow!("expected a JSON object, got {other}"),
        )),
    }
}

/// The jsonb patch for an update: identity fields dropped, `updated_at` set.
fn update_patch(data: Record) -> Record {
    let mut patch = Record::new();
    merge_update(&mut patch, data);
    patch
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn find(
        &self,
        object: &str,
        query: &DriverQuery,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let conn = self.conn(ctx, object, "find").await?;
        if query.distinct {
            // De-duplication runs in process, so pagination has to follow it.
            let stmt = lower::select_records(object, query, false);
            let rows = self.records(&conn, object, "find", &stmt).await?;
            return Ok(paginate(dedupe(rows), query.skip, query.top));
        }
        let stmt = lower::select_records(object, query, true);
        self.records(&conn, object, "find", &stmt).await
    }

    async fn find_one(
        &self,
        object: &str,
        id: &str,
        ctx: &DriverContext,
    ) -> EngineResult<Option<Record>> {
        let conn = self.conn(ctx, object, "find_one").await?;
        let stmt = lower::select_by_id(object, id);
        Ok(self
            .records(&conn, object, "find_one", &stmt)
            .await?
            .into_iter()
            .next())
    }

    async fn create(&self, object: &str, data: Record, ctx: &DriverContext) -> EngineResult<Record> {
        let (id, record) = prepare_create(object, data, generate_id)?;
        let conn = self.conn(ctx, object, "create").await?;
        self.ensure_table(&conn, object, ctx).await?;
        self.insert(&conn, object, &id, &record).await
    }

    async fn update(
        &self,
        object: &str,
        id: &str,
        data: Record,
        ctx: &DriverContext,
    ) -> EngineResult<Option<Record>> {
        let conn = self.conn(ctx, object, "update").await?;
        let stmt = lower::update(object, UpdateTarget::Id(id), &update_patch(data));
        match self.records(&conn, object, "update", &stmt).await?.into_iter().next() {
            Some(record) => Ok(Some(record)),
            None if self.options.strict => Err(EngineError::not_found(object, id)),
            None => Ok(None),
        }
    }

    async fn delete(&self, object: &str, id: &str, ctx: &DriverContext) -> EngineResult<bool> {
        let conn = self.conn(ctx, object, "delete").await?;
        let stmt = lower::delete(object, UpdateTarget::Id(id));
        Ok(self.execute(&conn, object, "delete", &stmt).await? > 0)
    }

    async fn count(
        &self,
        object: &str,
        filters: &FilterArray,
        ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let conn = self.conn(ctx, object, "count").await?;
        let stmt = lower::count(object, filters);
        let rows = self.rows(&conn, object, "count", &stmt).await?;
        match rows.first() {
            Some(row) => {
                let n: i64 = row
                    .try_get(0)
                    .map_err(|e| EngineError::driver(object, "count", e))?;
                Ok(n.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    fn aggregation(&self) -> Option<&dyn AggregateDriver> {
        Some(self)
    }

    fn bulk(&self) -> Option<&dyn BulkDriver> {
        Some(self)
    }

    fn transactions(&self) -> Option<&dyn TransactionalDriver> {
        Some(self)
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospector> {
        Some(self)
    }

    fn holds_connection(&self) -> bool {
        true
    }

    /// Roll back any transaction still open, then close the pool.
    async fn disconnect(&self) -> EngineResult<()> {
        let open: Vec<_> = self.transactions.lock().await.drain().collect();
        for (handle, client) in open {
            if let Err(e) = client.lock().await.batch_execute("ROLLBACK").await {
                warn!(transaction = %handle, error = %e, "rollback on disconnect failed");
            }
        }
        self.pool.close();
        info!("postgres pool closed");
        Ok(())
    }
}

#[async_trait]
impl AggregateDriver for PostgresDriver {
    async fn aggregate(
        &self,
        object: &str,
        query: &DriverQuery,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let conn = self.conn(ctx, object, "aggregate").await?;
        let stmt = lower::aggregate(object, query);
        let rows = self.records(&conn, object, "aggregate", &stmt).await?;
        if rows.is_empty() && query.group_by.is_empty() {
            // Missing table: still one row of empty aggregates.
            return Ok(super::aggregate::aggregate(Vec::new(), query));
        }
        Ok(rows)
    }

    async fn distinct(
        &self,
        object: &str,
        field: &str,
        filters: &FilterArray,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Value>> {
        let conn = self.conn(ctx, object, "distinct").await?;
        let stmt = lower::distinct_values(object, field, filters);
        let mut values = self
            .rows(&conn, object, "distinct", &stmt)
            .await?
            .iter()
            .map(|row| row.try_get::<_, Value>(0))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::driver(object, "distinct", e))?;
        values.sort_by(|a, b| sort_cmp(Some(a), Some(b)));
        Ok(values)
    }
}

#[async_trait]
impl BulkDriver for PostgresDriver {
    /// All-or-nothing: runs in its own transaction, or under a savepoint
    /// when the caller already holds one.
    async fn create_many(
        &self,
        object: &str,
        records: Vec<Record>,
        ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let prepared = records
            .into_iter()
            .map(|r| prepare_create(object, r, generate_id))
            .collect::<EngineResult<Vec<_>>>()?;

        let conn = self.conn(ctx, object, "create_many").await?;
        self.ensure_table(&conn, object, ctx).await?;

        let (begin, commit, rollback) = if ctx.transaction.is_some() {
            (
                "SAVEPOINT polyql_bulk",
                "RELEASE SAVEPOINT polyql_bulk",
                "ROLLBACK TO SAVEPOINT polyql_bulk",
            )
        } else {
            ("BEGIN", "COMMIT", "ROLLBACK")
        };
        let control = |sql: &'static str| {
            let conn = &conn;
            async move {
                conn.batch_execute(sql)
                    .await
                    .map_err(|e| EngineError::driver(object, "create_many", e))
            }
        };

        control(begin).await?;
        let mut created = Vec::with_capacity(prepared.len());
        for (id, record) in &prepared {
            match self.insert(&conn, object, id, record).await {
                Ok(record) => created.push(record),
                Err(e) => {
                    if let Err(rollback_err) = control(rollback).await {
                        warn!(object, error = %rollback_err, "bulk create rollback failed");
                    }
                    return Err(e);
                }
            }
        }
        control(commit).await?;
        Ok(created)
    }

    async fn update_many(
        &self,
        object: &str,
        filters: &FilterArray,
        data: Record,
        ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let conn = self.conn(ctx, object, "update_many").await?;
        let stmt = lower::update(object, UpdateTarget::Filters(filters), &update_patch(data));
        self.execute(&conn, object, "update_many", &stmt).await
    }

    async fn delete_many(
        &self,
        object: &str,
        filters: &FilterArray,
        ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let conn = self.conn(ctx, object, "delete_many").await?;
        let stmt = lower::delete(object, UpdateTarget::Filters(filters));
        self.execute(&conn, object, "delete_many", &stmt).await
    }
}

#[async_trait]
impl TransactionalDriver for PostgresDriver {
    async fn begin_transaction(&self) -> EngineResult<TransactionHandle> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| EngineError::driver("*", "begin", e))?;
        client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| EngineError::driver("*", "begin", e))?;
        let handle = TransactionHandle::new(generate_id());
        self.transactions
            .lock()
            .await
            .insert(handle.as_str().to_string(), Arc::new(Mutex::new(client)));
        debug!(transaction = %handle, "transaction started");
        Ok(handle)
    }

    async fn commit_transaction(&self, handle: &TransactionHandle) -> EngineResult<()> {
        self.finish(handle, "COMMIT", "commit").await
    }

    async fn rollback_transaction(&self, handle: &TransactionHandle) -> EngineResult<()> {
        self.finish(handle, "ROLLBACK", "rollback").await
    }
}

impl PostgresDriver {
    async fn finish(
        &self,
        handle: &TransactionHandle,
        sql: &'static str,
        operation: &'static str,
    ) -> EngineResult<()> {
        let pinned = self
            .transactions
            .lock()
            .await
            .remove(handle.as_str())
            .ok_or_else(|| unknown_transaction(handle))?;
        // Waits for any call still running on this transaction.
        let client = pinned.lock().await;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| EngineError::driver("*", operation, e))?;
        debug!(transaction = %handle, operation, "transaction finished");
        Ok(())
    }
}

#[async_trait]
impl SchemaIntrospector for PostgresDriver {
    async fn introspect_schema(&self) -> EngineResult<Vec<ObjectSchema>> {
        let conn = self.conn(&DriverContext::default(), "*", "introspect").await?;
        let tables = conn
            .query(
                "SELECT table_name::text FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND column_name = 'data' \
                 AND data_type = 'jsonb' ORDER BY 1",
                &[],
            )
            .await
            .map_err(|e| EngineError::driver("*", "introspect", e))?;

        let mut schemas = Vec::with_capacity(tables.len());
        for row in tables {
            let name: String = row
                .try_get(0)
                .map_err(|e| EngineError::driver("*", "introspect", e))?;
            let table = quote_ident(&name);

            let count: i64 = conn
                .query_one(format!("SELECT count(*) FROM {table}").as_str(), &[])
                .await
                .and_then(|r| r.try_get(0))
                .map_err(|e| EngineError::driver(name.as_str(), "introspect", e))?;

            let mut kinds = FieldKinds::default();
            let fields = conn
                .query(
                    &format!(
                        "SELECT key, jsonb_typeof(value) FROM {table}, jsonb_each(data) \
                         GROUP BY 1, 2 ORDER BY 1, 2"
                    ),
                    &[],
                )
                .await
                .map_err(|e| EngineError::driver(name.as_str(), "introspect", e))?;
            for field in fields {
                let key: String = field
                    .try_get(0)
                    .map_err(|e| EngineError::driver(name.as_str(), "introspect", e))?;
                let kind: String = field
                    .try_get(1)
                    .map_err(|e| EngineError::driver(name.as_str(), "introspect", e))?;
                kinds.observe(&key, &kind);
            }

            schemas.push(ObjectSchema {
                name,
                fields: kinds.finish(),
                record_count: count.max(0) as u64,
            });
        }
        Ok(schemas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_patch_protects_identity() {
        let data = json!({"id": "x", "created_at": "t", "name": "n"})
            .as_object()
            .cloned()
            .unwrap();
        let patch = update_patch(data);
        assert!(!patch.contains_key("id"));
        assert!(!patch.contains_key("created_at"));
        assert_eq!(patch["name"], "n");
        assert!(patch.contains_key("updated_at"));
    }

    #[tokio::test]
    async fn test_capabilities_without_connecting() {
        let config = PostgresConfig {
            ssl_mode: SslMode::Disable,
            ..Default::default()
        };
        let driver = PostgresDriver::connect(&config, DriverOptions::default()).unwrap();
        let caps = crate::driver::DriverCapabilities::detect(&driver);
        assert!(caps.aggregate && caps.bulk && caps.transactions && caps.introspection);
        assert!(caps.disconnect);
    }

    #[tokio::test]
    async fn test_unknown_transaction_handle() {
        let config = PostgresConfig {
            ssl_mode: SslMode::Disable,
            ..Default::default()
        };
        let driver = PostgresDriver::connect(&config, DriverOptions::default()).unwrap();
        let err = driver
            .commit_transaction(&TransactionHandle::new("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidQuery(_)));
    }
}
