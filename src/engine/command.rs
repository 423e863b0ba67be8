//! Command service: runs canonical mutations against the bound datasource.
//!
//! Bulk commands use the driver's [`BulkDriver`](crate::driver::BulkDriver)
//! when it has one. Otherwise they fall back to one call per record, which is
//! not atomic: a failure part-way leaves the earlier records mutated.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use super::datasource::{Datasource, DatasourceRegistry};
use super::metadata::MetadataProvider;
use crate::ast::{Command, CommandKind, CommandResult, FilterArray, Record};
use crate::driver::record::record_id;
use crate::driver::{DriverContext, DriverQuery, TransactionHandle};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub transaction: Option<TransactionHandle>,
    /// Caller identity, handed to hooks.
    pub user: Option<String>,
}

impl CommandOptions {
    pub fn context(&self) -> DriverContext {
        DriverContext {
            transaction: self.transaction.clone(),
        }
    }
}

pub struct CommandService {
    datasources: Arc<DatasourceRegistry>,
    metadata: Arc<dyn MetadataProvider>,
}

impl CommandService {
    pub fn new(datasources: Arc<DatasourceRegistry>, metadata: Arc<dyn MetadataProvider>) -> Self {
        Self {
            datasources,
            metadata,
        }
    }

    pub async fn execute(
        &self,
        command: &Command,
        options: &CommandOptions,
    ) -> EngineResult<CommandResult> {
        if command.object.trim().is_empty() {
            return Err(EngineError::InvalidQuery(
                "command object must not be empty".to_string(),
            ));
        }
        let bound = self.metadata.datasource_for(&command.object);
        let datasource = self.datasources.resolve(bound.as_deref())?;
        let ctx = options.context();
        let object = command.object.as_str();

        let result = match command.kind {
            CommandKind::Create => {
                let data = required(command.data.clone(), command, "data")?;
                let created = datasource.driver().create(object, data, &ctx).await?;
                CommandResult::ok(Some(Value::Object(created)), 1)
            }
            CommandKind::Update => {
                let id = required(command.id.as_deref(), command, "id")?;
                let data = required(command.data.clone(), command, "data")?;
                match datasource.driver().update(object, id, data, &ctx).await? {
                    Some(updated) => CommandResult::ok(Some(Value::Object(updated)), 1),
                    None => CommandResult::ok(None, 0),
                }
            }
            CommandKind::Delete => {
                let id = required(command.id.as_deref(), command, "id")?;
                let deleted = datasource.driver().delete(object, id, &ctx).await?;
                CommandResult::ok(Some(Value::Bool(deleted)), u64::from(deleted))
            }
            CommandKind::BulkCreate => {
                let records = required(command.records.clone(), command, "records")?;
                let created = bulk_create(datasource, object, records, &ctx).await?;
                let affected = created.len() as u64;
                CommandResult::ok(
                    Some(Value::Array(created.into_iter().map(Value::Object).collect())),
                    affected,
                )
            }
            CommandKind::BulkUpdate => {
                let data = required(command.data.clone(), command, "data")?;
                let filters = command.filters.clone().unwrap_or_default();
                let affected = bulk_update(datasource, object, &filters, data, &ctx).await?;
                CommandResult::ok(None, affected)
            }
            CommandKind::BulkDelete => {
                let filters = command.filters.clone().unwrap_or_default();
                let affected = bulk_delete(datasource, object, &filters, &ctx).await?;
                CommandResult::ok(None, affected)
            }
        };

        debug!(
            object,
            datasource = datasource.name(),
            command = command.kind.as_str(),
            affected = result.affected,
            "command executed"
        );
        Ok(result)
    }
}

fn required<T>(value: Option<T>, command: &Command, what: &str) -> EngineResult<T> {
    value.ok_or_else(|| {
        EngineError::InvalidQuery(format!(
            "{} on '{}' requires {what}",
            command.kind.as_str(),
            command.object
        ))
    })
}

async fn bulk_create(
    datasource: &Datasource,
    object: &str,
    records: Vec<Record>,
    ctx: &DriverContext,
) -> EngineResult<Vec<Record>> {
    if let Some(bulk) = datasource.bulk() {
        return bulk.create_many(object, records, ctx).await;
    }
    let mut created = Vec::with_capacity(records.len());
    for record in records {
        created.push(datasource.driver().create(object, record, ctx).await?);
    }
    Ok(created)
}

/// Ids of every record matching `filters`, for the per-record fallback.
async fn matching_ids(
    datasource: &Datasource,
    object: &str,
    filters: &FilterArray,
    ctx: &DriverContext,
) -> EngineResult<Vec<String>> {
    let query = DriverQuery::filtered(filters.clone());
    let records = datasource.driver().find(object, &query, ctx).await?;
    Ok(records.iter().filter_map(record_id).collect())
}

async fn bulk_update(
    datasource: &Datasource,
    object: &str,
    filters: &FilterArray,
    data: Record,
    ctx: &DriverContext,
) -> EngineResult<u64> {
    if let Some(bulk) = datasource.bulk() {
        return bulk.update_many(object, filters, data, ctx).await;
    }
    let mut affected = 0;
    for id in matching_ids(datasource, object, filters, ctx).await? {
        if datasource
            .driver()
            .update(object, &id, data.clone(), ctx)
            .await?
            .is_some()
        {
            affected += 1;
        }
    }
    Ok(affected)
}

async fn bulk_delete(
    datasource: &Datasource,
    object: &str,
    filters: &FilterArray,
    ctx: &DriverContext,
) -> EngineResult<u64> {
    if let Some(bulk) = datasource.bulk() {
        return bulk.delete_many(object, filters, ctx).await;
    }
    let mut affected = 0;
    for id in matching_ids(datasource, object, filters, ctx).await? {
        if datasource.driver().delete(object, &id, ctx).await? {
            affected += 1;
        }
    }
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Condition, Operator};
    use crate::driver::{Driver, MemoryDriver};
    use crate::engine::metadata::StaticMetadata;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    /// Memory driver with its bulk capability hidden, to exercise the
    /// per-record fallback. Counts how often the capability is asked for.
    #[derive(Default)]
    struct NoBulk {
        inner: MemoryDriver,
        bulk_lookups: AtomicUsize,
    }

    #[async_trait]
    impl Driver for NoBulk {
        fn name(&self) -> &str {
            "no-bulk"
        }
        async fn find(
            &self,
            object: &str,
            query: &DriverQuery,
            ctx: &DriverContext,
        ) -> EngineResult<Vec<Record>> {
            self.inner.find(object, query, ctx).await
        }
        async fn find_one(
            &self,
            object: &str,
            id: &str,
            ctx: &DriverContext,
        ) -> EngineResult<Option<Record>> {
            self.inner.find_one(object, id, ctx).await
        }
        async fn create(
            &self,
            object: &str,
            data: Record,
            ctx: &DriverContext,
        ) -> EngineResult<Record> {
            self.inner.create(object, data, ctx).await
        }
        async fn update(
            &self,
            object: &str,
            id: &str,
            data: Record,
            ctx: &DriverContext,
        ) -> EngineResult<Option<Record>> {
            self.inner.update(object, id, data, ctx).await
        }
        async fn delete(&self, object: &str, id: &str, ctx: &DriverContext) -> EngineResult<bool> {
            self.inner.delete(object, id, ctx).await
        }
        async fn count(
            &self,
            object: &str,
            filters: &FilterArray,
            ctx: &DriverContext,
        ) -> EngineResult<u64> {
            self.inner.count(object, filters, ctx).await
        }
        fn bulk(&self) -> Option<&dyn crate::driver::BulkDriver> {
            self.bulk_lookups.fetch_add(1, AtomicOrdering::SeqCst);
            None
        }
    }

    fn service(driver: Arc<dyn Driver>) -> CommandService {
        let mut registry = DatasourceRegistry::new();
        registry.insert(Datasource::new("main", driver)).unwrap();
        CommandService::new(Arc::new(registry), Arc::new(StaticMetadata::new()))
    }

    fn open_tasks() -> FilterArray {
        FilterArray::single(Condition::new("done", Operator::Eq, false))
    }

    async fn seed(service: &CommandService) {
        let records = vec![
            record(json!({"title": "a", "done": false})),
            record(json!({"title": "b", "done": true})),
            record(json!({"title": "c", "done": false})),
        ];
        let result = service
            .execute(&Command::bulk_create("tasks", records), &CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(result.affected, 3);
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let service = service(Arc::new(MemoryDriver::new()));
        let options = CommandOptions::default();
        let created = service
            .execute(&Command::create("tasks", record(json!({"title": "x"}))), &options)
            .await
            .unwrap();
        assert!(created.success);
        let id = created.data.unwrap()["id"].as_str().unwrap().to_string();

        let updated = service
            .execute(
                &Command::update("tasks", id.clone(), record(json!({"done": true}))),
                &options,
            )
            .await
            .unwrap();
        assert_eq!(updated.affected, 1);
        assert_eq!(updated.data.unwrap()["done"], true);

        let first = service
            .execute(&Command::delete("tasks", id.clone()), &options)
            .await
            .unwrap();
        let second = service
            .execute(&Command::delete("tasks", id), &options)
            .await
            .unwrap();
        assert_eq!((first.affected, second.affected), (1, 0));
        assert_eq!(second.data, Some(Value::Bool(false)));
    }

    #[tokio::test]
    async fn test_missing_payload_is_invalid() {
        let service = service(Arc::new(MemoryDriver::new()));
        let mut command = Command::delete("tasks", "1");
        command.id = None;
        let err = service
            .execute(&command, &CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_QUERY");
        assert!(err.to_string().contains("requires id"));
    }

    #[tokio::test]
    async fn test_bulk_counts_native_and_fallback() {
        for driver in [
            Arc::new(MemoryDriver::new()) as Arc<dyn Driver>,
            Arc::new(NoBulk::default()),
        ] {
            let service = service(driver);
            seed(&service).await;
            let options = CommandOptions::default();
            let updated = service
                .execute(
                    &Command::bulk_update("tasks", open_tasks(), record(json!({"owner": "kim"}))),
                    &options,
                )
                .await
                .unwrap();
            assert_eq!(updated.affected, 2);

            let deleted = service
                .execute(&Command::bulk_delete("tasks", open_tasks()), &options)
                .await
                .unwrap();
            assert_eq!(deleted.affected, 2);

            let again = service
                .execute(&Command::bulk_delete("tasks", open_tasks()), &options)
                .await
                .unwrap();
            assert_eq!(again.affected, 0);
        }
    }

    #[tokio::test]
    async fn test_bulk_capability_detected_once() {
        let driver = Arc::new(NoBulk::default());
        let service = service(Arc::clone(&driver) as Arc<dyn Driver>);
        assert_eq!(driver.bulk_lookups.load(AtomicOrdering::SeqCst), 1);

        seed(&service).await;
        let options = CommandOptions::default();
        service
            .execute(&Command::bulk_delete("tasks", open_tasks()), &options)
            .await
            .unwrap();
        assert_eq!(driver.bulk_lookups.load(AtomicOrdering::SeqCst), 1);
    }
}
