//! In-memory scan-and-filter driver.
//!
//! Records live in one `BTreeMap` per object behind a tokio `RwLock`. Safe
//! for concurrent use within one process; nothing is shared across processes.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use super::aggregate::{aggregate, distinct_values};
use super::eval::matches;
use super::record::{generate_id, merge_update, prepare_create, record_id};
use super::scan::apply;
use super::{
    AggregateDriver, BulkDriver, Driver, DriverContext, DriverOptions, DriverQuery, FieldSchema,
    ObjectSchema, SchemaIntrospector,
};
use crate::ast::{FilterArray, Record};
use crate::error::{EngineError, EngineResult};

type Table = BTreeMap<String, Record>;

#[derive(Default)]
pub struct MemoryDriver {
    options: DriverOptions,
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: DriverOptions) -> Self {
        Self {
            options,
            tables: RwLock::default(),
        }
    }

    /// Seed an object with records as-is (ids must be present).
    pub async fn load(&self, object: &str, records: Vec<Record>) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(object.to_string()).or_default();
        for record in records {
            let id = record_id(&record).ok_or_else(|| {
                EngineError::InvalidQuery(format!("{object}: seeded record without id"))
            })?;
            table.insert(id, record);
        }
        Ok(())
    }

    async fn snapshot(&self, object: &str) -> Vec<Record> {
        self.tables
            .read()
            .await
            .get(object)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    async fn find(
        &self,
        object: &str,
        query: &DriverQuery,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let candidates = self.snapshot(object).await;
        debug!(object, candidates = candidates.len(), "memory scan");
        Ok(apply(candidates, query))
    }

    async fn find_one(
        &self,
        object: &str,
        id: &str,
        _ctx: &DriverContext,
    ) -> EngineResult<Option<Record>> {
        Ok(self
            .tables
            .read()
            .await
            .get(object)
            .and_then(|t| t.get(id))
            .cloned())
    }

    async fn create(
        &self,
        object: &str,
        data: Record,
        _ctx: &DriverContext,
    ) -> EngineResult<Record> {
        let (id, record) = prepare_create(object, data, generate_id)?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(object.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(EngineError::duplicate_key(object, id));
        }
        table.insert(id, record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        object: &str,
        id: &str,
        data: Record,
        _ctx: &DriverContext,
    ) -> EngineResult<Option<Record>> {
        let mut tables = self.tables.write().await;
        match tables.get_mut(object).and_then(|t| t.get_mut(id)) {
            Some(existing) => {
                merge_update(existing, data);
                Ok(Some(existing.clone()))
            }
            None if self.options.strict => Err(EngineError::not_found(object, id)),
            None => Ok(None),
        }
    }

    async fn delete(&self, object: &str, id: &str, _ctx: &DriverContext) -> EngineResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .get_mut(object)
            .map(|t| t.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn count(
        &self,
        object: &str,
        filters: &FilterArray,
        _ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(object)
            .map(|t| t.values().filter(|r| matches(filters, r)).count() as u64)
            .unwrap_or(0))
    }

    fn aggregation(&self) -> Option<&dyn AggregateDriver> {
        Some(self)
    }

    fn bulk(&self) -> Option<&dyn BulkDriver> {
        Some(self)
    }

    fn introspection(&self) -> Option<&dyn SchemaIntrospector> {
        Some(self)
    }
}

#[async_trait]
impl AggregateDriver for MemoryDriver {
    async fn aggregate(
        &self,
        object: &str,
        query: &DriverQuery,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        Ok(aggregate(self.snapshot(object).await, query))
    }

    async fn distinct(
        &self,
        object: &str,
        field: &str,
        filters: &FilterArray,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Value>> {
        let tables = self.tables.read().await;
        Ok(tables
            .get(object)
            .map(|t| distinct_values(t.values().filter(|r| matches(filters, r)), field))
            .unwrap_or_default())
    }
}

#[async_trait]
impl BulkDriver for MemoryDriver {
    /// All-or-nothing: every id is checked before anything is inserted.
    async fn create_many(
        &self,
        object: &str,
        records: Vec<Record>,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let prepared = records
            .into_iter()
            .map(|r| prepare_create(object, r, generate_id))
            .collect::<EngineResult<Vec<_>>>()?;

        let mut tables = self.tables.write().await;
        let table = tables.entry(object.to_string()).or_default();
        {
            let mut batch = HashSet::new();
            for (id, _) in &prepared {
                if table.contains_key(id) || !batch.insert(id.as_str()) {
                    return Err(EngineError::duplicate_key(object, id.as_str()));
                }
            }
        }
        Ok(prepared
            .into_iter()
            .map(|(id, record)| {
                table.insert(id, record.clone());
                record
            })
            .collect())
    }

    async fn update_many(
        &self,
        object: &str,
        filters: &FilterArray,
        data: Record,
        _ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(object) else {
            return Ok(0);
        };
        let mut affected = 0;
        for record in table.values_mut().filter(|r| matches(filters, r)) {
            merge_update(record, data.clone());
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete_many(
        &self,
        object: &str,
        filters: &FilterArray,
        _ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(object) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|_, r| !matches(filters, r));
        Ok((before - table.len()) as u64)
    }
}

#[async_trait]
impl SchemaIntrospector for MemoryDriver {
    async fn introspect_schema(&self) -> EngineResult<Vec<ObjectSchema>> {
        let tables = self.tables.read().await;
        let mut schemas: Vec<ObjectSchema> = tables
            .iter()
            .map(|(name, table)| ObjectSchema {
                name: name.clone(),
                fields: infer_fields(table.values()),
                record_count: table.len() as u64,
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(schemas)
    }
}

/// Field names with the JSON type observed across records.
pub(crate) fn infer_fields<'a>(records: impl Iterator<Item = &'a Record>) -> Vec<FieldSchema> {
    let mut kinds = FieldKinds::default();
    for record in records {
        for (name, value) in record {
            kinds.observe(name, json_kind(value));
        }
    }
    kinds.finish()
}

/// Accumulates the observed type per field: `null` gives way to any other
/// type, and two different non-null types make the field "mixed".
#[derive(Debug, Default)]
pub(crate) struct FieldKinds(BTreeMap<String, String>);

impl FieldKinds {
    pub(crate) fn observe(&mut self, name: &str, kind: &str) {
        match self.0.get_mut(name) {
            Some(current) if current != kind && kind != "null" => {
                *current = if current == "null" { kind } else { "mixed" }.to_string();
            }
            Some(_) => {}
            None => {
                self.0.insert(name.to_string(), kind.to_string());
            }
        }
    }

    pub(crate) fn finish(self) -> Vec<FieldSchema> {
        self.0
            .into_iter()
            .map(|(name, kind)| FieldSchema { name, kind })
            .collect()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
