//! Flat-file driver: one JSON document per object in a directory.
//!
//! ```text
//! <dir>/users.json   {"next_id": 3, "records": [{"id": "1", ...}, {"id": "2", ...}]}
//! ```
//!
//! Every mutation rewrites the whole file through a temp file and a rename,
//! under a process-local mutex. Concurrent writers in other processes are not
//! coordinated: the last rename wins.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use super::aggregate::{aggregate, distinct_values};
use super::eval::matches;
use super::memory::infer_fields;
use super::record::{merge_update, prepare_create, record_id, validate_object_name};
use super::scan::apply;
use super::{
    AggregateDriver, BulkDriver, Driver, DriverContext, DriverOptions, DriverQuery, ObjectSchema,
    SchemaIntrospector,
};
use crate::ast::{FilterArray, Record, ID_FIELD};
use crate::error::{EngineError, EngineResult};

const EXTENSION: &str = "json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct ObjectFile {
    #[serde(default)]
    next_id: u64,
    #[serde(default)]
    records: Vec<Record>,
}

impl ObjectFile {
    fn position(&self, id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.get(ID_FIELD).and_then(Value::as_str) == Some(id))
    }

    /// Next free counter value. Ids already stored and ids in `reserved`
    /// are skipped.
    fn allocate_id(&mut self, reserved: &HashSet<String>) -> String {
        loop {
            self.next_id += 1;
            let candidate = self.next_id.to_string();
            if self.position(&candidate).is_none() && !reserved.contains(&candidate) {
                return candidate;
            }
        }
    }
}

pub struct FileDriver {
    dir: PathBuf,
    options: DriverOptions,
    write_lock: Mutex<()>,
}

impl FileDriver {
    pub fn new(dir: impl Into<PathBuf>, options: DriverOptions) -> Self {
        Self {
            dir: dir.into(),
            options,
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, object: &str) -> EngineResult<PathBuf> {
        validate_object_name(object)?;
        Ok(self.dir.join(format!("{object}.{EXTENSION}")))
    }

    async fn load(&self, object: &str, operation: &'static str) -> EngineResult<ObjectFile> {
        let path = self.path_for(object)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ObjectFile::default()),
            Err(e) => {
                return Err(EngineError::driver(
                    object,
                    operation,
                    anyhow::Error::new(e).context(format!("reading {}", path.display())),
                ))
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", path.display()))
            .map_err(|e| EngineError::driver(object, operation, e))
    }

    async fn store(
        &self,
        object: &str,
        operation: &'static str,
        file: &ObjectFile,
    ) -> EngineResult<()> {
        let path = self.path_for(object)?;
        let write = async {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .with_context(|| format!("creating {}", self.dir.display()))?;
            let data = serde_json::to_vec_pretty(file)?;
            let tmp = path.with_extension(format!("{EXTENSION}.tmp"));
            tokio::fs::write(&tmp, data)
                .await
                .with_context(|| format!("writing {}", tmp.display()))?;
            tokio::fs::rename(&tmp, &path)
                .await
                .with_context(|| format!("replacing {}", path.display()))?;
            anyhow::Ok(())
        };
        write
            .await
            .map_err(|e| EngineError::driver(object, operation, e))?;
        debug!(object, records = file.records.len(), "file written");
        Ok(())
    }

    async fn object_names(&self) -> EngineResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::driver("*", "introspect", e)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::driver("*", "introspect", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if validate_object_name(stem).is_ok() {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl Driver for FileDriver {
    fn name(&self) -> &str {
        "file"
    }

    async fn find(
        &self,
        object: &str,
        query: &DriverQuery,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let file = self.load(object, "find").await?;
        debug!(object, candidates = file.records.len(), "file scan");
        Ok(apply(file.records, query))
    }

    async fn find_one(
        &self,
        object: &str,
        id: &str,
        _ctx: &DriverContext,
    ) -> EngineResult<Option<Record>> {
        let mut file = self.load(object, "find_one").await?;
        Ok(file.position(id).map(|i| file.records.swap_remove(i)))
    }

    async fn create(
        &self,
        object: &str,
        data: Record,
        _ctx: &DriverContext,
    ) -> EngineResult<Record> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(object, "create").await?;
        let (id, record) = prepare_create(object, data, || file.allocate_id(&HashSet::new()))?;
        if file.position(&id).is_some() {
            return Err(EngineError::duplicate_key(object, id));
        }
        file.records.push(record.clone());
        self.store(object, "create", &file).await?;
        Ok(record)
    }

    async fn update(
        &self,
        object: &str,
        id: &str,
        data: Record,
        _ctx: &DriverContext,
    ) -> EngineResult<Option<Record>> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(object, "update").await?;
        let Some(index) = file.position(id) else {
            return if self.options.strict {
                Err(EngineError::not_found(object, id))
            } else {
                Ok(None)
            };
        };
        merge_update(&mut file.records[index], data);
        let updated = file.records[index].clone();
        self.store(object, "update", &file).await?;
        Ok(Some(updated))
    }

    async fn delete(&self, object: &str, id: &str, _ctx: &DriverContext) -> EngineResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(object, "delete").await?;
        let Some(index) = file.position(id) else {
            return Ok(false);
        };
        file.records.remove(index);
        self.store(object, "delete", &file).await?;
        Ok(true)
    }

    async fn count(
        &self,
        object: &str,
        filters: &FilterArray,
        _ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let file = self.load(object, "count").await?;
        Ok(file.records.iter().filter(|r| matches(filters, r)).count() as u64)
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
impl AggregateDriver for FileDriver {
    async fn aggregate(
        &self,
        object: &str,
        query: &DriverQuery,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let file = self.load(object, "aggregate").await?;
        Ok(aggregate(file.records, query))
    }

    async fn distinct(
        &self,
        object: &str,
        field: &str,
        filters: &FilterArray,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Value>> {
        let file = self.load(object, "distinct").await?;
        Ok(distinct_values(
            file.records.iter().filter(|r| matches(filters, r)),
            field,
        ))
    }
}

#[async_trait]
impl BulkDriver for FileDriver {
    /// One file rewrite for the whole batch; nothing is written on a
    /// duplicate id. Generated ids never collide with ids supplied anywhere
    /// in the batch.
    async fn create_many(
        &self,
        object: &str,
        records: Vec<Record>,
        _ctx: &DriverContext,
    ) -> EngineResult<Vec<Record>> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(object, "create_many").await?;
        let supplied: HashSet<String> = records.iter().filter_map(record_id).collect();
        let start = file.records.len();
        for data in records {
            let (id, record) = prepare_create(object, data, || file.allocate_id(&supplied))?;
            if file.position(&id).is_some() {
                return Err(EngineError::duplicate_key(object, id));
            }
            file.records.push(record);
        }
        let created = file.records[start..].to_vec();
        self.store(object, "create_many", &file).await?;
        Ok(created)
    }

    async fn update_many(
        &self,
        object: &str,
        filters: &FilterArray,
        data: Record,
        _ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(object, "update_many").await?;
        let mut affected = 0;
        for record in file.records.iter_mut().filter(|r| matches(filters, r)) {
            merge_update(record, data.clone());
            affected += 1;
        }
        if affected > 0 {
            self.store(object, "update_many", &file).await?;
        }
        Ok(affected)
    }

    async fn delete_many(
        &self,
        object: &str,
        filters: &FilterArray,
        _ctx: &DriverContext,
    ) -> EngineResult<u64> {
        let _guard = self.write_lock.lock().await;
        let mut file = self.load(object, "delete_many").await?;
        let before = file.records.len();
        file.records.retain(|r| !matches(filters, r));
        let affected = (before - file.records.len()) as u64;
        if affected > 0 {
            self.store(object, "delete_many", &file).await?;
        }
        Ok(affected)
    }
}

#[async_trait]
impl SchemaIntrospector for FileDriver {
    async fn introspect_schema(&self) -> EngineResult<Vec<ObjectSchema>> {
        let mut schemas = Vec::new();
        for name in self.object_names().await? {
            let file = self.load(&name, "introspect").await?;
            schemas.push(ObjectSchema {
                fields: infer_fields(file.records.iter()),
                record_count: file.records.len() as u64,
                name,
            });
        }
        Ok(schemas)
    }
}
