use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::driver::{
    AggregateDriver, BulkDriver, Driver, DriverCapabilities, SchemaIntrospector,
    TransactionalDriver,
};
use crate::error::{EngineError, EngineResult};

/// A named driver with its capabilities, detected once on registration.
pub struct Datasource {
    name: String,
    driver: Arc<dyn Driver>,
    capabilities: DriverCapabilities,
}

impl Datasource {
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        let capabilities = DriverCapabilities::detect(driver.as_ref());
        Self {
            name: name.into(),
            driver,
            capabilities,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn unsupported(&self, capability: &'static str) -> EngineError {
        EngineError::Unsupported {
            datasource: self.name.clone(),
            capability,
        }
    }

    pub fn aggregation(&self) -> EngineResult<&dyn AggregateDriver> {
        self.driver
            .aggregation()
            .filter(|_| self.capabilities.aggregate)
            .ok_or_else(|| self.unsupported("aggregate"))
    }

    /// Native bulk operations, when the driver offered them at registration.
    /// Without them callers fall back to per-record calls.
    pub fn bulk(&self) -> Option<&dyn BulkDriver> {
        if self.capabilities.bulk {
            self.driver.bulk()
        } else {
            None
        }
    }

    pub fn transactions(&self) -> EngineResult<&dyn TransactionalDriver> {
        self.driver
            .transactions()
            .filter(|_| self.capabilities.transactions)
            .ok_or_else(|| self.unsupported("transactions"))
    }

    pub fn introspection(&self) -> EngineResult<&dyn SchemaIntrospector> {
        self.driver
            .introspection()
            .filter(|_| self.capabilities.introspection)
            .ok_or_else(|| self.unsupported("introspection"))
    }
}

impl std::fmt::Debug for Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datasource")
            .field("name", &self.name)
            .field("driver", &self.driver.name())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Named datasources plus the default used for unbound objects.
#[derive(Debug, Default)]
pub struct DatasourceRegistry {
    sources: BTreeMap<String, Arc<Datasource>>,
    default: Option<String>,
}

impl DatasourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a datasource. The first one registered becomes the default
    /// until another is chosen explicitly.
    pub fn insert(&mut self, datasource: Datasource) -> EngineResult<()> {
        let name = datasource.name().to_string();
        if self.sources.contains_key(&name) {
            return Err(EngineError::InvalidQuery(format!(
                "datasource '{name}' is already registered"
            )));
        }
        info!(datasource = %name, driver = datasource.driver().name(), capabilities = ?datasource.capabilities(), "datasource registered");
        self.default.get_or_insert_with(|| name.clone());
        self.sources.insert(name, Arc::new(datasource));
        Ok(())
    }

    pub fn set_default(&mut self, name: impl Into<String>) {
        self.default = Some(name.into());
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn get(&self, name: &str) -> EngineResult<&Arc<Datasource>> {
        self.sources
            .get(name)
            .ok_or_else(|| EngineError::UnknownDatasource(name.to_string()))
    }

    /// The named datasource, or the default when `name` is `None`.
    pub fn resolve(&self, name: Option<&str>) -> EngineResult<&Arc<Datasource>> {
        match name.or(self.default.as_deref()) {
            Some(name) => self.get(name),
            None => Err(EngineError::UnknownDatasource(
                "no datasource bound and no default configured".to_string(),
            )),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Disconnect every driver that holds a connection. Failures are logged.
    pub async fn disconnect_all(&self) {
        for source in self.sources.values() {
            if !source.capabilities().disconnect {
                continue;
            }
            if let Err(e) = source.driver().disconnect().await {
                warn!(datasource = source.name(), error = %e, "disconnect failed");
            }
        }
    }
}
