//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! default_datasource = "main"
//!
//! [[datasources]]
//! name = "main"
//! kind = "postgres"
//! [datasources.postgres]
//! url = "postgres://app@localhost/app"
//!
//! [[datasources]]
//! name = "cache"
//! kind = "file"
//! path = "/var/lib/polyql"
//!
//! [objects.users]
//! datasource = "main"
//! indexes = [{ fields = ["email"], unique = true }]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::driver::postgres::PostgresConfig;
use crate::driver::{Driver, DriverOptions, FileDriver, MemoryDriver, PostgresDriver};
use crate::engine::{AnalyzerSettings, ObjectMetadata, StaticMetadata};
use crate::error::PluginError;
use crate::kernel::{DatasourcePlugin, PluginManager, QueryPlugin};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Datasource for objects without a binding. Defaults to the first one.
    pub default_datasource: Option<String>,
    pub datasources: Vec<DatasourceConfig>,
    pub objects: BTreeMap<String, ObjectMetadata>,
    pub analyzer: AnalyzerSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasourceKind {
    Memory,
    File,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub name: String,
    pub kind: DatasourceKind,
    /// Fail updates of missing records instead of returning nothing.
    #[serde(default = "default_strict")]
    pub strict: bool,
    /// Directory holding the object files (`file` only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<PostgresConfig>,
}

fn default_strict() -> bool {
    true
}

impl DatasourceConfig {
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DatasourceKind::Memory,
            strict: true,
            path: None,
            postgres: None,
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            kind: DatasourceKind::File,
            path: Some(path.into()),
            ..Self::memory(name)
        }
    }

    pub fn build_driver(&self) -> Result<Arc<dyn Driver>> {
        let options = DriverOptions {
            strict: self.strict,
        };
        let driver: Arc<dyn Driver> = match self.kind {
            DatasourceKind::Memory => Arc::new(MemoryDriver::with_options(options)),
            DatasourceKind::File => {
                let path = self.path.as_ref().with_context(|| {
                    format!("datasource '{}' (file) needs a path", self.name)
                })?;
                Arc::new(FileDriver::new(path.clone(), options))
            }
            DatasourceKind::Postgres => {
                let config = self.postgres.clone().unwrap_or_default();
                Arc::new(PostgresDriver::connect(&config, options).with_context(|| {
                    format!("Failed to set up datasource '{}'", self.name)
                })?)
            }
        };
        Ok(driver)
    }
}

impl EngineConfig {
    /// `<config dir>/polyql/engine.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("polyql")
            .join("engine.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// The default config file, or an in-memory setup when there is none.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            return Ok(Self::in_memory());
        }
        Self::load(&path)
    }

    /// A single memory datasource named `memory`.
    pub fn in_memory() -> Self {
        Self {
            datasources: vec![DatasourceConfig::memory("memory")],
            ..Default::default()
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn metadata(&self) -> StaticMetadata {
        StaticMetadata::from_objects(self.objects.clone())
    }

    /// A kernel with a datasource plugin per configured datasource plus the
    /// query plugin, not yet booted.
    pub fn kernel(&self) -> Result<PluginManager, PluginError> {
        let mut kernel = PluginManager::new(self.clone());
        let mut query = QueryPlugin::new()
            .with_metadata(Arc::new(self.metadata()))
            .with_analyzer(self.analyzer);
        if let Some(name) = &self.default_datasource {
            query = query.with_default_datasource(name.clone());
        }
        for datasource in &self.datasources {
            query = query.after_datasource(&datasource.name);
            kernel.register(Arc::new(DatasourcePlugin::from_config(datasource.clone())))?;
        }
        kernel.register(Arc::new(query))?;
        Ok(kernel)
    }
}
