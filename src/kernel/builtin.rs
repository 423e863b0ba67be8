//! Plugins shipped with the engine.

use std::sync::Arc;

use async_trait::async_trait;

use super::plugin::Plugin;
use super::InstallContext;
use crate::config::DatasourceConfig;
use crate::driver::Driver;
use crate::engine::{AnalyzerSettings, MetadataProvider};

/// Name of the plugin that registers datasource `name`.
pub fn datasource_plugin_name(name: &str) -> String {
    format!("datasource:{name}")
}

enum DriverSource {
    Ready(Arc<dyn Driver>),
    Configured(DatasourceConfig),
}

/// Registers one named datasource.
pub struct DatasourcePlugin {
    datasource: String,
    plugin_name: String,
    source: DriverSource,
}

impl DatasourcePlugin {
    pub fn new(datasource: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        let datasource = datasource.into();
        Self {
            plugin_name: datasource_plugin_name(&datasource),
            datasource,
            source: DriverSource::Ready(driver),
        }
    }

    /// The driver is built from `config` when the plugin installs.
    pub fn from_config(config: DatasourceConfig) -> Self {
        Self {
            plugin_name: datasource_plugin_name(&config.name),
            datasource: config.name.clone(),
            source: DriverSource::Configured(config),
        }
    }
}

#[async_trait]
impl Plugin for DatasourcePlugin {
    fn name(&self) -> &str {
        &self.plugin_name
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Registers a named datasource"
    }

    async fn install(&self, ctx: &mut InstallContext<'_>) -> anyhow::Result<()> {
        let driver = match &self.source {
            DriverSource::Ready(driver) => Arc::clone(driver),
            DriverSource::Configured(config) => config.build_driver()?,
        };
        ctx.register_datasource(self.datasource.clone(), driver)?;
        Ok(())
    }
}

/// Installs the query service and the analyzer.
pub struct QueryPlugin {
    dependencies: Vec<String>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    default_datasource: Option<String>,
    analyzer: AnalyzerSettings,
}

impl Default for QueryPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryPlugin {
    pub const NAME: &'static str = "query";

    pub fn new() -> Self {
        Self {
            dependencies: Vec::new(),
            metadata: None,
            default_datasource: None,
            analyzer: AnalyzerSettings::default(),
        }
    }

    /// Install after the plugin registering `datasource`.
    pub fn after_datasource(mut self, datasource: &str) -> Self {
        self.dependencies.push(datasource_plugin_name(datasource));
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_default_datasource(mut self, name: impl Into<String>) -> Self {
        self.default_datasource = Some(name.into());
        self
    }

    pub fn with_analyzer(mut self, settings: AnalyzerSettings) -> Self {
        self.analyzer = settings;
        self
    }
}

#[async_trait]
impl Plugin for QueryPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Query service and analyzer"
    }

    fn dependencies(&self) -> Vec<String> {
        self.dependencies.clone()
    }

    async fn install(&self, ctx: &mut InstallContext<'_>) -> anyhow::Result<()> {
        ctx.enable_query_service();
        ctx.enable_analyzer(self.analyzer);
        if let Some(metadata) = &self.metadata {
            ctx.set_metadata(Arc::clone(metadata));
        }
        if let Some(name) = &self.default_datasource {
            ctx.set_default_datasource(name.clone());
        }
        Ok(())
    }
}
