/// Plugin kernel: lifecycle, dependency ordering and registration.
///
/// ```text
/// register(plugin)*  ─►  resolve order  ─►  install (RegistryBuilder)
///                                              │ freeze
///                                              ▼
///                   on_start(PluginContext { engine: Arc<Engine> })
///                                              │
///                   shutdown: on_stop in reverse, then disconnect drivers
/// ```
///
/// Plugins only ever see a mutable registry while they install. Once every
/// plugin has installed, the builder is frozen into an immutable [`Engine`]
/// that is shared through `Arc`.
pub mod builtin;
pub mod hooks;
pub mod plugin;

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::driver::Driver;
use crate::engine::{
    AnalyzerSettings, Datasource, DatasourceRegistry, Engine, MetadataProvider, StaticMetadata,
};
use crate::error::EngineResult;

pub use builtin::{DatasourcePlugin, QueryPlugin};
pub use hooks::{
    HookContext, HookHandler, HookPayload, HookPoint, HookRegistry, HookStage, ObjectScope,
};
pub use plugin::{Plugin, PluginInfo, PluginManager};

/// Registrations collected while plugins install.
#[derive(Default)]
pub struct RegistryBuilder {
    datasources: DatasourceRegistry,
    default_datasource: Option<String>,
    metadata: Option<Arc<dyn MetadataProvider>>,
    hooks: HookRegistry,
    query_service: bool,
    analyzer: Option<AnalyzerSettings>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freeze everything registered so far into an engine.
    pub fn freeze(self) -> Engine {
        let mut datasources = self.datasources;
        if let Some(name) = self.default_datasource {
            datasources.set_default(name);
        }
        let metadata = self
            .metadata
            .unwrap_or_else(|| Arc::new(StaticMetadata::new()));
        Engine::new(
            datasources,
            metadata,
            self.hooks,
            self.query_service,
            self.analyzer,
        )
    }
}

/// What a plugin can touch during `install`.
pub struct InstallContext<'a> {
    plugin: &'a str,
    config: &'a EngineConfig,
    registry: &'a mut RegistryBuilder,
}

impl<'a> InstallContext<'a> {
    pub fn new(plugin: &'a str, config: &'a EngineConfig, registry: &'a mut RegistryBuilder) -> Self {
        Self {
            plugin,
            config,
            registry,
        }
    }

    /// Name of the plugin being installed.
    pub fn plugin(&self) -> &str {
        self.plugin
    }

    pub fn config(&self) -> &EngineConfig {
        self.config
    }

    /// Register a named datasource. Capabilities are detected here, once.
    pub fn register_datasource(
        &mut self,
        name: impl Into<String>,
        driver: Arc<dyn Driver>,
    ) -> EngineResult<()> {
        self.registry
            .datasources
            .insert(Datasource::new(name, driver))
    }

    pub fn set_default_datasource(&mut self, name: impl Into<String>) {
        self.registry.default_datasource = Some(name.into());
    }

    pub fn set_metadata(&mut self, metadata: Arc<dyn MetadataProvider>) {
        self.registry.metadata = Some(metadata);
    }

    pub fn add_hook(
        &mut self,
        point: HookPoint,
        scope: ObjectScope,
        handler: Arc<dyn HookHandler>,
    ) -> EngineResult<()> {
        self.registry.hooks.register(point, scope, handler)
    }

    pub fn enable_query_service(&mut self) {
        self.registry.query_service = true;
    }

    pub fn enable_analyzer(&mut self, settings: AnalyzerSettings) {
        self.registry.analyzer = Some(settings);
    }
}

/// What a plugin sees in `on_start` / `on_stop`.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub engine: Arc<Engine>,
}
