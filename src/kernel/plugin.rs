use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::{InstallContext, PluginContext, RegistryBuilder};
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::{EngineResult, PluginError};

/// Trait that every polyql plugin implements.
///
/// A plugin registers datasources, hooks and services during `install`,
/// which runs exactly once, after every plugin it depends on.
///
/// # Example
///
/// ```ignore
/// struct Audit;
///
/// #[async_trait]
/// impl Plugin for Audit {
///     fn name(&self) -> &str { "audit" }
///     fn version(&self) -> &str { "0.1.0" }
///     fn dependencies(&self) -> Vec<String> { vec!["query".into()] }
///     async fn install(&self, ctx: &mut InstallContext<'_>) -> anyhow::Result<()> {
///         ctx.add_hook(HookPoint::AfterCreate, ObjectScope::All, Arc::new(log_create))?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin identifier.
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Names of plugins that must install first.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    async fn install(&self, ctx: &mut InstallContext<'_>) -> anyhow::Result<()>;

    async fn on_start(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub dependencies: Vec<String>,
}

enum State {
    Registering,
    Running {
        engine: Arc<Engine>,
        order: Vec<Arc<dyn Plugin>>,
    },
    /// An `install` or `on_start` failed; the kernel cannot boot again.
    Failed {
        plugin: String,
    },
    Stopped,
}

/// Owns the registered plugins and drives their lifecycle.
pub struct PluginManager {
    config: EngineConfig,
    plugins: Vec<Arc<dyn Plugin>>,
    state: State,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl PluginManager {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            plugins: Vec::new(),
            state: State::Registering,
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if !matches!(self.state, State::Registering) {
            warn!(plugin = plugin.name(), "plugin registered after boot is ignored");
            return Ok(());
        }
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(PluginError::AlreadyRegistered {
                plugin: plugin.name().to_string(),
            });
        }
        self.plugins.push(plugin);
        Ok(())
    }

    pub fn plugins(&self) -> Vec<PluginInfo> {
        self.plugins
            .iter()
            .map(|p| PluginInfo {
                name: p.name().to_string(),
                version: p.version().to_string(),
                description: p.description().to_string(),
                dependencies: p.dependencies(),
            })
            .collect()
    }

    /// Plugin names in install order.
    pub fn resolve_dependencies(&self) -> Result<Vec<String>, PluginError> {
        Ok(self
            .resolve_order()?
            .into_iter()
            .map(|i| self.plugins[i].name().to_string())
            .collect())
    }

    /// Depth-first topological sort. Roots are visited in registration order
    /// and dependencies in declaration order, so the result is deterministic.
    fn resolve_order(&self) -> Result<Vec<usize>, PluginError> {
        let index: HashMap<&str, usize> = self
            .plugins
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name(), i))
            .collect();
        let deps: Vec<Vec<String>> = self.plugins.iter().map(|p| p.dependencies()).collect();

        let mut walk = Walk {
            names: self.plugins.iter().map(|p| p.name()).collect(),
            index,
            deps,
            marks: vec![Mark::Unvisited; self.plugins.len()],
            stack: Vec::new(),
            order: Vec::with_capacity(self.plugins.len()),
        };
        for i in 0..self.plugins.len() {
            walk.visit(i)?;
        }
        Ok(walk.order)
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        match &self.state {
            State::Running { engine, .. } => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    pub fn is_booted(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Install every plugin in dependency order, freeze the registry and run
    /// `on_start`. Booting a running kernel returns the existing engine.
    ///
    /// A failing `install` or `on_start` leaves the kernel failed: hooks that
    /// already ran are never run again and later boots return
    /// [`PluginError::BootFailed`]. Plugins that had started get `on_stop`,
    /// and drivers registered so far are disconnected.
    pub async fn boot(&mut self) -> EngineResult<Arc<Engine>> {
        match &self.state {
            State::Running { engine, .. } => return Ok(Arc::clone(engine)),
            State::Failed { plugin } => {
                return Err(PluginError::BootFailed {
                    plugin: plugin.clone(),
                }
                .into())
            }
            State::Stopped => return Err(PluginError::ShutDown.into()),
            State::Registering => {}
        }

        let order: Vec<Arc<dyn Plugin>> = self
            .resolve_order()?
            .into_iter()
            .map(|i| Arc::clone(&self.plugins[i]))
            .collect();

        let mut registry = RegistryBuilder::new();
        for plugin in &order {
            let mut ctx = InstallContext::new(plugin.name(), &self.config, &mut registry);
            if let Err(source) = plugin.install(&mut ctx).await {
                self.fail(plugin.name());
                registry.freeze().disconnect().await;
                return Err(PluginError::Install {
                    plugin: plugin.name().to_string(),
                    source,
                }
                .into());
            }
            info!(plugin = plugin.name(), version = plugin.version(), "plugin installed");
        }

        let engine = Arc::new(registry.freeze());
        let ctx = PluginContext {
            engine: Arc::clone(&engine),
        };
        for (started, plugin) in order.iter().enumerate() {
            if let Err(source) = plugin.on_start(&ctx).await {
                self.fail(plugin.name());
                stop_all(&order[..started], &ctx).await;
                engine.disconnect().await;
                return Err(PluginError::Start {
                    plugin: plugin.name().to_string(),
                    source,
                }
                .into());
            }
        }

        info!(plugins = order.len(), "kernel booted");
        self.state = State::Running {
            engine: Arc::clone(&engine),
            order,
        };
        Ok(engine)
    }

    fn fail(&mut self, plugin: &str) {
        warn!(plugin, "kernel boot failed");
        self.state = State::Failed {
            plugin: plugin.to_string(),
        };
    }

    /// Run `on_stop` in reverse install order, then disconnect every driver.
    /// Teardown failures are logged and do not stop the remaining plugins.
    pub async fn shutdown(&mut self) {
        let (engine, order) = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Running { engine, order } => (engine, order),
            other => {
                self.state = other;
                return;
            }
        };

        let ctx = PluginContext {
            engine: Arc::clone(&engine),
        };
        stop_all(&order, &ctx).await;
        engine.disconnect().await;
        info!("kernel shut down");
    }
}

/// `on_stop` in reverse order. Failures are logged and do not stop the rest.
async fn stop_all(plugins: &[Arc<dyn Plugin>], ctx: &PluginContext) {
    for plugin in plugins.iter().rev() {
        if let Err(source) = plugin.on_stop(ctx).await {
            let err = PluginError::Teardown {
                plugin: plugin.name().to_string(),
                source,
            };
            warn!(plugin = plugin.name(), error = %err, "plugin teardown failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

struct Walk<'a> {
    names: Vec<&'a str>,
    index: HashMap<&'a str, usize>,
    deps: Vec<Vec<String>>,
    marks: Vec<Mark>,
    stack: Vec<usize>,
    order: Vec<usize>,
}

impl Walk<'_> {
    fn visit(&mut self, i: usize) -> Result<(), PluginError> {
        match self.marks[i] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = self.stack.iter().position(|&s| s == i).unwrap_or(0);
                let mut cycle: Vec<String> = self.stack[start..]
                    .iter()
                    .map(|&s| self.names[s].to_string())
                    .collect();
                cycle.push(self.names[i].to_string());
                return Err(PluginError::Cycle { cycle });
            }
            Mark::Unvisited => {}
        }

        self.marks[i] = Mark::Visiting;
        self.stack.push(i);
        for d in 0..self.deps[i].len() {
            let dependency = &self.deps[i][d];
            let Some(&j) = self.index.get(dependency.as_str()) else {
                return Err(PluginError::MissingDependency {
                    plugin: self.names[i].to_string(),
                    dependency: dependency.clone(),
                });
            };
            self.visit(j)?;
        }
        self.stack.pop();
        self.marks[i] = Mark::Done;
        self.order.push(i);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::error::EngineError;
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: String,
        deps: Vec<String>,
        journal: Journal,
        fail_install: bool,
        fail_start: bool,
        fail_stop: bool,
    }

    impl Recorder {
        fn new(name: &str, deps: &[&str], journal: &Journal) -> Self {
            Self {
                name: name.into(),
                deps: deps.iter().map(|d| d.to_string()).collect(),
                journal: Arc::clone(journal),
                fail_install: false,
                fail_start: false,
                fail_stop: false,
            }
        }

        fn log(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{event}:{}", self.name));
        }
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn dependencies(&self) -> Vec<String> {
            self.deps.clone()
        }
        async fn install(&self, ctx: &mut InstallContext<'_>) -> anyhow::Result<()> {
            self.log("install");
            if self.fail_install {
                anyhow::bail!("boom");
            }
            ctx.register_datasource(self.name.clone(), Arc::new(MemoryDriver::new()))?;
            Ok(())
        }
        async fn on_start(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.log("start");
            if self.fail_start {
                anyhow::bail!("no");
            }
            Ok(())
        }
        async fn on_stop(&self, _ctx: &PluginContext) -> anyhow::Result<()> {
            self.log("stop");
            if self.fail_stop {
                anyhow::bail!("stuck");
            }
            Ok(())
        }
    }

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_registration_order_breaks_ties() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("c", &["a"], &j))).unwrap();
        kernel.register(Arc::new(Recorder::new("b", &[], &j))).unwrap();
        kernel.register(Arc::new(Recorder::new("a", &[], &j))).unwrap();
        assert_eq!(kernel.resolve_dependencies().unwrap(), ["a", "c", "b"]);
    }

    #[test]
    fn test_duplicate_rejected() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("a", &[], &j))).unwrap();
        let err = kernel
            .register(Arc::new(Recorder::new("a", &[], &j)))
            .unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered { plugin } if plugin == "a"));
    }

    #[test]
    fn test_missing_dependency_named() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("B", &["A"], &j))).unwrap();
        let err = kernel.resolve_dependencies().unwrap_err();
        assert!(matches!(
            err,
            PluginError::MissingDependency { plugin, dependency } if plugin == "B" && dependency == "A"
        ));
    }

    #[test]
    fn test_cycle_names_every_member() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("x", &[], &j))).unwrap();
        kernel.register(Arc::new(Recorder::new("a", &["b"], &j))).unwrap();
        kernel.register(Arc::new(Recorder::new("b", &["c"], &j))).unwrap();
        kernel.register(Arc::new(Recorder::new("c", &["a"], &j))).unwrap();
        match kernel.resolve_dependencies().unwrap_err() {
            PluginError::Cycle { cycle } => assert_eq!(cycle, ["a", "b", "c", "a"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_order() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("b", &["a"], &j))).unwrap();
        kernel.register(Arc::new(Recorder::new("a", &[], &j))).unwrap();

        let engine = kernel.boot().await.unwrap();
        assert_eq!(engine.datasources().names().count(), 2);
        // Second boot is a no-op.
        let again = kernel.boot().await.unwrap();
        assert!(Arc::ptr_eq(&engine, &again));

        // Late registrations are inert.
        kernel.register(Arc::new(Recorder::new("late", &[], &j))).unwrap();
        assert_eq!(kernel.plugins().len(), 2);

        kernel.shutdown().await;
        assert!(!kernel.is_booted());
        assert_eq!(
            *j.lock().unwrap(),
            [
                "install:a", "install:b", "start:a", "start:b", "stop:b", "stop:a"
            ]
        );
    }

    #[tokio::test]
    async fn test_install_failure_names_plugin() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("a", &[], &j))).unwrap();
        let mut bad = Recorder::new("bad", &["a"], &j);
        bad.fail_install = true;
        kernel.register(Arc::new(bad)).unwrap();

        let err = kernel.boot().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Plugin(PluginError::Install { ref plugin, .. }) if plugin == "bad"
        ));
        assert!(kernel.engine().is_none());
        assert_eq!(*j.lock().unwrap(), ["install:a", "install:bad"]);

        // Nothing installs twice.
        let err = kernel.boot().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Plugin(PluginError::BootFailed { ref plugin }) if plugin == "bad"
        ));
        assert_eq!(*j.lock().unwrap(), ["install:a", "install:bad"]);
    }

    #[tokio::test]
    async fn test_start_failure_stops_started_plugins() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("a", &[], &j))).unwrap();
        let mut bad = Recorder::new("bad", &["a"], &j);
        bad.fail_start = true;
        kernel.register(Arc::new(bad)).unwrap();
        kernel.register(Arc::new(Recorder::new("c", &["bad"], &j))).unwrap();

        let err = kernel.boot().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Plugin(PluginError::Start { ref plugin, .. }) if plugin == "bad"
        ));
        assert!(!kernel.is_booted());
        assert!(kernel.boot().await.is_err());
        kernel.shutdown().await;
        assert_eq!(
            *j.lock().unwrap(),
            ["install:a", "install:bad", "install:c", "start:a", "start:bad", "stop:a"]
        );
    }

    #[tokio::test]
    async fn test_boot_after_shutdown_is_a_plugin_error() {
        let j = journal();
        let mut kernel = PluginManager::default();
        kernel.register(Arc::new(Recorder::new("a", &[], &j))).unwrap();
        kernel.boot().await.unwrap();
        kernel.shutdown().await;

        let err = kernel.boot().await.unwrap_err();
        assert!(matches!(err, EngineError::Plugin(PluginError::ShutDown)));
        assert_eq!(err.code(), "PLUGIN_ERROR");
        assert_eq!(
            *j.lock().unwrap(),
            ["install:a", "start:a", "stop:a"]
        );
    }

    #[tokio::test]
    async fn test_teardown_failures_are_swallowed() {
        let j = journal();
        let mut kernel = PluginManager::default();
        let mut first = Recorder::new("first", &[], &j);
        first.fail_stop = true;
        kernel.register(Arc::new(first)).unwrap();
        kernel.register(Arc::new(Recorder::new("second", &[], &j))).unwrap();
        kernel.boot().await.unwrap();
        kernel.shutdown().await;
        let log = j.lock().unwrap();
        assert_eq!(&log[log.len() - 2..], ["stop:second", "stop:first"]);
    }
}
