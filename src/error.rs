//! Error taxonomy shared by every layer of the engine.
//!
//! Drivers, services and the kernel all return [`EngineError`]. Plugin lifecycle
//! failures are grouped under [`PluginError`] and filter problems under
//! [`TranslationError`]; both convert into `EngineError` with `?`.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type EngineResult<T> = Result<T, EngineError>;

/// Unsupported filter shapes, operators, or malformed wire arrays.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("unknown filter operator '{0}'")]
    UnknownOperator(String),

    #[error("operator '{0}' cannot be negated")]
    NotNegatable(String),

    #[error("malformed filter: {0}")]
    Malformed(String),
}

/// Registration, dependency resolution, boot and teardown failures.
/// Every variant names the offending plugin(s).
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin '{plugin}' is already registered")]
    AlreadyRegistered { plugin: String },

    #[error("plugin '{plugin}' depends on '{dependency}', which is not registered")]
    MissingDependency { plugin: String, dependency: String },

    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    #[error("plugin '{plugin}' failed to install: {source}")]
    Install {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin '{plugin}' failed to start: {source}")]
    Start {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("plugin '{plugin}' failed to stop: {source}")]
    Teardown {
        plugin: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("kernel cannot boot: an earlier boot failed at plugin '{plugin}'")]
    BootFailed { plugin: String },

    #[error("kernel has been shut down")]
    ShutDown,
}

impl PluginError {
    /// Name of the plugin this error is about. For cycles, the first member;
    /// empty for [`PluginError::ShutDown`].
    pub fn plugin(&self) -> &str {
        match self {
            PluginError::AlreadyRegistered { plugin }
            | PluginError::MissingDependency { plugin, .. }
            | PluginError::Install { plugin, .. }
            | PluginError::Start { plugin, .. }
            | PluginError::Teardown { plugin, .. }
            | PluginError::BootFailed { plugin } => plugin,
            PluginError::Cycle { cycle } => cycle.first().map(String::as_str).unwrap_or(""),
            PluginError::ShutDown => "",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Translation(#[from] TranslationError),

    #[error("{object} record '{id}' not found")]
    NotFound { object: String, id: String },

    #[error("{object} record '{id}' already exists")]
    DuplicateKey { object: String, id: String },

    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("{operation} on '{object}' failed: {source}")]
    Driver {
        object: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("datasource '{datasource}' does not support {capability}")]
    Unsupported {
        datasource: String,
        capability: &'static str,
    },

    #[error("datasource '{0}' is not registered")]
    UnknownDatasource(String),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("service '{0}' is not available; was its plugin installed?")]
    ServiceUnavailable(&'static str),

    #[error("{hook} handler rejected '{object}': {message}")]
    Hook {
        hook: String,
        object: String,
        message: String,
    },
}

impl EngineError {
    /// Wrap a backend failure with the object and operation it happened in.
    pub fn driver(
        object: impl Into<String>,
        operation: &'static str,
        source: impl Into<anyhow::Error>,
    ) -> Self {
        EngineError::Driver {
            object: object.into(),
            operation,
            source: source.into(),
        }
    }

    pub fn not_found(object: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            object: object.into(),
            id: id.into(),
        }
    }

    pub fn duplicate_key(object: impl Into<String>, id: impl Into<String>) -> Self {
        EngineError::DuplicateKey {
            object: object.into(),
            id: id.into(),
        }
    }

    /// Short machine-readable code for transport layers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Translation(_) => "TRANSLATION_ERROR",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::DuplicateKey { .. } => "DUPLICATE_KEY",
            EngineError::Plugin(_) => "PLUGIN_ERROR",
            EngineError::Driver { .. } => "DRIVER_ERROR",
            EngineError::Unsupported { .. } => "UNSUPPORTED",
            EngineError::UnknownDatasource(_) => "UNKNOWN_DATASOURCE",
            EngineError::InvalidQuery(_) => "INVALID_QUERY",
            EngineError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            EngineError::Hook { .. } => "HOOK_REJECTED",
        }
    }
}
