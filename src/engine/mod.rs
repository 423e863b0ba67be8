//! The frozen service registry produced by booting the kernel.
//!
//! ```text
//! caller ─► Engine ─► before hooks ─► Query / Command service ─► Driver
//!                  ◄─ after hooks  ◄──────────────┘
//! ```
//!
//! An [`Engine`] is immutable once built. Everything it holds (datasources,
//! metadata, hooks, services) was registered while plugins were installing.

pub mod analyzer;
pub mod command;
pub mod datasource;
pub mod metadata;
pub mod query_service;

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::ast::{translate_opt, Command, CommandKind, CommandResult, FilterNode, QueryAst};
use crate::driver::{ObjectSchema, TransactionHandle};
use crate::error::{EngineError, EngineResult};
use crate::kernel::hooks::{HookContext, HookPoint, HookRegistry};

pub use analyzer::{AnalyzerSettings, CostClass, PlanStep, QueryAnalyzer, QueryPlan};
pub use command::{CommandOptions, CommandService};
pub use datasource::{Datasource, DatasourceRegistry};
pub use metadata::{IndexDefinition, MetadataProvider, ObjectMetadata, StaticMetadata};
pub use query_service::{QueryOptions, QueryProfile, QueryResult, QueryService};

pub struct Engine {
    datasources: Arc<DatasourceRegistry>,
    hooks: HookRegistry,
    queries: Option<QueryService>,
    analyzer: Option<QueryAnalyzer>,
    commands: CommandService,
}

impl Engine {
    /// Assemble an engine. `analyzer` is only honoured together with the
    /// query service, since it reads the profiles the service records.
    pub fn new(
        datasources: DatasourceRegistry,
        metadata: Arc<dyn MetadataProvider>,
        hooks: HookRegistry,
        query_service: bool,
        analyzer: Option<AnalyzerSettings>,
    ) -> Self {
        let datasources = Arc::new(datasources);
        let queries = query_service
            .then(|| QueryService::new(Arc::clone(&datasources), Arc::clone(&metadata)));
        let analyzer = analyzer
            .filter(|_| query_service)
            .map(|settings| QueryAnalyzer::new(Arc::clone(&metadata), settings));
        let commands = CommandService::new(Arc::clone(&datasources), metadata);
        Self {
            datasources,
            hooks,
            queries,
            analyzer,
            commands,
        }
    }

    fn queries(&self) -> EngineResult<&QueryService> {
        self.queries
            .as_ref()
            .ok_or(EngineError::ServiceUnavailable("query"))
    }

    pub fn datasources(&self) -> &DatasourceRegistry {
        &self.datasources
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Run a read through the before/after query hooks.
    pub async fn query(&self, ast: QueryAst, options: &QueryOptions) -> EngineResult<QueryResult> {
        let service = self.queries()?;
        let (before, after) = if ast.is_aggregate() {
            (HookPoint::BeforeAggregate, HookPoint::AfterAggregate)
        } else {
            (HookPoint::BeforeFind, HookPoint::AfterFind)
        };
        let ast = self
            .hooks
            .waterfall(&hook_context(before, &ast.object, &options.user), ast)
            .await?;
        let result = service.execute(&ast, options).await?;
        self.hooks
            .waterfall(&hook_context(after, &ast.object, &options.user), result)
            .await
    }

    pub async fn count(
        &self,
        object: &str,
        filter: Option<FilterNode>,
        options: &QueryOptions,
    ) -> EngineResult<u64> {
        let service = self.queries()?;
        let mut ast = QueryAst::new(object);
        ast.filter = filter;
        let ast = self
            .hooks
            .waterfall(&hook_context(HookPoint::BeforeCount, object, &options.user), ast)
            .await?;
        let count = service
            .count(&ast.object, ast.filter.as_ref(), options)
            .await?;
        self.hooks
            .waterfall(
                &hook_context(HookPoint::AfterCount, &ast.object, &options.user),
                count,
            )
            .await
    }

    /// Distinct non-null values of `field`. Requires the aggregate capability.
    pub async fn distinct(
        &self,
        object: &str,
        field: &str,
        filter: Option<&FilterNode>,
        options: &QueryOptions,
    ) -> EngineResult<Vec<Value>> {
        let datasource = self.queries()?.datasource_for(object)?;
        let filters = translate_opt(filter)?;
        datasource
            .aggregation()?
            .distinct(object, field, &filters, &options.context())
            .await
    }

    /// Run a mutation through the before/after mutation hooks.
    pub async fn execute(
        &self,
        command: Command,
        options: &CommandOptions,
    ) -> EngineResult<CommandResult> {
        let (before, after) = match command.kind {
            CommandKind::Create | CommandKind::BulkCreate => {
                (HookPoint::BeforeCreate, HookPoint::AfterCreate)
            }
            CommandKind::Update | CommandKind::BulkUpdate => {
                (HookPoint::BeforeUpdate, HookPoint::AfterUpdate)
            }
            CommandKind::Delete | CommandKind::BulkDelete => {
                (HookPoint::BeforeDelete, HookPoint::AfterDelete)
            }
        };
        let command = self
            .hooks
            .waterfall(&hook_context(before, &command.object, &options.user), command)
            .await?;
        let result = self.commands.execute(&command, options).await?;
        self.hooks
            .waterfall(&hook_context(after, &command.object, &options.user), result)
            .await
    }

    /// [`execute`](Self::execute), with failures folded into the result.
    pub async fn dispatch(&self, command: Command, options: &CommandOptions) -> CommandResult {
        let kind = command.kind;
        let object = command.object.clone();
        match self.execute(command, options).await {
            Ok(result) => result,
            Err(e) => {
                debug!(object = %object, command = kind.as_str(), error = %e, "command failed");
                CommandResult::failure(&e)
            }
        }
    }

    /// Advisory plan for `ast`, informed by the profiles recorded so far.
    pub fn explain(&self, ast: &QueryAst) -> EngineResult<QueryPlan> {
        let analyzer = self
            .analyzer
            .as_ref()
            .ok_or(EngineError::ServiceUnavailable("analyzer"))?;
        let profiles = self.queries()?.recent_profiles(&ast.object);
        analyzer.analyze(ast, &profiles)
    }

    pub async fn begin_transaction(&self, datasource: Option<&str>) -> EngineResult<TransactionHandle> {
        self.datasources
            .resolve(datasource)?
            .transactions()?
            .begin_transaction()
            .await
    }

    pub async fn commit_transaction(
        &self,
        datasource: Option<&str>,
        handle: &TransactionHandle,
    ) -> EngineResult<()> {
        self.datasources
            .resolve(datasource)?
            .transactions()?
            .commit_transaction(handle)
            .await
    }

    pub async fn rollback_transaction(
        &self,
        datasource: Option<&str>,
        handle: &TransactionHandle,
    ) -> EngineResult<()> {
        self.datasources
            .resolve(datasource)?
            .transactions()?
            .rollback_transaction(handle)
            .await
    }

    pub async fn introspect(&self, datasource: Option<&str>) -> EngineResult<Vec<ObjectSchema>> {
        self.datasources
            .resolve(datasource)?
            .introspection()?
            .introspect_schema()
            .await
    }

    pub async fn disconnect(&self) {
        self.datasources.disconnect_all().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("datasources", &self.datasources)
            .field("hooks", &self.hooks)
            .field("query_service", &self.queries.is_some())
            .field("analyzer", &self.analyzer.is_some())
            .finish()
    }
}

fn hook_context(point: HookPoint, object: &str, user: &Option<String>) -> HookContext {
    HookContext {
        point,
        object: object.to_string(),
        user: user.clone(),
    }
}
