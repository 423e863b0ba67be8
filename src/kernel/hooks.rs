//! Hook registry and the sequential waterfall that runs it.
//!
//! Handlers are registered for a `(HookPoint, ObjectScope)` pair. At a given
//! point every handler whose scope matches the object runs, in registration
//! order, each receiving the previous handler's output.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::ast::{Command, CommandResult, QueryAst};
use crate::engine::QueryResult;
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    BeforeFind,
    AfterFind,
    BeforeCount,
    AfterCount,
    BeforeAggregate,
    AfterAggregate,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeQuery,
    AfterQuery,
    BeforeMutation,
    AfterMutation,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeFind => "beforeFind",
            HookPoint::AfterFind => "afterFind",
            HookPoint::BeforeCount => "beforeCount",
            HookPoint::AfterCount => "afterCount",
            HookPoint::BeforeAggregate => "beforeAggregate",
            HookPoint::AfterAggregate => "afterAggregate",
            HookPoint::BeforeCreate => "beforeCreate",
            HookPoint::AfterCreate => "afterCreate",
            HookPoint::BeforeUpdate => "beforeUpdate",
            HookPoint::AfterUpdate => "afterUpdate",
            HookPoint::BeforeDelete => "beforeDelete",
            HookPoint::AfterDelete => "afterDelete",
        }
    }

    pub fn stage(&self) -> HookStage {
        match self {
            HookPoint::BeforeFind | HookPoint::BeforeCount | HookPoint::BeforeAggregate => {
                HookStage::BeforeQuery
            }
            HookPoint::AfterFind | HookPoint::AfterCount | HookPoint::AfterAggregate => {
                HookStage::AfterQuery
            }
            HookPoint::BeforeCreate | HookPoint::BeforeUpdate | HookPoint::BeforeDelete => {
                HookStage::BeforeMutation
            }
            HookPoint::AfterCreate | HookPoint::AfterUpdate | HookPoint::AfterDelete => {
                HookStage::AfterMutation
            }
        }
    }

    /// Whether `payload` is the kind of value that flows through this point.
    fn accepts(&self, payload: &HookPayload) -> bool {
        match (self, payload) {
            (HookPoint::BeforeCount, HookPayload::Query(_))
            | (HookPoint::AfterCount, HookPayload::Count(_)) => true,
            (HookPoint::BeforeCount | HookPoint::AfterCount, _) => false,
            _ => matches!(
                (self.stage(), payload),
                (HookStage::BeforeQuery, HookPayload::Query(_))
                    | (HookStage::AfterQuery, HookPayload::Results(_))
                    | (HookStage::BeforeMutation, HookPayload::Command(_))
                    | (HookStage::AfterMutation, HookPayload::CommandResult(_))
            ),
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which objects a handler applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ObjectScope {
    All,
    Object(String),
}

impl ObjectScope {
    pub fn object(name: impl Into<String>) -> Self {
        ObjectScope::Object(name.into())
    }

    pub fn matches(&self, object: &str) -> bool {
        match self {
            ObjectScope::All => true,
            ObjectScope::Object(name) => name == object,
        }
    }
}

/// Value threaded through a hook chain.
#[derive(Debug, Clone, PartialEq)]
pub enum HookPayload {
    Query(QueryAst),
    Results(QueryResult),
    Count(u64),
    Command(Command),
    CommandResult(CommandResult),
}

impl HookPayload {
    fn kind(&self) -> &'static str {
        match self {
            HookPayload::Query(_) => "query",
            HookPayload::Results(_) => "results",
            HookPayload::Count(_) => "count",
            HookPayload::Command(_) => "command",
            HookPayload::CommandResult(_) => "command result",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HookContext {
    pub point: HookPoint,
    pub object: String,
    pub user: Option<String>,
}

impl HookContext {
    /// Error for a handler that refuses the operation.
    pub fn reject(&self, message: impl Into<String>) -> EngineError {
        EngineError::Hook {
            hook: self.point.to_string(),
            object: self.object.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, ctx: &HookContext, payload: HookPayload) -> EngineResult<HookPayload>;
}

#[async_trait]
impl<F, Fut> HookHandler for F
where
    F: Fn(HookContext, HookPayload) -> Fut + Send + Sync,
    Fut: Future<Output = EngineResult<HookPayload>> + Send + 'static,
{
    async fn handle(&self, ctx: &HookContext, payload: HookPayload) -> EngineResult<HookPayload> {
        (self)(ctx.clone(), payload).await
    }
}

#[derive(Clone)]
struct Registration {
    scope: ObjectScope,
    handler: Arc<dyn HookHandler>,
}

/// Handlers keyed by hook point, each list in registration order.
#[derive(Clone, Default)]
pub struct HookRegistry {
    handlers: HashMap<HookPoint, Vec<Registration>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        point: HookPoint,
        scope: ObjectScope,
        handler: Arc<dyn HookHandler>,
    ) -> EngineResult<()> {
        if let ObjectScope::Object(name) = &scope {
            if name.trim().is_empty() {
                return Err(EngineError::InvalidQuery(format!(
                    "{point} hook registered for an empty object name"
                )));
            }
        }
        self.handlers
            .entry(point)
            .or_default()
            .push(Registration { scope, handler });
        Ok(())
    }

    pub fn handler_count(&self, point: HookPoint) -> usize {
        self.handlers.get(&point).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.values().all(Vec::is_empty)
    }

    /// Run every handler matching `ctx.object` at `ctx.point`. The first
    /// error stops the chain and is returned as is.
    pub async fn run(&self, ctx: &HookContext, mut payload: HookPayload) -> EngineResult<HookPayload> {
        let Some(registrations) = self.handlers.get(&ctx.point) else {
            return Ok(payload);
        };
        for registration in registrations {
            if !registration.scope.matches(&ctx.object) {
                continue;
            }
            payload = registration.handler.handle(ctx, payload).await?;
            if !ctx.point.accepts(&payload) {
                return Err(ctx.reject(format!(
                    "handler returned a {} payload",
                    payload.kind()
                )));
            }
        }
        debug!(hook = %ctx.point, object = %ctx.object, "hooks ran");
        Ok(payload)
    }

    /// [`run`](Self::run) for a typed value.
    pub async fn waterfall<T: HookValue + Send>(&self, ctx: &HookContext, value: T) -> EngineResult<T> {
        let payload = self.run(ctx, value.into_payload()).await?;
        T::from_payload(payload)
            .map_err(|other| ctx.reject(format!("handler returned a {} payload", other.kind())))
    }
}

/// Values that can travel through a hook chain.
pub trait HookValue: Sized {
    fn into_payload(self) -> HookPayload;

    fn from_payload(payload: HookPayload) -> Result<Self, HookPayload>;
}

macro_rules! hook_value {
    ($ty:ty, $variant:ident) => {
        impl HookValue for $ty {
            fn into_payload(self) -> HookPayload {
                HookPayload::$variant(self)
            }

            fn from_payload(payload: HookPayload) -> Result<Self, HookPayload> {
                match payload {
                    HookPayload::$variant(value) => Ok(value),
                    other => Err(other),
                }
            }
        }
    };
}

hook_value!(QueryAst, Query);
hook_value!(QueryResult, Results);
hook_value!(u64, Count);
hook_value!(Command, Command);
hook_value!(CommandResult, CommandResult);

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<_> = self.handlers.iter().map(|(p, h)| (*p, h.len())).collect();
        counts.sort();
        f.debug_struct("HookRegistry").field("handlers", &counts).finish()
    }
}
