//! Custom handler registry
//!
//! Computed fields name a handler instead of a mirror spec. Handlers are
//! registered by name before the engine is built; the engine checks every
//! handler the schema references against the registry once, at startup.

use async_trait::async_trait;
use denorm_core::{
    DenormalizationTask, EntityId, HandlerError, SchemaError, SnapshotBuilder, SnapshotSchema,
};
use denorm_storage::DocumentStore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Everything a handler may use to perform its refresh.
pub struct HandlerContext<'a> {
    pub task: &'a DenormalizationTask,
    pub documents: &'a dyn DocumentStore,
    pub builder: SnapshotBuilder<'a>,
}

impl HandlerContext<'_> {
    /// Parameters declared on the computed field (or given at enqueue).
    pub fn params(&self) -> &serde_json::Value {
        &self.task.params
    }
}

/// Result of a successful handler run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Ids of documents of the task's model whose computed field changed.
    /// The engine re-notifies them so cascades continue downstream.
    pub touched: Vec<EntityId>,
}

impl HandlerOutcome {
    pub fn touched(ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            touched: ids.into_iter().collect(),
        }
    }
}

/// Target-specific refresh logic for a computed field.
///
/// A handler owns its own mutation, timeout budget and internal error
/// handling. Returning an error leaves the task queued for retry.
#[async_trait]
pub trait CustomHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<HandlerOutcome, HandlerError>;
}

/// Name → handler table, frozen once the engine is built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn CustomHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &names).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a handler.
    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn CustomHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CustomHandler>> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Every handler referenced by `schema` must be registered.
    pub fn validate_against(&self, schema: &SnapshotSchema) -> Result<(), SchemaError> {
        for (handler, referenced_by) in schema.handler_references() {
            if !self.contains(&handler) {
                return Err(SchemaError::UnknownHandler {
                    handler,
                    referenced_by,
                });
            }
        }
        Ok(())
    }
}
