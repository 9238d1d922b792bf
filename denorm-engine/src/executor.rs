//! Task executor
//!
//! Runs one claimed task. The default path refreshes an embedded mirror
//! field from the current state of its source; the handler path hands the
//! task to a registered [`CustomHandler`](crate::CustomHandler).
//!
//! # Default path
//!
//! 1. Find targets: documents of the task's model where any of the task's id
//!    paths equals its `object_id`.
//! 2. Group targets by the source id embedded directly in their mirror
//!    field. For a direct dependent that is `object_id` itself; for a
//!    transitive one it is the intermediate document that embeds it.
//! 3. Load each source once and hydrate the relations its mirror spec nests,
//!    reading related documents by the ids they are referenced with.
//! 4. Build the mirror from the hydrated source and write it to every target
//!    whose stored value differs. A missing source writes `null`.
//! 5. Report the rewritten target ids; the engine schedules the
//!    handler-maintained fields those documents feed.

use crate::registry::{HandlerContext, HandlerOutcome, HandlerRegistry};
use denorm_core::{
    document_id, id_value, reference_id, DenormResult, DenormalizationTask, Document, EntityId,
    Filter, FieldKind, MirrorSource, MirrorSpec, SnapshotBuilder, SnapshotSchema, TaskError,
    ID_FIELD,
};
use denorm_storage::DocumentStore;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// What one execution did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Target documents located for the task
    pub targets: usize,
    /// Targets whose field was rewritten
    pub written: Vec<EntityId>,
    /// Targets whose field was nulled because the source is gone
    pub nulled: usize,
    /// Present when a custom handler ran
    pub handler: Option<HandlerOutcome>,
}

// ============================================================================
// HYDRATED SOURCE
// ============================================================================

/// A stored source document with the relations its mirror spec nests,
/// loaded fresh from the document store.
#[derive(Debug, Clone)]
struct LoadedSource {
    id: EntityId,
    fields: BTreeMap<String, Value>,
    related: BTreeMap<String, LoadedSource>,
}

impl MirrorSource for LoadedSource {
    fn source_id(&self) -> EntityId {
        self.id
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn related(&self, name: &str) -> Option<&dyn MirrorSource> {
        self.related.get(name).map(|r| r as &dyn MirrorSource)
    }
}

type HydrateFuture<'a> = Pin<Box<dyn Future<Output = DenormResult<LoadedSource>> + Send + 'a>>;

// ============================================================================
// EXECUTOR
// ============================================================================

pub struct TaskExecutor {
    schema: Arc<SnapshotSchema>,
    documents: Arc<dyn DocumentStore>,
    registry: Arc<HandlerRegistry>,
}

impl TaskExecutor {
    pub fn new(
        schema: Arc<SnapshotSchema>,
        documents: Arc<dyn DocumentStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            schema,
            documents,
            registry,
        }
    }

    /// Execute a task. Re-running an applied task writes nothing.
    pub async fn execute(&self, task: &DenormalizationTask) -> DenormResult<ExecutionOutcome> {
        match &task.handler {
            Some(handler) => self.run_handler(handler, task).await,
            None => self.refresh_mirror(task).await,
        }
    }

    async fn run_handler(
        &self,
        name: &str,
        task: &DenormalizationTask,
    ) -> DenormResult<ExecutionOutcome> {
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| TaskError::UnknownHandler {
                handler: name.to_string(),
            })?;
        let ctx = HandlerContext {
            task,
            documents: self.documents.as_ref(),
            builder: SnapshotBuilder::new(&self.schema),
        };
        let outcome = handler
            .handle(ctx)
            .await
            .map_err(|e| TaskError::HandlerFailed {
                handler: name.to_string(),
                key: task.key.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ExecutionOutcome {
            handler: Some(outcome),
            ..ExecutionOutcome::default()
        })
    }

    async fn refresh_mirror(&self, task: &DenormalizationTask) -> DenormResult<ExecutionOutcome> {
        let key = &task.key;
        let spec = self.schema.mirror_spec_for(&key.model, &key.field)?;

        let paths = if task.id_paths.is_empty() {
            vec![format!("{}.{}", key.field, ID_FIELD)]
        } else {
            task.id_paths.clone()
        };
        let filter = Filter::any_path_eq(paths, id_value(key.object_id));
        let targets = self.documents.find_by_filter(&key.model, &filter).await?;

        let mut outcome = ExecutionOutcome {
            targets: targets.len(),
            ..ExecutionOutcome::default()
        };
        if targets.is_empty() {
            return Ok(outcome);
        }

        let mut groups: BTreeMap<EntityId, Vec<Document>> = BTreeMap::new();
        for target in targets {
            match target.get(&key.field).and_then(reference_id) {
                Some(source_id) => groups.entry(source_id).or_default().push(target),
                None => tracing::debug!(
                    model = %key.model,
                    field = %key.field,
                    "Target has no direct source reference, skipping"
                ),
            }
        }

        let builder = SnapshotBuilder::new(&self.schema);
        for (source_id, targets) in groups {
            let value = match self.documents.get_by_id(&spec.source_type, source_id).await? {
                Some(record) => {
                    let source = self.hydrate(spec, source_id, record).await?;
                    builder.from_instance(&spec.mirror_type, &source)?
                }
                None => {
                    tracing::info!(
                        model = %key.model,
                        field = %key.field,
                        source_type = %spec.source_type,
                        source_id = %source_id,
                        targets = targets.len(),
                        "Source not found, nulling mirrors"
                    );
                    Value::Null
                }
            };

            for target in targets {
                if target.get(&key.field) == Some(&value) {
                    continue;
                }
                let Some(target_id) = document_id(&target) else {
                    continue;
                };
                let mut fields = Document::new();
                fields.insert(key.field.clone(), value.clone());
                self.documents
                    .update_fields_by_id(&key.model, target_id, fields)
                    .await
                    .map_err(|e| TaskError::TargetWriteFailed {
                        model: key.model.clone(),
                        id: target_id,
                        reason: e.to_string(),
                    })?;
                outcome.written.push(target_id);
                if value.is_null() {
                    outcome.nulled += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Load the relations `spec` nests into a source record, recursively.
    fn hydrate<'a>(&'a self, spec: &'a MirrorSpec, id: EntityId, record: Document) -> HydrateFuture<'a> {
        Box::pin(async move {
            let mut source = LoadedSource {
                id,
                fields: BTreeMap::new(),
                related: BTreeMap::new(),
            };
            for field in &spec.fields {
                let raw = field.record_keys().find_map(|k| record.get(k));
                match &field.kind {
                    FieldKind::Scalar => {
                        if let Some(value) = raw {
                            source.fields.insert(field.source.clone(), value.clone());
                        }
                    }
                    FieldKind::Nested(mirror_type) => {
                        let Some(related_id) = raw.and_then(reference_id) else {
                            continue;
                        };
                        let Some(nested) = self.schema.mirror(mirror_type) else {
                            continue;
                        };
                        let Some(related) = self
                            .documents
                            .get_by_id(&nested.source_type, related_id)
                            .await?
                        else {
                            continue;
                        };
                        let loaded = self.hydrate(nested, related_id, related).await?;
                        source.related.insert(field.source.clone(), loaded);
                    }
                }
            }
            Ok(source)
        })
    }
}
