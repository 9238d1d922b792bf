//! Cascade scheduling.
//!
//! Given a changed source `(type, id)`, computes every dependent type that
//! must be refreshed, transitively, each type exactly once, together with a
//! declarative locator for the affected documents.
//!
//! # Locators
//!
//! A locator is a dotted path through embedded mirrors ending at the changed
//! source's id. A direct dependent is located by `<field>.id`. A transitive
//! dependent is located through the nested mirror that carries the changed
//! source, e.g. a statement embedding an invoice that embeds a tenant:
//! `invoice.tenant.id`. A dependent whose mirrors never embed the changed
//! source's identity cannot hold data derived from it and is not emitted.
//!
//! # Relation chains
//!
//! Internally each reached type carries the relation chains that lead from
//! it back to the changed source (`["invoice", "tenant"]`). A chain on type
//! `D` is `[f] + c` where `f` is a mirror field of `D` and `c` a chain of the
//! mirror's source type. Turning a chain into a document path walks the
//! mirror specs: every relation must be carried by a nested mirror field.
//!
//! # Computed fields
//!
//! A computed field is keyed by the id of the document that feeds it. For
//! the changed type that id is known up front; for a type the cascade
//! rewrites, [`CascadeScheduler::computed_dependents`] is asked again per
//! rewritten document.

use crate::error::SchemaError;
use crate::graph::DependencyGraph;
use crate::schema::{ContainerField, MirrorSpec, SnapshotSchema};
use crate::task::{DenormalizationTask, TaskKey};
use crate::{EntityId, ID_FIELD};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// How to find, and what to refresh in, one field of an affected type.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLocator {
    pub field: String,
    /// Dotted paths that equal the changed source id in affected documents.
    /// Empty for handler-maintained fields, whose handler resolves targets.
    pub id_paths: Vec<String>,
    pub handler: Option<String>,
    pub params: Value,
}

/// One affected dependent type with locators for its affected fields.
#[derive(Debug, Clone, PartialEq)]
pub struct AffectedDependent {
    pub model: String,
    pub object_id: EntityId,
    pub fields: Vec<FieldLocator>,
}

impl AffectedDependent {
    /// One task per affected field.
    pub fn tasks(&self) -> impl Iterator<Item = DenormalizationTask> + '_ {
        self.fields.iter().map(move |locator| {
            let key = TaskKey::new(&self.model, &locator.field, self.object_id);
            let task = DenormalizationTask::new(key).with_id_paths(locator.id_paths.iter().cloned());
            match &locator.handler {
                Some(handler) => task.with_handler(handler.clone(), locator.params.clone()),
                None => task,
            }
        })
    }
}

/// Walks the dependency graph for a changed source.
#[derive(Debug, Clone)]
pub struct CascadeScheduler {
    schema: Arc<SnapshotSchema>,
    graph: DependencyGraph,
    order: Vec<String>,
}

impl CascadeScheduler {
    /// Build the graph from the schema; fails on cycles.
    pub fn new(schema: Arc<SnapshotSchema>) -> Result<Self, SchemaError> {
        let graph = DependencyGraph::from_schema(&schema)?;
        let order = graph.topological_order()?;
        Ok(Self {
            schema,
            graph,
            order,
        })
    }

    pub fn schema(&self) -> &Arc<SnapshotSchema> {
        &self.schema
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Deduplicated set of affected dependents for a changed source.
    ///
    /// `changed_fields`, when given and non-empty, prunes locators whose
    /// terminal mirror (the one copying the changed source) reads none of the
    /// changed fields. Handler-maintained fields are never pruned. Passing
    /// `None` always yields the full, safe refresh set.
    pub fn compute_affected(
        &self,
        source_type: &str,
        source_id: EntityId,
        changed_fields: Option<&[String]>,
    ) -> Vec<AffectedDependent> {
        let changed = changed_fields.filter(|c| !c.is_empty());
        let reached: BTreeSet<String> = self.graph.reachable_from(source_type).into_iter().collect();
        if reached.is_empty() {
            return Vec::new();
        }

        let mut chains: BTreeMap<&str, Vec<Vec<String>>> = BTreeMap::new();
        chains.insert(source_type, vec![Vec::new()]);
        let mut affected = Vec::new();

        // Topological order guarantees every upstream chain is known before
        // a type is processed, however many paths lead to it.
        for model_name in self.order.iter().filter(|t| reached.contains(*t)) {
            let Some(model) = self.schema.model(model_name) else {
                continue;
            };
            let mut own_chains = Vec::new();
            let mut fields = Vec::new();

            for field in &model.fields {
                match field {
                    ContainerField::Mirror { name, mirror_type } => {
                        let Some(spec) = self.schema.mirror(mirror_type) else {
                            continue;
                        };
                        let Some(upstream) = chains.get(spec.source_type.as_str()) else {
                            continue;
                        };
                        let mut id_paths = Vec::new();
                        for chain in upstream {
                            let Some((path, terminal)) = self.mirror_path(spec, chain) else {
                                continue;
                            };
                            let mut extended = Vec::with_capacity(chain.len() + 1);
                            extended.push(name.clone());
                            extended.extend(chain.iter().cloned());
                            own_chains.push(extended);

                            if let Some(changed) = changed {
                                if !terminal.observes_any(changed) {
                                    continue;
                                }
                            }
                            let full = format!("{}.{}", name, path);
                            if !id_paths.contains(&full) {
                                id_paths.push(full);
                            }
                        }
                        if !id_paths.is_empty() {
                            fields.push(FieldLocator {
                                field: name.clone(),
                                id_paths,
                                handler: None,
                                params: Value::Null,
                            });
                        }
                    }
                    ContainerField::Computed { .. } => {
                        fields.extend(computed_locator(field, source_type));
                    }
                }
            }

            if !own_chains.is_empty() {
                chains.insert(model_name.as_str(), own_chains);
            }
            if !fields.is_empty() {
                affected.push(AffectedDependent {
                    model: model_name.clone(),
                    object_id: source_id,
                    fields,
                });
            }
        }

        affected
    }

    /// Handler-maintained fields fed directly by one changed document.
    ///
    /// `compute_affected` schedules computed fields of the changed type
    /// only. A document the default path rewrites further down a cascade is
    /// known by id only once its refresh has run, so the engine calls this
    /// for each rewritten document to schedule the computed fields it feeds.
    pub fn computed_dependents(&self, source_type: &str, source_id: EntityId) -> Vec<AffectedDependent> {
        self.graph
            .dependents_of(source_type)
            .filter_map(|model_name| {
                let model = self.schema.model(model_name)?;
                let fields: Vec<FieldLocator> = model
                    .fields
                    .iter()
                    .filter_map(|f| computed_locator(f, source_type))
                    .collect();
                (!fields.is_empty()).then(|| AffectedDependent {
                    model: model_name.to_string(),
                    object_id: source_id,
                    fields,
                })
            })
            .collect()
    }

    /// Document path inside a `spec` mirror that holds the id at the end of
    /// `chain`, with the `MirrorSpec` that mirrors the chain's final source.
    fn mirror_path<'a>(
        &'a self,
        spec: &'a MirrorSpec,
        chain: &[String],
    ) -> Option<(String, &'a MirrorSpec)> {
        let Some((relation, rest)) = chain.split_first() else {
            return Some((ID_FIELD.to_string(), spec));
        };
        let nested_field = spec.nested_for_relation(relation)?;
        let nested_spec = self.schema.mirror(nested_field.nested_type()?)?;
        let (path, terminal) = self.mirror_path(nested_spec, rest)?;
        Some((format!("{}.{}", nested_field.name, path), terminal))
    }
}

/// Locator for a computed field when `changed_type` is its declared source.
fn computed_locator(field: &ContainerField, changed_type: &str) -> Option<FieldLocator> {
    match field {
        ContainerField::Computed {
            name,
            source_type,
            handler,
            params,
        } if source_type == changed_type => Some(FieldLocator {
            field: name.clone(),
            id_paths: Vec::new(),
            handler: Some(handler.clone()),
            params: params.clone(),
        }),
        _ => None,
    }
}
