//! Snapshot schema
//!
//! Static declaration of every mirror type (what it copies, from which source
//! type) and every model that embeds mirrors. "Is a mirror of" is a relation
//! in this table, not a type hierarchy: nested mirrors are a tagged tree of
//! [`MirrorSpec`] nodes resolved by name.
//!
//! # Example
//!
//! ```
//! use denorm_core::{FieldSpec, MirrorSpec, ModelSchema, SnapshotSchema};
//!
//! let schema = SnapshotSchema::builder()
//!     .mirror(MirrorSpec::new("HouseMirror", "House").field(FieldSpec::scalar("address")))
//!     .model(ModelSchema::new("House"))
//!     .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
//!     .build()
//!     .expect("valid schema");
//!
//! assert_eq!(schema.mirror_spec_for("Tenant", "house").unwrap().source_type, "House");
//! ```

use crate::error::SchemaError;
use crate::graph::DependencyGraph;
use crate::ID_FIELD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

// ============================================================================
// MIRROR SPECS
// ============================================================================

/// What a mirror field holds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Plain copy of a source field
    #[default]
    Scalar,
    /// A nested mirror built from a relation of the source
    Nested(String),
}

/// One entry of a mirror's ordered field map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Key inside the mirror value
    pub name: String,
    /// Source field (scalar) or relation (nested) read from the source
    pub source: String,
    /// Key used by raw stored records when it differs from `source`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
    #[serde(default)]
    pub kind: FieldKind,
}

impl FieldSpec {
    /// Scalar copied under the same name it has on the source.
    pub fn scalar(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: name.clone(),
            name,
            storage_name: None,
            kind: FieldKind::Scalar,
        }
    }

    /// Nested mirror built from the relation of the same name on the source.
    pub fn nested(name: impl Into<String>, mirror_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: name.clone(),
            name,
            storage_name: None,
            kind: FieldKind::Nested(mirror_type.into()),
        }
    }

    /// Read from a differently named source field or relation.
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Key used for this field in raw stored records.
    pub fn stored_as(mut self, storage_name: impl Into<String>) -> Self {
        self.storage_name = Some(storage_name.into());
        self
    }

    /// Nested mirror type, if this is a nested field.
    pub fn nested_type(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Nested(mirror_type) => Some(mirror_type),
            FieldKind::Scalar => None,
        }
    }

    /// Record keys to try, in order: storage name, then declared source name.
    pub fn record_keys(&self) -> impl Iterator<Item = &str> {
        self.storage_name
            .as_deref()
            .into_iter()
            .chain(std::iter::once(self.source.as_str()))
    }

    /// Whether a change to any of `changed` can alter this field.
    fn observes(&self, changed: &[String]) -> bool {
        changed
            .iter()
            .any(|c| *c == self.source || self.storage_name.as_deref() == Some(c.as_str()))
    }
}

/// Declaration of one mirror type: `(mirror_type, source_type, field_map)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSpec {
    pub mirror_type: String,
    pub source_type: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

impl MirrorSpec {
    pub fn new(mirror_type: impl Into<String>, source_type: impl Into<String>) -> Self {
        Self {
            mirror_type: mirror_type.into(),
            source_type: source_type.into(),
            fields: Vec::new(),
        }
    }

    /// Append a field to the field map.
    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Nested field built from the given source relation.
    pub fn nested_for_relation(&self, relation: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| f.nested_type().is_some() && f.source == relation)
    }

    /// Whether a change to any of `changed` (source field names) can alter
    /// this mirror's own fields. The id never changes.
    pub fn observes_any(&self, changed: &[String]) -> bool {
        self.fields.iter().any(|f| f.observes(changed))
    }
}

// ============================================================================
// MODEL SCHEMAS
// ============================================================================

/// A field of a dependent model that is maintained by the cascade engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerField {
    /// Embedded mirror refreshed by the default snapshot path
    Mirror { name: String, mirror_type: String },
    /// Field recomputed by a registered custom handler when `source_type` changes
    Computed {
        name: String,
        source_type: String,
        handler: String,
        #[serde(default)]
        params: Value,
    },
}

impl ContainerField {
    pub fn name(&self) -> &str {
        match self {
            ContainerField::Mirror { name, .. } | ContainerField::Computed { name, .. } => name,
        }
    }
}

/// A model (collection) and the maintained fields its documents carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    pub model: String,
    #[serde(default)]
    pub fields: Vec<ContainerField>,
}

impl ModelSchema {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            fields: Vec::new(),
        }
    }

    /// Declare an embedded mirror field.
    pub fn mirror(mut self, name: impl Into<String>, mirror_type: impl Into<String>) -> Self {
        self.fields.push(ContainerField::Mirror {
            name: name.into(),
            mirror_type: mirror_type.into(),
        });
        self
    }

    /// Declare a field maintained by a custom handler.
    pub fn computed(
        mut self,
        name: impl Into<String>,
        source_type: impl Into<String>,
        handler: impl Into<String>,
        params: Value,
    ) -> Self {
        self.fields.push(ContainerField::Computed {
            name: name.into(),
            source_type: source_type.into(),
            handler: handler.into(),
            params,
        });
        self
    }

    pub fn field(&self, name: &str) -> Option<&ContainerField> {
        self.fields.iter().find(|f| f.name() == name)
    }
}

// ============================================================================
// SNAPSHOT SCHEMA
// ============================================================================

/// Validated table of mirror specs and model declarations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotSchema {
    mirrors: BTreeMap<String, MirrorSpec>,
    models: BTreeMap<String, ModelSchema>,
}

/// Serialized form accepted by [`SnapshotSchema::from_json_str`].
#[derive(Debug, Default, Serialize, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    mirrors: Vec<MirrorSpec>,
    #[serde(default)]
    models: Vec<ModelSchema>,
}

impl SnapshotSchema {
    pub fn builder() -> SnapshotSchemaBuilder {
        SnapshotSchemaBuilder::default()
    }

    /// Load and validate a schema from its JSON form:
    /// `{"mirrors": [MirrorSpec..], "models": [ModelSchema..]}`.
    pub fn from_json_str(json: &str) -> Result<Self, SchemaError> {
        let doc: SchemaDocument =
            serde_json::from_str(json).map_err(|e| SchemaError::Malformed {
                reason: e.to_string(),
            })?;
        SnapshotSchemaBuilder {
            mirrors: doc.mirrors,
            models: doc.models,
        }
        .build()
    }

    /// Serialize back to the JSON form.
    pub fn to_json_string(&self) -> Result<String, SchemaError> {
        let doc = SchemaDocument {
            mirrors: self.mirrors.values().cloned().collect(),
            models: self.models.values().cloned().collect(),
        };
        serde_json::to_string_pretty(&doc).map_err(|e| SchemaError::Serialize {
            reason: e.to_string(),
        })
    }

    pub fn mirror(&self, mirror_type: &str) -> Option<&MirrorSpec> {
        self.mirrors.get(mirror_type)
    }

    pub fn mirrors(&self) -> impl Iterator<Item = &MirrorSpec> {
        self.mirrors.values()
    }

    pub fn model(&self, model: &str) -> Option<&ModelSchema> {
        self.models.get(model)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelSchema> {
        self.models.values()
    }

    /// Mirror spec embedded in `model.field`.
    pub fn mirror_spec_for(&self, model: &str, field: &str) -> Result<&MirrorSpec, SchemaError> {
        let unknown = || SchemaError::UnknownModelField {
            model: model.to_string(),
            field: field.to_string(),
        };
        match self.model(model).and_then(|m| m.field(field)) {
            Some(ContainerField::Mirror { mirror_type, .. }) => {
                self.mirror(mirror_type).ok_or_else(unknown)
            }
            _ => Err(unknown()),
        }
    }

    /// Every handler name referenced by a computed field, with the field
    /// that references it.
    pub fn handler_references(&self) -> Vec<(String, String)> {
        self.models
            .values()
            .flat_map(|m| {
                m.fields.iter().filter_map(move |f| match f {
                    ContainerField::Computed { name, handler, .. } => {
                        Some((handler.clone(), format!("{}.{}", m.model, name)))
                    }
                    ContainerField::Mirror { .. } => None,
                })
            })
            .collect()
    }

    /// Check every load-time invariant.
    ///
    /// Nested and container references must resolve, field names must be
    /// unique per owner, no mirror may nest a mirror of its own source type,
    /// and the model dependency graph must be acyclic.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for spec in self.mirrors.values() {
            let owner = format!("mirror '{}'", spec.mirror_type);
            let mut seen = BTreeSet::from([ID_FIELD]);
            for field in &spec.fields {
                if !seen.insert(field.name.as_str()) {
                    return Err(SchemaError::DuplicateField {
                        owner,
                        field: field.name.clone(),
                    });
                }
                if let Some(nested) = field.nested_type() {
                    if !self.mirrors.contains_key(nested) {
                        return Err(SchemaError::UnknownMirrorType {
                            referenced_by: owner,
                            mirror_type: nested.to_string(),
                        });
                    }
                }
            }
        }

        for spec in self.mirrors.values() {
            self.check_not_self_nested(spec)?;
        }

        for model in self.models.values() {
            let owner = format!("model '{}'", model.model);
            let mut seen = BTreeSet::new();
            for field in &model.fields {
                if !seen.insert(field.name()) {
                    return Err(SchemaError::DuplicateField {
                        owner,
                        field: field.name().to_string(),
                    });
                }
                if let ContainerField::Mirror { mirror_type, .. } = field {
                    if !self.mirrors.contains_key(mirror_type) {
                        return Err(SchemaError::UnknownMirrorType {
                            referenced_by: owner,
                            mirror_type: mirror_type.clone(),
                        });
                    }
                }
            }
        }

        DependencyGraph::from_schema(self).map(|_| ())
    }

    fn check_not_self_nested(&self, root: &MirrorSpec) -> Result<(), SchemaError> {
        let mut stack: Vec<&MirrorSpec> = vec![root];
        let mut visited = BTreeSet::new();
        while let Some(spec) = stack.pop() {
            for nested in spec.fields.iter().filter_map(FieldSpec::nested_type) {
                let Some(nested_spec) = self.mirrors.get(nested) else {
                    continue;
                };
                if nested_spec.source_type == root.source_type {
                    return Err(SchemaError::SelfNestedMirror {
                        mirror_type: root.mirror_type.clone(),
                        source_type: root.source_type.clone(),
                    });
                }
                if visited.insert(nested) {
                    stack.push(nested_spec);
                }
            }
        }
        Ok(())
    }
}

/// Collects declarations, then validates them all at once in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct SnapshotSchemaBuilder {
    mirrors: Vec<MirrorSpec>,
    models: Vec<ModelSchema>,
}

impl SnapshotSchemaBuilder {
    pub fn mirror(mut self, spec: MirrorSpec) -> Self {
        self.mirrors.push(spec);
        self
    }

    pub fn model(mut self, model: ModelSchema) -> Self {
        self.models.push(model);
        self
    }

    pub fn build(self) -> Result<SnapshotSchema, SchemaError> {
        let mut schema = SnapshotSchema::default();
        for spec in self.mirrors {
            if schema.mirrors.contains_key(&spec.mirror_type) {
                return Err(SchemaError::DuplicateMirrorType {
                    mirror_type: spec.mirror_type,
                });
            }
            schema.mirrors.insert(spec.mirror_type.clone(), spec);
        }
        for model in self.models {
            if schema.models.contains_key(&model.model) {
                return Err(SchemaError::DuplicateModel { model: model.model });
            }
            schema.models.insert(model.model.clone(), model);
        }
        schema.validate()?;
        Ok(schema)
    }
}

// =============================================================================
// TESTS
// =============================================================================
