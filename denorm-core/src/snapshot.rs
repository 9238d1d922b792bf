//! Snapshot builder
//!
//! Builds mirror values from either a live, already-loaded source object or a
//! raw stored record. Both paths share one assembly routine, so equivalent
//! inputs produce byte-identical mirrors. Neither path performs reads: a
//! relation that was not supplied yields a `null` nested mirror.
//!
//! # Storage-name fallback
//!
//! When reading a raw record, each field is looked up under its declared
//! `storage_name` first (if any, and if the key is present), then under its
//! declared `source` name. The id is read from `_id`, then `id`. A nested
//! relation in a raw record must be an embedded object; `null`, a bare id or
//! an absent key all yield a `null` nested mirror.

use crate::error::SchemaError;
use crate::schema::{FieldKind, FieldSpec, MirrorSpec, SnapshotSchema};
use crate::{id_value, Document, EntityId, ID_FIELD, STORAGE_ID_FIELD};
use serde_json::{Map, Value};

/// A live source object the builder can read from.
///
/// Implementations expose only what is already loaded. `related` returns
/// `None` for absent optional relations, which is a valid state.
pub trait MirrorSource {
    /// Id of this source document.
    fn source_id(&self) -> EntityId;

    /// Value of a scalar field, by declared source name.
    fn field(&self, name: &str) -> Option<Value>;

    /// Loaded related object, by relation name.
    fn related(&self, name: &str) -> Option<&dyn MirrorSource>;
}

/// Read access shared by the instance and record paths.
trait SourceView: Sized {
    fn id(&self) -> Value;
    fn scalar(&self, field: &FieldSpec) -> Value;
    fn relation(&self, field: &FieldSpec) -> Option<Self>;
}

#[derive(Clone, Copy)]
struct InstanceView<'a>(&'a dyn MirrorSource);

impl<'a> SourceView for InstanceView<'a> {
    fn id(&self) -> Value {
        id_value(self.0.source_id())
    }

    fn scalar(&self, field: &FieldSpec) -> Value {
        self.0.field(&field.source).unwrap_or(Value::Null)
    }

    fn relation(&self, field: &FieldSpec) -> Option<Self> {
        let source: &'a dyn MirrorSource = self.0;
        source.related(&field.source).map(InstanceView)
    }
}

#[derive(Clone, Copy)]
struct RecordView<'a>(&'a Document);

impl<'a> RecordView<'a> {
    fn resolve(&self, field: &FieldSpec) -> Option<&'a Value> {
        let record: &'a Document = self.0;
        field.record_keys().find_map(|key| record.get(key))
    }
}

impl SourceView for RecordView<'_> {
    fn id(&self) -> Value {
        self.0
            .get(STORAGE_ID_FIELD)
            .or_else(|| self.0.get(ID_FIELD))
            .cloned()
            .unwrap_or(Value::Null)
    }

    fn scalar(&self, field: &FieldSpec) -> Value {
        self.resolve(field).cloned().unwrap_or(Value::Null)
    }

    fn relation(&self, field: &FieldSpec) -> Option<Self> {
        match self.resolve(field) {
            Some(Value::Object(record)) => Some(RecordView(record)),
            _ => None,
        }
    }
}

/// Builds mirror values per a [`SnapshotSchema`]. Referentially pure.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotBuilder<'s> {
    schema: &'s SnapshotSchema,
}

impl<'s> SnapshotBuilder<'s> {
    pub fn new(schema: &'s SnapshotSchema) -> Self {
        Self { schema }
    }

    /// Build a mirror from a live source object.
    pub fn from_instance(
        &self,
        mirror_type: &str,
        source: &dyn MirrorSource,
    ) -> Result<Value, SchemaError> {
        let spec = self.spec(mirror_type)?;
        self.assemble(spec, InstanceView(source))
    }

    /// Build a mirror from a raw stored record.
    pub fn from_record(&self, mirror_type: &str, record: &Document) -> Result<Value, SchemaError> {
        let spec = self.spec(mirror_type)?;
        self.assemble(spec, RecordView(record))
    }

    fn spec(&self, mirror_type: &str) -> Result<&'s MirrorSpec, SchemaError> {
        self.schema
            .mirror(mirror_type)
            .ok_or_else(|| SchemaError::UnknownMirrorType {
                referenced_by: "snapshot builder".to_string(),
                mirror_type: mirror_type.to_string(),
            })
    }

    fn assemble<V: SourceView>(&self, spec: &MirrorSpec, source: V) -> Result<Value, SchemaError> {
        let mut out = Map::new();
        out.insert(ID_FIELD.to_string(), source.id());
        for field in &spec.fields {
            let value = match &field.kind {
                FieldKind::Scalar => source.scalar(field),
                FieldKind::Nested(mirror_type) => {
                    let nested = self.spec(mirror_type)?;
                    match source.relation(field) {
                        Some(related) => self.assemble(nested, related)?,
                        None => Value::Null,
                    }
                }
            };
            out.insert(field.name.clone(), value);
        }
        Ok(Value::Object(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ModelSchema;
    use crate::new_entity_id;
    use serde_json::json;

    struct Owner {
        id: EntityId,
        name: String,
    }

    impl MirrorSource for Owner {
        fn source_id(&self) -> EntityId {
            self.id
        }
        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "name" => Some(json!(self.name)),
                _ => None,
            }
        }
        fn related(&self, _name: &str) -> Option<&dyn MirrorSource> {
            None
        }
    }

    struct House {
        id: EntityId,
        address: String,
        owner: Option<Owner>,
    }

    impl MirrorSource for House {
        fn source_id(&self) -> EntityId {
            self.id
        }
        fn field(&self, name: &str) -> Option<Value> {
            match name {
                "address" => Some(json!(self.address)),
                _ => None,
            }
        }
        fn related(&self, name: &str) -> Option<&dyn MirrorSource> {
            match name {
                "owner" => self.owner.as_ref().map(|o| o as &dyn MirrorSource),
                _ => None,
            }
        }
    }

    fn schema() -> SnapshotSchema {
        SnapshotSchema::builder()
            .mirror(MirrorSpec::new("OwnerMirror", "Owner").field(FieldSpec::scalar("name")))
            .mirror(
                MirrorSpec::new("HouseMirror", "House")
                    .field(FieldSpec::scalar("address").stored_as("addr"))
                    .field(FieldSpec::nested("owner", "OwnerMirror")),
            )
            .model(ModelSchema::new("Tenant").mirror("house", "HouseMirror"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_from_instance_with_nested() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let house = House {
            id: new_entity_id(),
            address: "1 Main St".to_string(),
            owner: Some(Owner {
                id: new_entity_id(),
                name: "Ada".to_string(),
            }),
        };
        let mirror = builder.from_instance("HouseMirror", &house).unwrap();
        assert_eq!(mirror["id"], json!(house.id.to_string()));
        assert_eq!(mirror["address"], json!("1 Main St"));
        assert_eq!(mirror["owner"]["name"], json!("Ada"));
    }

    #[test]
    fn test_absent_relation_is_null() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let house = House {
            id: new_entity_id(),
            address: "2 Side St".to_string(),
            owner: None,
        };
        let mirror = builder.from_instance("HouseMirror", &house).unwrap();
        assert_eq!(mirror["owner"], Value::Null);
    }

    #[test]
    fn test_from_record_uses_storage_names() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let id = new_entity_id();
        let record = json!({
            "_id": id.to_string(),
            "addr": "3 Stored St",
            "address": "ignored",
            "owner": null,
        });
        let mirror = builder
            .from_record("HouseMirror", record.as_object().unwrap())
            .unwrap();
        assert_eq!(mirror["id"], json!(id.to_string()));
        assert_eq!(mirror["address"], json!("3 Stored St"));
        assert_eq!(mirror["owner"], Value::Null);
    }

    #[test]
    fn test_from_record_falls_back_to_declared_name() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let record = json!({ "id": "x", "address": "4 Fallback Rd" });
        let mirror = builder
            .from_record("HouseMirror", record.as_object().unwrap())
            .unwrap();
        assert_eq!(mirror["id"], json!("x"));
        assert_eq!(mirror["address"], json!("4 Fallback Rd"));
    }

    #[test]
    fn test_bare_id_relation_is_not_followed() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let record = json!({ "_id": "h", "addr": "5 Ref Ave", "owner": "some-owner-id" });
        let mirror = builder
            .from_record("HouseMirror", record.as_object().unwrap())
            .unwrap();
        assert_eq!(mirror["owner"], Value::Null);
    }

    #[test]
    fn test_instance_and_record_agree() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let owner_id = new_entity_id();
        let house = House {
            id: new_entity_id(),
            address: "6 Same St".to_string(),
            owner: Some(Owner {
                id: owner_id,
                name: "Grace".to_string(),
            }),
        };
        let record = json!({
            "_id": house.id.to_string(),
            "addr": "6 Same St",
            "owner": { "_id": owner_id.to_string(), "name": "Grace" },
        });
        let a = builder.from_instance("HouseMirror", &house).unwrap();
        let b = builder
            .from_record("HouseMirror", record.as_object().unwrap())
            .unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[test]
    fn test_unknown_mirror_type() {
        let schema = schema();
        let builder = SnapshotBuilder::new(&schema);
        let err = builder
            .from_record("Nope", &Document::new())
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownMirrorType { .. }));
    }
}
