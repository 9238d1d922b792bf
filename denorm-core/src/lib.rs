//! Denorm Core - Mirror Schema and Cascade Scheduling
//!
//! Pure data structures and algorithms with no I/O. The storage and engine
//! crates depend on this one.
//!
//! A *mirror* is a denormalized copy of fields owned by a canonical *source*
//! document, embedded inside a dependent document. This crate holds:
//!
//! - [`SnapshotSchema`]: which mirror types exist and which models embed them
//! - [`SnapshotBuilder`]: builds mirror values from live instances or raw records
//! - [`DependencyGraph`]: source type → directly dependent types, cycle-checked
//! - [`CascadeScheduler`]: the transitive, deduplicated set of affected dependents
//! - [`DenormalizationTask`] and [`LeaseData`]: the unit of queued refresh work

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

pub mod error;
pub mod filter;
pub mod graph;
pub mod lease;
pub mod scheduler;
pub mod schema;
pub mod snapshot;
pub mod task;

pub use error::{
    ConfigError, DenormError, DenormResult, HandlerError, SchemaError, StorageError, TaskError,
};
pub use filter::{lookup_path, Filter, FilterExpr, FilterOperator};
pub use graph::DependencyGraph;
pub use lease::{ClaimedTask, LeaseData};
pub use scheduler::{AffectedDependent, CascadeScheduler, FieldLocator};
pub use schema::{
    ContainerField, FieldKind, FieldSpec, MirrorSpec, ModelSchema, SnapshotSchema,
    SnapshotSchemaBuilder,
};
pub use snapshot::{MirrorSource, SnapshotBuilder};
pub use task::{DenormalizationTask, TaskKey, TaskState};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Document identifier using UUIDv7 for timestamp-sortable IDs.
pub type EntityId = Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// A raw stored document: field-keyed, as the document store returns it.
pub type Document = serde_json::Map<String, Value>;

/// Key under which every mirror carries the id of its source.
pub const ID_FIELD: &str = "id";

/// Key under which the document store persists a document's own id.
pub const STORAGE_ID_FIELD: &str = "_id";

/// Generate a new UUIDv7 EntityId (timestamp-sortable).
pub fn new_entity_id() -> EntityId {
    Uuid::now_v7()
}

/// Canonical JSON encoding of an id, as stored in documents and mirrors.
pub fn id_value(id: EntityId) -> Value {
    Value::String(id.to_string())
}

/// Read the id of a stored document (`_id`, falling back to `id`).
pub fn document_id(doc: &Document) -> Option<EntityId> {
    doc.get(STORAGE_ID_FIELD)
        .or_else(|| doc.get(ID_FIELD))
        .and_then(parse_id)
}

/// Resolve a reference value to the id it points at.
///
/// Accepts an embedded mirror or record (`{"id": ..}` / `{"_id": ..}`) or a
/// bare id string. Anything else, including `null`, is no reference.
pub fn reference_id(value: &Value) -> Option<EntityId> {
    match value {
        Value::Object(map) => document_id(map),
        other => parse_id(other),
    }
}

fn parse_id(value: &Value) -> Option<EntityId> {
    value.as_str().and_then(|s| Uuid::parse_str(s).ok())
}
