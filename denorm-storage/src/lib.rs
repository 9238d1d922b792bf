//! Denorm Storage - Collaborator Traits
//!
//! The engine talks to two external collaborators through async traits:
//!
//! - [`DocumentStore`]: generic `get_by_id` / `find_by_filter` /
//!   `update_fields_by_id` over field-keyed documents. No multi-document
//!   transactions are assumed.
//! - [`TaskStore`]: durable container of refresh tasks keyed by
//!   `(model, field, object_id)`, with atomic per-key claims.
//!
//! In-memory implementations back the tests and single-process deployments.

pub mod document_store;
pub mod task_store;

pub use document_store::{DocumentStore, InMemoryDocumentStore};
pub use task_store::{
    CompletionOutcome, EnqueueOutcome, FailureOutcome, InMemoryTaskStore, TaskStats, TaskStore,
};
