//! Denormalization task descriptors.
//!
//! A task is a transient work item: refresh field `field` of every `model`
//! document whose mirror references `object_id`. At most one pending task
//! exists per [`TaskKey`]; tasks are deleted on success.

use crate::{EntityId, Timestamp};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Dedup key: the unit of task collapsing and mutual exclusion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub model: String,
    pub field: String,
    pub object_id: EntityId,
}

impl TaskKey {
    pub fn new(model: impl Into<String>, field: impl Into<String>, object_id: EntityId) -> Self {
        Self {
            model: model.into(),
            field: field.into(),
            object_id,
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}/{}", self.model, self.field, self.object_id)
    }
}

/// A pending refresh request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenormalizationTask {
    pub key: TaskKey,
    /// Custom handler name; `None` selects the default snapshot path
    pub handler: Option<String>,
    #[serde(default)]
    pub params: Value,
    /// Dotted paths locating target documents by `object_id`
    #[serde(default)]
    pub id_paths: Vec<String>,
    pub enqueued_at: Timestamp,
    /// Failed executions since the last fresh request
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl DenormalizationTask {
    pub fn new(key: TaskKey) -> Self {
        Self {
            key,
            handler: None,
            params: Value::Null,
            id_paths: Vec::new(),
            enqueued_at: Utc::now(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Route this task to a custom handler.
    pub fn with_handler(mut self, handler: impl Into<String>, params: Value) -> Self {
        self.handler = Some(handler.into());
        self.params = params;
        self
    }

    pub fn with_id_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.id_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Fold a newer request for the same key into this one.
    ///
    /// Handler and params follow the newer request, locator paths are
    /// merged, and the retry history resets.
    pub fn supersede(&mut self, newer: DenormalizationTask) {
        self.handler = newer.handler;
        self.params = newer.params;
        for path in newer.id_paths {
            if !self.id_paths.contains(&path) {
                self.id_paths.push(path);
            }
        }
        self.enqueued_at = newer.enqueued_at;
        self.attempts = 0;
        self.last_error = None;
    }
}

/// Lifecycle state of a stored task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting to be claimed
    Pending,
    /// Owned by one executor under a lease
    Claimed,
    /// Exceeded its retry budget; kept for operators, not retried automatically
    Parked,
}
