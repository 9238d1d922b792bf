//! Error types for denormalization operations

use thiserror::Error;
use uuid::Uuid;

/// Schema errors. Fatal at load time.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{referenced_by} references undeclared mirror type '{mirror_type}'")]
    UnknownMirrorType {
        referenced_by: String,
        mirror_type: String,
    },

    #[error("Mirror type '{mirror_type}' is declared more than once")]
    DuplicateMirrorType { mirror_type: String },

    #[error("Model '{model}' is declared more than once")]
    DuplicateModel { model: String },

    #[error("Field '{field}' is declared more than once in {owner}")]
    DuplicateField { owner: String, field: String },

    #[error("Mirror type '{mirror_type}' nests a mirror of its own source type '{source_type}'")]
    SelfNestedMirror {
        mirror_type: String,
        source_type: String,
    },

    #[error("Circular dependency detected: {cycle}")]
    CircularDependency { cycle: String },

    #[error("Handler '{handler}' referenced by {referenced_by} is not registered")]
    UnknownHandler {
        handler: String,
        referenced_by: String,
    },

    #[error("Model '{model}' has no mirror field '{field}'")]
    UnknownModelField { model: String, field: String },

    #[error("Malformed schema document: {reason}")]
    Malformed { reason: String },

    #[error("Schema could not be serialized: {reason}")]
    Serialize { reason: String },
}

/// Document and task store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Errors raised while executing a claimed task.
///
/// Everything except `UnknownHandler` leaves the task pending for retry; a
/// missing source is not an error at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("Handler '{handler}' failed for {key}: {reason}")]
    HandlerFailed {
        handler: String,
        key: String,
        reason: String,
    },

    #[error("Write to {model} {id} failed: {reason}")]
    TargetWriteFailed {
        model: String,
        id: Uuid,
        reason: String,
    },

    #[error("Lease lost for {key}")]
    LeaseLost { key: String },

    #[error("Execution of {key} exceeded its lease budget of {budget_ms}ms")]
    LeaseBudgetExceeded { key: String, budget_ms: u64 },

    #[error("Handler not registered: {handler}")]
    UnknownHandler { handler: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Required component missing: {component}")]
    Missing { component: String },

    #[error("Telemetry initialization failed: {reason}")]
    Telemetry { reason: String },
}

/// Error returned by custom handlers.
///
/// Handlers own their internal error handling; whatever they surface here
/// is recorded on the task, which is then retried by the queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<StorageError> for HandlerError {
    fn from(err: StorageError) -> Self {
        Self(err.to_string())
    }
}

impl From<SchemaError> for HandlerError {
    fn from(err: SchemaError) -> Self {
        Self(err.to_string())
    }
}

/// Master error type for all denormalization errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DenormError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl DenormError {
    /// Whether the queue should retry the task that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DenormError::Storage(_)
                | DenormError::Task(TaskError::HandlerFailed { .. })
                | DenormError::Task(TaskError::TargetWriteFailed { .. })
                | DenormError::Task(TaskError::LeaseLost { .. })
                | DenormError::Task(TaskError::LeaseBudgetExceeded { .. })
        )
    }
}

/// Result type alias for denormalization operations.
pub type DenormResult<T> = Result<T, DenormError>;

// =============================================================================
// TESTS
// =============================================================================
