//! Denorm Engine - Asynchronous Mirror Refresh
//!
//! A source write calls [`CascadeEngine::notify`]; the scheduler computes the
//! affected dependents, one task per `(model, field, object_id)` key goes into
//! the [`TaskQueue`], and workers drain it through the [`TaskExecutor`].
//!
//! Consistency is eventual: a mirror reflects its source as of the most
//! recent completed refresh for its key, and at most one refresh per key is
//! ever in flight.

pub mod config;
pub mod constants;
pub mod engine;
pub mod executor;
pub mod queue;
pub mod registry;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::{
    CascadeEngine, CascadeEngineBuilder, DrainReport, EngineMetrics, EngineMetricsSnapshot,
    NotifyReport,
};
pub use executor::{ExecutionOutcome, TaskExecutor};
pub use queue::TaskQueue;
pub use registry::{CustomHandler, HandlerContext, HandlerOutcome, HandlerRegistry};
pub use telemetry::{init_tracing, TelemetryConfig};
