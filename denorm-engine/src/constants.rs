//! Constants for the cascade engine
//!
//! Centralized defaults for worker, lease and retry settings.

// ============================================================================
// WORKERS
// ============================================================================

/// Default number of concurrent task workers
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default idle poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default claim lease duration in seconds
pub const DEFAULT_LEASE_SECS: u64 = 30;

/// Percentage of the remaining lease a claimed task may execute for
pub const LEASE_EXECUTION_PERCENT: u32 = 80;

// ============================================================================
// RETRY
// ============================================================================

/// Base delay for exponential retry backoff, in milliseconds
pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;

/// Upper bound on retry backoff, in milliseconds (5 minutes)
pub const DEFAULT_RETRY_MAX_MS: u64 = 300_000;

/// Failures before a task is parked for operators
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

// ============================================================================
// DRAIN
// ============================================================================

/// Maximum tasks processed by a single `drain()` call
pub const DEFAULT_DRAIN_BATCH_LIMIT: usize = 10_000;

// ============================================================================
// TELEMETRY
// ============================================================================

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_LOG_FILTER: &str = "denorm_engine=info,info";
