//! Claim leases for per-key mutual exclusion.
//!
//! A claim hands one executor ownership of a task key until the lease
//! expires. Once `expires_at` passes the key becomes claimable again, so
//! execution is bounded by [`LeaseData::execution_budget`]: a crashed or
//! stalled worker never overlaps the next owner.
//!
//! ```text
//! Pending ─── claim() ──→ Claimed ─── complete() ──→ (deleted)
//!    ↑                       │
//!    └── fail() / expiry ────┘
//! ```
//!
//! [`ClaimedTask`] is consumed by `complete` and `fail`, so a claim cannot be
//! settled twice.

use crate::task::{DenormalizationTask, TaskKey};
use crate::{EntityId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Lease data persisted alongside a claimed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseData {
    pub lease_id: EntityId,
    pub key: TaskKey,
    pub claimed_at: Timestamp,
    pub expires_at: Timestamp,
    /// Request generation observed at claim time. A newer enqueue while
    /// claimed bumps the stored generation, so completion reschedules
    /// instead of deleting.
    pub generation: u64,
}

impl LeaseData {
    pub fn new(key: TaskKey, now: Timestamp, duration: Duration, generation: u64) -> Self {
        let expires_at = now
            + chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            lease_id: Uuid::now_v7(),
            key,
            claimed_at: now,
            expires_at,
            generation,
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Time left before another executor may take the key over; zero once
    /// expired.
    pub fn time_left(&self, now: Timestamp) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Share of the remaining lease an executor may spend running the task,
    /// leaving the rest to settle the claim before it expires.
    pub fn execution_budget(&self, now: Timestamp, percent: u32) -> Duration {
        self.time_left(now) * percent.min(100) / 100
    }
}

/// A task together with the lease that grants ownership of its key.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub task: DenormalizationTask,
    pub lease: LeaseData,
}

impl ClaimedTask {
    pub fn key(&self) -> &TaskKey {
        &self.task.key
    }
}
