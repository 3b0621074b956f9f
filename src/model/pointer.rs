//! Per-queue pointers and the scanner singleton.

use super::{Lease, OrderBy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The engine's belief about when a queue next has ready work.
///
/// `vesting_time` may be later than the truth only if a wake is pending;
/// every path that makes an item ready sooner tightens it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuePointer {
    pub queue_id: String,
    pub vesting_time: i64,
    pub lease: Option<Lease>,
    pub last_active_time: i64,
    /// Explicit ordering chosen for this queue; `None` uses the engine default.
    pub order_by: Option<OrderBy>,
}

impl QueuePointer {
    pub fn is_leased(&self, now: i64) -> bool {
        self.lease.is_some_and(|lease| lease.is_active(now))
    }
}

/// The single row fencing the active scan loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScannerState {
    pub lease: Option<Lease>,
    pub last_run_at: Option<i64>,
    /// Handle of the currently scheduled continuation. A continuation whose
    /// handle no longer matches has been superseded and must do nothing.
    pub continuation: Option<Uuid>,
    /// When that continuation is due to run.
    pub next_run_at: Option<i64>,
    /// Current fast-backoff delay; reset whenever a cycle finds work.
    pub backoff_ms: i64,
}

impl ScannerState {
    pub fn is_leased(&self, now: i64) -> bool {
        self.lease.is_some_and(|lease| lease.is_active(now))
    }
}

/// Point-in-time counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub item_count: u64,
    /// Items not currently held under an unexpired lease.
    pub pending_count: u64,
    pub leased_count: u64,
}
