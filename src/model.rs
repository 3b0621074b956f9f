//! Core data model.
//!
//! A queue item is one unit of work. A queue pointer is the sparse per-queue
//! cursor the scanner reads to find queues with due work. The scanner state
//! is the single row that fences the active scan loop.

pub mod pointer;

pub use pointer::{QueuePointer, QueueStats, ScannerState};

use crate::error::{Error, Result};
use crate::retry::{RetryBehavior, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for queue item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(ItemId)
            .map_err(|e| Error::Other(format!("invalid item id {s:?}: {e}")))
    }
}

/// Opaque token fencing a lease. A fresh one is minted on every acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A time-bounded claim on a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: LeaseId,
    pub expiry: i64,
}

impl Lease {
    pub fn is_active(&self, now: i64) -> bool {
        self.expiry > now
    }
}

/// Name of a callable registered with the engine's handler registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandlerRef(pub String);

impl HandlerRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for HandlerRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

/// Lifecycle phase of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The primary handler has not yet produced a final outcome.
    Run,
    /// The outcome is persisted; only the completion callback remains.
    OnComplete,
}

/// Final outcome reported to the completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    Failure,
    Cancelled,
}

/// How the primary handler is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Runs to completion inside one store transaction.
    Transactional,
    /// Runs outside any transaction, for arbitrarily long, under heartbeat.
    NonTransactional,
}

/// Selection discipline for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    /// Earliest vesting time first; leased items are skipped.
    Vesting,
    /// Strict insertion order; a leased or unready head blocks the queue.
    Fifo,
}

macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(Error::Other(format!(
                        concat!("unknown ", stringify!($ty), ": {}"),
                        s
                    ))),
                }
            }
        }
    };
}

string_enum!(Phase { Run => "run", OnComplete => "on_complete" });
string_enum!(CompletionStatus {
    Success => "success",
    Failure => "failure",
    Cancelled => "cancelled",
});
string_enum!(HandlerKind {
    Transactional => "transactional",
    NonTransactional => "non_transactional",
});
string_enum!(OrderBy { Vesting => "vesting", Fifo => "fifo" });

// ---------------------------------------------------------------------------
// Queue Item
// ---------------------------------------------------------------------------

/// One unit of work, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: ItemId,
    /// Insertion order within the store. Drives FIFO selection.
    pub seq: i64,
    pub queue_id: String,
    /// Opaque to the engine.
    pub payload: serde_json::Value,
    pub handler: HandlerRef,
    pub handler_kind: HandlerKind,
    pub on_complete: Option<HandlerRef>,
    pub context: Option<serde_json::Value>,
    pub phase: Phase,
    /// Set once `phase` is `OnComplete`.
    pub completion_status: Option<CompletionStatus>,
    pub completion_result: Option<serde_json::Value>,
    pub on_complete_timeout_retries: u32,
    pub retry_enabled: bool,
    pub retry_behavior: RetryBehavior,
    /// Earliest instant (epoch ms) this item may be selected. Mirrors the
    /// lease expiry while leased.
    pub vesting_time: i64,
    pub lease: Option<Lease>,
    pub error_count: u32,
    pub created_at: i64,
}

impl QueueItem {
    /// Leased under a lease that has not yet lapsed.
    pub fn is_leased(&self, now: i64) -> bool {
        self.lease.is_some_and(|lease| lease.is_active(now))
    }

    pub fn holds_lease(&self, lease_id: LeaseId) -> bool {
        self.lease.is_some_and(|lease| lease.id == lease_id)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new queue items. The engine's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub(crate) queue_id: String,
    pub(crate) payload: serde_json::Value,
    pub(crate) handler: HandlerRef,
    pub(crate) handler_kind: HandlerKind,
    pub(crate) run_after_ms: Option<i64>,
    pub(crate) run_at_ms: Option<i64>,
    pub(crate) retry: RetryPolicy,
    pub(crate) on_complete: Option<HandlerRef>,
    pub(crate) context: Option<serde_json::Value>,
    pub(crate) order_by: Option<OrderBy>,
}

impl NewItem {
    pub fn new(
        queue_id: impl Into<String>,
        handler: impl Into<HandlerRef>,
        handler_kind: HandlerKind,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            payload: serde_json::Value::Null,
            handler: handler.into(),
            handler_kind,
            run_after_ms: None,
            run_at_ms: None,
            retry: RetryPolicy::default(),
            on_complete: None,
            context: None,
            order_by: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Run no earlier than `delay_ms` after enqueue.
    pub fn run_after(mut self, delay_ms: i64) -> Self {
        self.run_after_ms = Some(delay_ms);
        self
    }

    /// Run no earlier than the given epoch-ms instant.
    pub fn run_at(mut self, at_ms: i64) -> Self {
        self.run_at_ms = Some(at_ms);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn on_complete(
        mut self,
        callback: impl Into<HandlerRef>,
        context: Option<serde_json::Value>,
    ) -> Self {
        self.on_complete = Some(callback.into());
        self.context = context;
        self
    }

    /// Set the ordering discipline for this item's queue.
    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    /// Resolve the requested ready time against `now`.
    pub(crate) fn vesting_time(&self, now: i64) -> Result<i64> {
        match (self.run_after_ms, self.run_at_ms) {
            (Some(_), Some(_)) => Err(Error::InvalidSchedule(
                "run_after and run_at are mutually exclusive".to_string(),
            )),
            (Some(delay), None) => Ok(now.saturating_add(delay.max(0))),
            (None, Some(at)) => Ok(at),
            (None, None) => Ok(now),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of the primary handler, as reported to `finalize_worker`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "result", rename_all = "snake_case")]
pub enum WorkOutcome {
    Success(serde_json::Value),
    Failure(serde_json::Value),
}

/// What `finalize_worker` did with an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeOutcome {
    /// The item reached a terminal outcome and was deleted.
    pub done: bool,
    /// The primary handler was scheduled for another attempt.
    pub retried_work: bool,
    /// Completion delivery timed out and was scheduled again.
    pub retried_on_complete: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_and_instant_are_mutually_exclusive() {
        let item = NewItem::new("q", "h", HandlerKind::Transactional)
            .run_after(10)
            .run_at(20);
        assert!(matches!(item.vesting_time(0), Err(Error::InvalidSchedule(_))));
    }

    #[test]
    fn vesting_time_resolves_relative_and_absolute() {
        let base = NewItem::new("q", "h", HandlerKind::Transactional);
        assert_eq!(base.clone().vesting_time(100).unwrap(), 100);
        assert_eq!(base.clone().run_after(50).vesting_time(100).unwrap(), 150);
        assert_eq!(base.run_at(42).vesting_time(100).unwrap(), 42);
    }

    #[test]
    fn enums_round_trip_through_their_column_text() {
        for phase in [Phase::Run, Phase::OnComplete] {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
        }
        assert_eq!(
            "non_transactional".parse::<HandlerKind>().unwrap(),
            HandlerKind::NonTransactional
        );
        assert!("sideways".parse::<OrderBy>().is_err());
    }
}
