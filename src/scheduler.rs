//! Deferred execution: "run this future after D milliseconds".
//!
//! Delivery is best-effort and unordered. The engine never relies on a
//! continuation actually running; every continuation re-checks its lease
//! token before acting, and the watchdog covers lost ones.

use crate::clock::Clock;
use crate::handler::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error};

/// Fire-and-forget scheduling of a future.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, label: &'static str, task: BoxFuture<()>);
}

/// Spawns each continuation on the current tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, label: &'static str, task: BoxFuture<()>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            error!(label, "no tokio runtime available, dropping continuation");
            return;
        };
        handle.spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(label, "running continuation");
            task.await;
        });
    }
}

struct Pending {
    due_at: i64,
    label: &'static str,
    task: BoxFuture<()>,
}

/// Holds continuations until the caller runs them. Delays are measured on
/// the supplied clock, so a continuation only becomes runnable once the
/// clock has been advanced past its due time.
pub struct ManualScheduler {
    clock: Arc<dyn Clock>,
    pending: Mutex<Vec<Pending>>,
}

impl ManualScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Labels of every continuation not yet run, in scheduling order.
    pub fn pending_labels(&self) -> Vec<&'static str> {
        self.lock().iter().map(|p| p.label).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// Drop every pending continuation, simulating lost deliveries.
    pub fn drop_pending(&self) -> usize {
        let mut pending = self.lock();
        let dropped = pending.len();
        pending.clear();
        dropped
    }

    /// Run every continuation that is due now, in scheduling order.
    /// Continuations scheduled while these run are left pending.
    pub async fn run_due(&self) -> usize {
        let now = self.clock.now_ms();
        let due: Vec<Pending> = {
            let mut pending = self.lock();
            let (due, later): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|p| p.due_at <= now);
            *pending = later;
            due
        };
        let ran = due.len();
        for p in due {
            debug!(label = p.label, "running manual continuation");
            p.task.await;
        }
        ran
    }

    /// Keep running due continuations until none are left, up to `max_rounds`.
    pub async fn run_until_idle(&self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let ran = self.run_due().await;
            if ran == 0 {
                break;
            }
            total += ran;
        }
        total
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, label: &'static str, task: BoxFuture<()>) {
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let due_at = self.clock.now_ms().saturating_add(delay_ms);
        self.lock().push(Pending {
            due_at,
            label,
            task,
        });
    }
}
