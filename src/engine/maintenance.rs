//! Periodic upkeep: pointer garbage collection and the scanner watchdog.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{Engine, WakeGate};
use crate::config::EngineConfig;
use crate::error::Result;

/// What the maintenance loop does when it finds the scanner stalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watchdog {
    /// Restart the scanner in this process. Only for a process whose
    /// registry can run the queued work.
    Recover,
    /// Log the stall and leave recovery to a worker process.
    Report,
}

impl Engine {
    /// Delete up to `limit` pointers for queues that have been empty and
    /// inactive for at least the minimum inactivity window. Returns how
    /// many were deleted.
    pub fn garbage_collect_pointers(&self, limit: usize) -> Result<usize> {
        let deleted = self.transact(|ctx| {
            let cutoff = ctx
                .now()
                .saturating_sub(ctx.config().min_inactive_before_delete_ms);
            let idle = ctx.idle_pointers(cutoff, limit)?;
            for pointer in &idle {
                ctx.delete_pointer(&pointer.queue_id)?;
                debug!(queue = %pointer.queue_id, "idle queue pointer deleted");
            }
            Ok(idle.len())
        })?;

        if deleted > 0 {
            info!(deleted, "queue pointers collected");
            crate::telemetry::metrics::pointers_collected().add(deleted as u64, &[]);
        }
        Ok(deleted)
    }

    /// Whether work is due while no scanner cycle is running or scheduled
    /// to run. Reads only.
    pub fn scanner_stalled(&self) -> Result<bool> {
        self.transact(|ctx| {
            let now = ctx.now();
            let state = ctx.scanner_state()?;
            if state.is_leased(now) || state.next_run_at.is_some_and(|at| at >= now) {
                return Ok(false);
            }
            Ok(!ctx.due_pointers(1)?.is_empty())
        })
    }

    /// Restart the scanner if it is not running while work is due. Covers
    /// a scanner that died holding its lease, and lost continuations.
    pub fn watchdog_recover(&self) -> Result<bool> {
        let woke = self.wake(WakeGate::IfDue)?;
        if woke {
            warn!("watchdog restarted the scanner");
        }
        Ok(woke)
    }

    fn run_watchdog(&self, mode: Watchdog) -> Result<()> {
        match mode {
            Watchdog::Recover => {
                self.watchdog_recover()?;
            }
            Watchdog::Report => {
                if self.scanner_stalled()? {
                    warn!("scanner stalled with due work, waiting for a worker process to recover it");
                }
            }
        }
        Ok(())
    }

    /// Run garbage collection and the watchdog on the configured interval
    /// until `shutdown` is notified.
    pub async fn run_maintenance(&self, shutdown: Arc<Notify>, watchdog: Watchdog) {
        info!(?watchdog, "maintenance loop started");
        loop {
            let config = self.config().unwrap_or_else(|e| {
                error!(error = %e, "cannot resolve config, using defaults");
                EngineConfig::default()
            });
            let interval = Duration::from_millis(config.maintenance_interval_ms.max(1) as u64);

            tokio::select! {
                _ = shutdown.notified() => {
                    info!("maintenance loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = self.garbage_collect_pointers(config.pointer_scan_limit()) {
                error!(error = %e, "pointer garbage collection failed");
            }
            if let Err(e) = self.run_watchdog(watchdog) {
                error!(error = %e, "watchdog failed");
            }
        }
    }
}
