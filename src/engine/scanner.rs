//! The scanner: a single leased loop that finds due queue pointers and
//! hands each to a manager.
//!
//! The scanner row holds the loop's lease and the handle of its one live
//! continuation. Every continuation checks that handle first, so wakes can
//! be requested freely: a superseded continuation does nothing.

use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Engine;
use super::lease;
use crate::error::Result;
use crate::model::*;
use crate::telemetry::metrics;

/// Condition attached to a wake request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeGate {
    /// Start a cycle whenever the scanner is not running.
    Always,
    /// Only if some pointer is due right now.
    IfDue,
    /// A parked scanner's timed wake; stale once another wake has replaced
    /// the continuation.
    Parked(Uuid),
}

/// How a cycle left the scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Found,
    Backoff,
    Parked,
    Idle,
}

impl Next {
    fn as_str(self) -> &'static str {
        match self {
            Next::Found => "found",
            Next::Backoff => "backoff",
            Next::Parked => "parked",
            Next::Idle => "idle",
        }
    }
}

impl Engine {
    /// Start a scanner cycle unless one is already running.
    ///
    /// Returns whether a cycle was scheduled.
    pub fn wake(&self, gate: WakeGate) -> Result<bool> {
        let started = self.transact(|ctx| {
            let now = ctx.now();
            let mut state = ctx.scanner_state()?;
            if state.is_leased(now) {
                return Ok(None);
            }
            match gate {
                WakeGate::Always => {}
                WakeGate::IfDue => {
                    if ctx.due_pointers(1)?.is_empty() {
                        return Ok(None);
                    }
                }
                WakeGate::Parked(token) => {
                    if state.continuation != Some(token) {
                        return Ok(None);
                    }
                }
            }

            let Some(lease_id) = lease::acquire(&mut state, now, ctx.config().scanner_lease_ms) else {
                return Ok(None);
            };
            let token = Uuid::new_v4();
            state.continuation = Some(token);
            state.next_run_at = Some(now);
            ctx.put_scanner_state(&state)?;
            Ok(Some((lease_id, token)))
        })?;

        match started {
            Some((lease_id, token)) => {
                debug!(?gate, "scanner woken");
                self.schedule_cycle(Duration::ZERO, lease_id, token);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn schedule_cycle(&self, delay: Duration, lease_id: LeaseId, token: Uuid) {
        let engine = self.clone();
        self.scheduler().schedule(
            delay,
            "scanner.cycle",
            Box::pin(async move {
                if let Err(e) = engine.run_cycle(lease_id, token) {
                    warn!(error = %e, "scanner cycle failed");
                }
            }),
        );
    }

    fn schedule_parked_wake(&self, delay: Duration, token: Uuid) {
        let engine = self.clone();
        self.scheduler().schedule(
            delay,
            "scanner.wake",
            Box::pin(async move {
                if let Err(e) = engine.wake(WakeGate::Parked(token)) {
                    warn!(error = %e, "parked scanner wake failed");
                }
            }),
        );
    }

    /// One scanner cycle: claim due pointers, dispatch their managers and
    /// schedule what comes next.
    fn run_cycle(&self, lease_id: LeaseId, token: Uuid) -> Result<()> {
        let claimed = self.transact(|ctx| {
            let now = ctx.now();
            let mut state = ctx.scanner_state()?;
            if state.continuation != Some(token) {
                return Ok(None);
            }
            if !lease::renew(&mut state, lease_id, now, ctx.config().scanner_lease_ms) {
                lease::record_conflict("scanner", "renew");
                return Ok(None);
            }
            state.last_run_at = Some(now);
            ctx.put_scanner_state(&state)?;

            let pointer_lease_ms = ctx.config().pointer_lease_ms;
            let max_managers = ctx.config().max_concurrent_managers;
            let mut claimed = Vec::new();
            for pointer in ctx.due_pointers(ctx.config().pointer_scan_limit())? {
                if claimed.len() >= max_managers {
                    break;
                }
                if pointer.is_leased(now) {
                    continue;
                }
                if let Some(pointer_lease) = ctx.obtain_pointer_lease(&pointer.queue_id, pointer_lease_ms)? {
                    claimed.push((pointer.queue_id, pointer_lease));
                }
            }
            Ok(Some(claimed))
        })?;

        let Some(claimed) = claimed else {
            debug!("scanner continuation superseded");
            return Ok(());
        };

        let found = !claimed.is_empty();
        for (queue_id, pointer_lease) in claimed {
            metrics::managers_dispatched().add(1, &[]);
            self.spawn_manager(queue_id, pointer_lease);
        }
        self.reschedule(lease_id, token, found)
    }

    /// Decide between another quick cycle, parking until the earliest
    /// pointer vests, and going idle.
    fn reschedule(&self, lease_id: LeaseId, token: Uuid, found: bool) -> Result<()> {
        let decision = self.transact(|ctx| {
            let now = ctx.now();
            let mut state = ctx.scanner_state()?;
            if state.continuation != Some(token) || !state.lease.is_some_and(|l| l.id == lease_id) {
                return Ok(None);
            }
            let config = ctx.config().clone();
            let next_token = Uuid::new_v4();

            let busy = !found && (ctx.any_pointer_leased()? || !ctx.due_pointers(1)?.is_empty());
            if found || busy {
                let (next, backoff_ms) = if found {
                    (Next::Found, config.scan_backoff_min_ms)
                } else {
                    let doubled = state.backoff_ms.saturating_mul(2);
                    (
                        Next::Backoff,
                        doubled.clamp(config.scan_backoff_min_ms, config.scan_backoff_max_ms.max(config.scan_backoff_min_ms)),
                    )
                };
                let run_at = now.saturating_add(backoff_ms);
                lease::renew(&mut state, lease_id, run_at, config.scanner_lease_ms);
                state.backoff_ms = backoff_ms;
                state.continuation = Some(next_token);
                state.next_run_at = Some(run_at);
                ctx.put_scanner_state(&state)?;
                return Ok(Some((next, backoff_ms, next_token)));
            }

            lease::release(&mut state, lease_id, now);
            state.backoff_ms = 0;
            match ctx.earliest_pointer()? {
                Some(pointer) => {
                    let delay_ms = pointer.vesting_time.saturating_sub(now).clamp(0, config.max_park_ms.max(0));
                    state.continuation = Some(next_token);
                    state.next_run_at = Some(now.saturating_add(delay_ms));
                    ctx.put_scanner_state(&state)?;
                    Ok(Some((Next::Parked, delay_ms, next_token)))
                }
                None => {
                    state.continuation = None;
                    state.next_run_at = None;
                    ctx.put_scanner_state(&state)?;
                    Ok(Some((Next::Idle, 0, next_token)))
                }
            }
        })?;

        let Some((next, delay_ms, next_token)) = decision else {
            return Ok(());
        };
        metrics::scanner_cycles().add(1, &[KeyValue::new("outcome", next.as_str())]);
        let delay = Duration::from_millis(delay_ms.max(0) as u64);
        match next {
            Next::Found | Next::Backoff => {
                debug!(outcome = next.as_str(), delay_ms, "scanner rescheduled");
                self.schedule_cycle(delay, lease_id, next_token);
            }
            Next::Parked => {
                debug!(delay_ms, "scanner parked");
                self.schedule_parked_wake(delay, next_token);
            }
            Next::Idle => info!("scanner idle, no queue pointers"),
        }
        Ok(())
    }
}
