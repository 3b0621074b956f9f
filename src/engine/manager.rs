//! Per-queue manager: drain one claimed pointer, then hand it back.

use std::time::Duration;

use tracing::{debug, warn};

use super::Engine;
use super::lease;
use crate::error::Result;
use crate::model::*;
use crate::storage::TxContext;

impl TxContext<'_> {
    /// Release a manager's pointer lease, computing when the queue next
    /// needs attention. `found_work` marks the queue active now.
    pub(crate) fn finalize_pointer(
        &mut self,
        queue_id: &str,
        lease_id: LeaseId,
        order_by: OrderBy,
        found_work: bool,
    ) -> Result<bool> {
        let now = self.now();
        let next = match order_by {
            // Leased items carry their expiry as vesting time, so the
            // smallest vesting time covers both ready items and leases that
            // may lapse.
            OrderBy::Vesting => self
                .items_by_vesting(queue_id, 1)?
                .first()
                .map(|item| item.vesting_time),
            OrderBy::Fifo => self.items_by_insertion(queue_id, 1)?.first().map(|head| {
                match head.lease {
                    Some(lease) if lease.is_active(now) => lease
                        .expiry
                        .min(now.saturating_add(self.config().fifo_head_recheck_ms)),
                    _ => head.vesting_time,
                }
            }),
        };
        let next = next.unwrap_or_else(|| {
            now.saturating_add(self.config().min_inactive_before_delete_ms)
        });

        let Some(mut pointer) = self.get_pointer(queue_id)? else {
            return Ok(false);
        };
        if !lease::release(&mut pointer, lease_id, next) {
            lease::record_conflict("pointer", "finalize");
            return Ok(false);
        }
        if found_work {
            pointer.last_active_time = now;
        }
        self.put_pointer(&pointer)?;
        debug!(queue = queue_id, next_vesting = next, found_work, "pointer finalized");
        Ok(true)
    }
}

impl Engine {
    pub(crate) fn spawn_manager(&self, queue_id: String, lease_id: LeaseId) {
        let engine = self.clone();
        self.scheduler().schedule(
            Duration::ZERO,
            "manager",
            Box::pin(async move {
                if let Err(e) = engine.run_manager(&queue_id, lease_id) {
                    warn!(queue = %queue_id, error = %e, "manager failed");
                }
            }),
        );
    }

    /// Dequeue a batch for the queue, dispatch a worker per item and
    /// release the pointer, all under the pointer lease. Returns the number
    /// of items dispatched; a stale lease dispatches nothing.
    pub fn run_manager(&self, queue_id: &str, lease_id: LeaseId) -> Result<usize> {
        let claimed = self.transact(|ctx| {
            let Some(pointer) = ctx.get_pointer(queue_id)? else {
                return Ok(None);
            };
            if !pointer.lease.is_some_and(|lease| lease.id == lease_id) {
                lease::record_conflict("pointer", "manage");
                return Ok(None);
            }
            let order_by = pointer.order_by.unwrap_or(ctx.config().default_order_by);
            let batch = ctx.config().manager_batch_size;
            let item_lease_ms = ctx.config().item_lease_ms;

            let claimed = ctx.dequeue(queue_id, batch, item_lease_ms, order_by)?;
            ctx.finalize_pointer(queue_id, lease_id, order_by, !claimed.is_empty())?;
            Ok(Some(claimed))
        })?;

        let Some(claimed) = claimed else {
            debug!(queue = queue_id, "manager lease stale, skipping");
            return Ok(0);
        };
        for (item, item_lease) in &claimed {
            self.spawn_worker(item.id, *item_lease);
        }
        Ok(claimed.len())
    }
}
