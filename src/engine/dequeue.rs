//! Atomic peek-and-claim over one queue.

use tracing::debug;

use super::Engine;
use super::lease;
use crate::error::Result;
use crate::model::*;
use crate::storage::TxContext;

impl TxContext<'_> {
    /// Select up to `limit` ready items from `queue_id` and lease each one
    /// for `lease_duration_ms`, all in this transaction.
    ///
    /// Vesting order skips leased items and stops at the first item that is
    /// not yet ready. FIFO order stops at the first item that is either not
    /// ready or leased, and claims only the head, so nothing behind an
    /// outstanding head is handed out.
    /// At most `max_scan_rows` rows are examined; hitting that bound returns
    /// fewer items rather than failing.
    pub fn dequeue(
        &mut self,
        queue_id: &str,
        limit: usize,
        lease_duration_ms: i64,
        order_by: OrderBy,
    ) -> Result<Vec<(QueueItem, LeaseId)>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = self.now();
        let scan_rows = self.config().max_scan_rows;
        let rows = match order_by {
            OrderBy::Vesting => self.items_by_vesting(queue_id, scan_rows)?,
            OrderBy::Fifo => self.items_by_insertion(queue_id, scan_rows)?,
        };

        let mut claimed = Vec::new();
        for mut item in rows {
            if claimed.len() >= limit {
                break;
            }
            let ready = item.vesting_time <= now;
            let leased = item.is_leased(now);
            match order_by {
                OrderBy::Vesting => {
                    if !ready {
                        break;
                    }
                    if leased {
                        continue;
                    }
                }
                OrderBy::Fifo => {
                    if !ready || leased {
                        break;
                    }
                }
            }
            let Some(lease_id) = lease::acquire(&mut item, now, lease_duration_ms) else {
                continue;
            };
            self.update_item(&item)?;
            claimed.push((item, lease_id));
            if order_by == OrderBy::Fifo {
                break;
            }
        }

        debug!(
            queue = queue_id,
            order_by = %order_by,
            claimed = claimed.len(),
            "dequeue"
        );
        Ok(claimed)
    }
}

impl Engine {
    pub fn dequeue(
        &self,
        queue_id: &str,
        limit: usize,
        lease_duration_ms: i64,
        order_by: OrderBy,
    ) -> Result<Vec<(QueueItem, LeaseId)>> {
        self.transact(|ctx| ctx.dequeue(queue_id, limit, lease_duration_ms, order_by))
    }
}
