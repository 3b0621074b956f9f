//! Enqueue, batch enqueue and requeue.
//!
//! Inserting work and tightening the queue's pointer happen in the same
//! transaction, so a committed item is always covered by a pointer whose
//! vesting time is no later than the item's.

use std::collections::BTreeMap;

use opentelemetry::KeyValue;
use tracing::{debug, info};

use super::Engine;
use super::lease;
use crate::error::Result;
use crate::model::*;
use crate::storage::TxContext;
use crate::telemetry::metrics;

impl TxContext<'_> {
    /// Insert one item and make its queue visible to the scanner.
    ///
    /// Available to transactional handlers and completion callbacks, which
    /// can fan out further work atomically with their own writes.
    pub fn enqueue(&mut self, new: NewItem) -> Result<ItemId> {
        let item = self.insert_new(&new)?;
        self.note_ready(&item.queue_id, item.vesting_time, new.order_by)?;
        Ok(item.id)
    }

    /// Insert several items, touching each distinct queue's pointer once
    /// with the earliest vesting time seen for it.
    pub fn enqueue_batch(&mut self, items: Vec<NewItem>) -> Result<Vec<ItemId>> {
        let mut ids = Vec::with_capacity(items.len());
        let mut earliest: BTreeMap<String, (i64, Option<OrderBy>)> = BTreeMap::new();

        for new in &items {
            let item = self.insert_new(new)?;
            ids.push(item.id);
            earliest
                .entry(item.queue_id)
                .and_modify(|(vesting, order_by)| {
                    *vesting = (*vesting).min(item.vesting_time);
                    if new.order_by.is_some() {
                        *order_by = new.order_by;
                    }
                })
                .or_insert((item.vesting_time, new.order_by));
        }

        for (queue_id, (vesting, order_by)) in earliest {
            self.note_ready(&queue_id, vesting, order_by)?;
        }
        Ok(ids)
    }

    fn insert_new(&mut self, new: &NewItem) -> Result<QueueItem> {
        let now = self.now();
        let vesting_time = new.vesting_time(now)?;
        let config = self.config();
        let (retry_enabled, retry_behavior) = new
            .retry
            .resolve(config.retry_by_default, config.default_retry);

        let mut item = QueueItem {
            id: ItemId::new(),
            seq: 0,
            queue_id: new.queue_id.clone(),
            payload: new.payload.clone(),
            handler: new.handler.clone(),
            handler_kind: new.handler_kind,
            on_complete: new.on_complete.clone(),
            context: new.context.clone(),
            phase: Phase::Run,
            completion_status: None,
            completion_result: None,
            on_complete_timeout_retries: 0,
            retry_enabled,
            retry_behavior,
            vesting_time,
            lease: None,
            error_count: 0,
            created_at: now,
        };
        item.seq = self.insert_item(&item)?;

        debug!(
            item_id = %item.id,
            queue = %item.queue_id,
            vesting_time,
            "item enqueued"
        );
        metrics::items_enqueued().add(1, &[KeyValue::new("queue", item.queue_id.clone())]);
        Ok(item)
    }

    /// Put a leased item back in line at `vesting_time`.
    ///
    /// The caller has already updated the item's counters; this releases the
    /// lease and tightens the pointer. Returns `false` on a stale token.
    pub(crate) fn requeue(&mut self, mut item: QueueItem, lease_id: LeaseId, vesting_time: i64) -> Result<bool> {
        if !lease::release(&mut item, lease_id, vesting_time) {
            lease::record_conflict("item", "requeue");
            return Ok(false);
        }
        self.update_item(&item)?;
        self.note_ready(&item.queue_id, vesting_time, None)?;
        Ok(true)
    }

    /// Record that `queue_id` has work ready at `vesting_time`.
    ///
    /// Creates the pointer if missing. Otherwise only ever moves its vesting
    /// time earlier, and leaves a leased pointer alone: its manager will
    /// recompute the next vesting time when it releases.
    pub(crate) fn note_ready(
        &mut self,
        queue_id: &str,
        vesting_time: i64,
        order_by: Option<OrderBy>,
    ) -> Result<()> {
        let now = self.now();
        match self.get_pointer(queue_id)? {
            None => {
                self.put_pointer(&QueuePointer {
                    queue_id: queue_id.to_string(),
                    vesting_time,
                    lease: None,
                    last_active_time: now,
                    order_by,
                })?;
                info!(queue = queue_id, vesting_time, "queue pointer created");
                self.request_wake();
            }
            Some(mut pointer) => {
                let tighten = !pointer.is_leased(now) && vesting_time < pointer.vesting_time;
                if tighten {
                    debug!(
                        queue = queue_id,
                        from = pointer.vesting_time,
                        to = vesting_time,
                        "queue pointer tightened"
                    );
                    pointer.vesting_time = vesting_time;
                    self.request_wake();
                }
                if order_by.is_some() {
                    pointer.order_by = order_by;
                }
                pointer.last_active_time = now;
                self.put_pointer(&pointer)?;
            }
        }
        Ok(())
    }

    /// After an item leaves the ready set for good, let a FIFO queue's next
    /// item through without waiting for the head recheck.
    pub(crate) fn settle_queue(&mut self, queue_id: &str) -> Result<()> {
        let Some(pointer) = self.get_pointer(queue_id)? else {
            return Ok(());
        };
        let order_by = pointer.order_by.unwrap_or(self.config().default_order_by);
        if order_by == OrderBy::Fifo && self.queue_has_items(queue_id)? {
            let now = self.now();
            self.note_ready(queue_id, now, None)?;
        }
        Ok(())
    }
}

impl Engine {
    /// Submit one item. Returns its id.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSchedule`](crate::Error::InvalidSchedule) if both a
    /// delay and an absolute run time were given.
    pub fn enqueue(&self, new: NewItem) -> Result<ItemId> {
        self.transact(|ctx| ctx.enqueue(new))
    }

    /// Submit several items atomically. Either all are inserted or none.
    pub fn enqueue_batch(&self, items: Vec<NewItem>) -> Result<Vec<ItemId>> {
        self.transact(|ctx| ctx.enqueue_batch(items))
    }
}
