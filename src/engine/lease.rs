//! Lease protocol: token-fenced acquire, renew and release.
//!
//! Each operation is a compare-and-act inside the caller's transaction. A
//! token mismatch writes nothing and reports `false`/`None`; late or
//! concurrent callers are expected, so a mismatch is never an error.

use opentelemetry::KeyValue;

use super::Engine;
use crate::error::Result;
use crate::model::*;
use crate::storage::TxContext;
use crate::telemetry::metrics;

/// A row that can be claimed under a lease.
pub(crate) trait Leasable {
    fn lease(&self) -> Option<Lease>;
    fn set_lease(&mut self, lease: Option<Lease>);

    /// Rows that take part in ready scans alias their sort key to the lease
    /// expiry, hiding them from selection while leased.
    fn set_vesting_time(&mut self, _at: i64) {}
}

impl Leasable for QueueItem {
    fn lease(&self) -> Option<Lease> {
        self.lease
    }

    fn set_lease(&mut self, lease: Option<Lease>) {
        self.lease = lease;
    }

    fn set_vesting_time(&mut self, at: i64) {
        self.vesting_time = at;
    }
}

impl Leasable for QueuePointer {
    fn lease(&self) -> Option<Lease> {
        self.lease
    }

    fn set_lease(&mut self, lease: Option<Lease>) {
        self.lease = lease;
    }

    fn set_vesting_time(&mut self, at: i64) {
        self.vesting_time = at;
    }
}

impl Leasable for ScannerState {
    fn lease(&self) -> Option<Lease> {
        self.lease
    }

    fn set_lease(&mut self, lease: Option<Lease>) {
        self.lease = lease;
    }
}

/// Claim `row` if it holds no unexpired lease.
pub(crate) fn acquire<T: Leasable>(row: &mut T, now: i64, duration_ms: i64) -> Option<LeaseId> {
    if row.lease().is_some_and(|lease| lease.is_active(now)) {
        return None;
    }
    let lease = Lease {
        id: LeaseId::new(),
        expiry: now.saturating_add(duration_ms),
    };
    row.set_lease(Some(lease));
    row.set_vesting_time(lease.expiry);
    Some(lease.id)
}

/// Extend the lease if `lease_id` is still the current token.
pub(crate) fn renew<T: Leasable>(row: &mut T, lease_id: LeaseId, now: i64, duration_ms: i64) -> bool {
    match row.lease() {
        Some(lease) if lease.id == lease_id => {
            let expiry = now.saturating_add(duration_ms);
            row.set_lease(Some(Lease { id: lease_id, expiry }));
            row.set_vesting_time(expiry);
            true
        }
        _ => false,
    }
}

/// Drop the lease if `lease_id` is still the current token, making the row
/// ready again at `next_vesting`.
pub(crate) fn release<T: Leasable>(row: &mut T, lease_id: LeaseId, next_vesting: i64) -> bool {
    match row.lease() {
        Some(lease) if lease.id == lease_id => {
            row.set_lease(None);
            row.set_vesting_time(next_vesting);
            true
        }
        _ => false,
    }
}

pub(crate) fn record_conflict(target: &'static str, operation: &'static str) {
    tracing::debug!(target_row = target, operation, "lease token mismatch");
    metrics::lease_conflicts().add(
        1,
        &[
            KeyValue::new("target", target),
            KeyValue::new("operation", operation),
        ],
    );
}

impl TxContext<'_> {
    pub fn obtain_item_lease(&mut self, item_id: ItemId, duration_ms: i64) -> Result<Option<LeaseId>> {
        let Some(mut item) = self.get_item(item_id)? else {
            return Ok(None);
        };
        let Some(lease_id) = acquire(&mut item, self.now(), duration_ms) else {
            record_conflict("item", "obtain");
            return Ok(None);
        };
        self.update_item(&item)?;
        Ok(Some(lease_id))
    }

    pub fn extend_item_lease(
        &mut self,
        item_id: ItemId,
        lease_id: LeaseId,
        duration_ms: i64,
    ) -> Result<bool> {
        let Some(mut item) = self.get_item(item_id)? else {
            return Ok(false);
        };
        if !renew(&mut item, lease_id, self.now(), duration_ms) {
            record_conflict("item", "extend");
            return Ok(false);
        }
        self.update_item(&item)?;
        Ok(true)
    }

    pub fn release_item_lease(
        &mut self,
        item_id: ItemId,
        lease_id: LeaseId,
        next_vesting: i64,
    ) -> Result<bool> {
        let Some(mut item) = self.get_item(item_id)? else {
            return Ok(false);
        };
        if !release(&mut item, lease_id, next_vesting) {
            record_conflict("item", "release");
            return Ok(false);
        }
        self.update_item(&item)?;
        Ok(true)
    }

    pub fn obtain_pointer_lease(&mut self, queue_id: &str, duration_ms: i64) -> Result<Option<LeaseId>> {
        let Some(mut pointer) = self.get_pointer(queue_id)? else {
            return Ok(None);
        };
        let Some(lease_id) = acquire(&mut pointer, self.now(), duration_ms) else {
            record_conflict("pointer", "obtain");
            return Ok(None);
        };
        self.put_pointer(&pointer)?;
        Ok(Some(lease_id))
    }

    pub fn release_pointer_lease(
        &mut self,
        queue_id: &str,
        lease_id: LeaseId,
        next_vesting: i64,
    ) -> Result<bool> {
        let Some(mut pointer) = self.get_pointer(queue_id)? else {
            return Ok(false);
        };
        if !release(&mut pointer, lease_id, next_vesting) {
            record_conflict("pointer", "release");
            return Ok(false);
        }
        self.put_pointer(&pointer)?;
        Ok(true)
    }
}

impl Engine {
    /// Claim an item outside the normal dequeue path.
    pub fn obtain_item_lease(&self, item_id: ItemId, duration_ms: i64) -> Result<Option<LeaseId>> {
        self.transact(|ctx| ctx.obtain_item_lease(item_id, duration_ms))
    }

    /// Heartbeat: push the lease (and the item's vesting time) out by
    /// `duration_ms` from now.
    pub fn extend_item_lease(&self, item_id: ItemId, lease_id: LeaseId, duration_ms: i64) -> Result<bool> {
        self.transact(|ctx| ctx.extend_item_lease(item_id, lease_id, duration_ms))
    }

    pub fn release_pointer_lease(&self, queue_id: &str, lease_id: LeaseId, next_vesting: i64) -> Result<bool> {
        self.transact(|ctx| ctx.release_pointer_lease(queue_id, lease_id, next_vesting))
    }
}
