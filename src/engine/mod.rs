//! Core engine. The public API for submitting and processing work.
//!
//! The engine owns the storage, the handler registry, the clock and the
//! scheduler. Every state change is one short transaction; the larger
//! protocol (scanner, managers, workers) is a chain of continuations handed
//! to the [`Scheduler`], each of which re-checks its lease before acting.

mod dequeue;
mod enqueue;
mod lease;
mod maintenance;
mod manager;
mod scanner;
mod worker;

pub use maintenance::Watchdog;
pub use scanner::WakeGate;

use std::sync::{Arc, Mutex, MutexGuard};

use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigOverride, EngineConfig};
use crate::error::Result;
use crate::handler::HandlerRegistry;
use crate::model::*;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::storage::{Storage, TxContext};

/// The work engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    storage: Mutex<Storage>,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    /// Highest-precedence config layer, fixed for the engine's lifetime.
    overrides: ConfigOverride,
}

/// Assembles an [`Engine`]. Defaults to the wall clock, the tokio
/// scheduler, an empty registry and no explicit overrides.
pub struct EngineBuilder {
    storage: Storage,
    registry: HandlerRegistry,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn Scheduler>,
    overrides: ConfigOverride,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Explicit config overrides. These beat the stored override row.
    pub fn overrides(mut self, overrides: ConfigOverride) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            inner: Arc::new(Inner {
                storage: Mutex::new(self.storage),
                registry: self.registry,
                clock: self.clock,
                scheduler: self.scheduler,
                overrides: self.overrides,
            }),
        }
    }
}

impl Engine {
    pub fn builder(storage: Storage) -> EngineBuilder {
        EngineBuilder {
            storage,
            registry: HandlerRegistry::new(),
            clock: Arc::new(SystemClock),
            scheduler: Arc::new(TokioScheduler),
            overrides: ConfigOverride::default(),
        }
    }

    /// Create an engine with in-memory storage and default collaborators.
    pub fn in_memory(registry: HandlerRegistry) -> Result<Self> {
        Ok(Self::builder(Storage::in_memory()?).registry(registry).build())
    }

    /// Create an engine backed by a file.
    pub fn open(path: impl AsRef<std::path::Path>, registry: HandlerRegistry) -> Result<Self> {
        Ok(Self::builder(Storage::open(path)?).registry(registry).build())
    }

    /// Run a closure inside one store transaction.
    ///
    /// Commits on `Ok`, rolls back on `Err`. If the closure made work ready
    /// (for example by enqueueing), the scanner is woken after commit.
    pub fn transact<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let now = self.inner.clock.now_ms();
        let (value, effects) = {
            let mut storage = self.storage();
            storage.with_transaction(now, &self.inner.overrides, f)?
        };
        if effects.wake {
            if let Err(e) = self.wake(WakeGate::Always) {
                tracing::warn!(error = %e, "scanner wake failed after commit");
            }
        }
        Ok(value)
    }

    fn storage(&self) -> MutexGuard<'_, Storage> {
        // A panic mid-transaction drops the transaction, which rolls back,
        // so the connection is still usable.
        self.inner
            .storage
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.inner.scheduler.as_ref()
    }

    pub(crate) fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    // -----------------------------------------------------------------------
    // Inspection
    // -----------------------------------------------------------------------

    /// The configuration a transaction started now would see.
    pub fn config(&self) -> Result<EngineConfig> {
        self.transact(|ctx| Ok(ctx.config().clone()))
    }

    pub fn get_item(&self, id: ItemId) -> Result<Option<QueueItem>> {
        self.transact(|ctx| ctx.get_item(id))
    }

    pub fn get_pointer(&self, queue_id: &str) -> Result<Option<QueuePointer>> {
        self.transact(|ctx| ctx.get_pointer(queue_id))
    }

    pub fn scanner_state(&self) -> Result<ScannerState> {
        self.transact(|ctx| ctx.scanner_state())
    }

    pub fn get_queue_stats(&self, queue_id: &str) -> Result<QueueStats> {
        self.transact(|ctx| ctx.queue_stats(queue_id))
    }

    // -----------------------------------------------------------------------
    // Stored config
    // -----------------------------------------------------------------------

    pub fn stored_config(&self) -> Result<Option<ConfigOverride>> {
        self.storage().stored_override()
    }

    /// Persist a partial override. Takes effect from the next transaction.
    pub fn set_stored_config(&self, overrides: &ConfigOverride) -> Result<()> {
        self.transact(|ctx| ctx.set_stored_override(Some(overrides)))?;
        tracing::info!("stored engine config updated");
        Ok(())
    }

    pub fn clear_stored_config(&self) -> Result<()> {
        self.transact(|ctx| ctx.set_stored_override(None))?;
        tracing::info!("stored engine config cleared");
        Ok(())
    }
}
