//! Engine tuning: built-in defaults overlaid by partial overrides.
//!
//! Nothing here is cached. The engine resolves a fresh [`EngineConfig`]
//! inside every transaction, because the stored override may change between
//! transactions.

use crate::error::{Error, Result};
use crate::model::OrderBy;
use crate::retry::RetryBehavior;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Fully resolved engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lease granted to an item when a manager dequeues it.
    pub item_lease_ms: i64,
    /// Lease granted to a pointer while its manager runs.
    pub pointer_lease_ms: i64,
    /// Lease held by the active scanner cycle.
    pub scanner_lease_ms: i64,
    pub scan_backoff_min_ms: i64,
    pub scan_backoff_max_ms: i64,
    /// Longest a parked scanner waits before rechecking on its own.
    pub max_park_ms: i64,
    pub max_concurrent_managers: usize,
    /// Pointers fetched per scan = `max_concurrent_managers * scan_overfetch_factor`.
    pub scan_overfetch_factor: usize,
    pub manager_batch_size: usize,
    /// Upper bound on rows a single dequeue will examine.
    pub max_scan_rows: usize,
    /// How soon a FIFO pointer whose head is leased gets rechecked.
    pub fifo_head_recheck_ms: i64,
    pub default_order_by: OrderBy,
    pub retry_by_default: bool,
    pub default_retry: RetryBehavior,
    pub min_inactive_before_delete_ms: i64,
    pub maintenance_interval_ms: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            item_lease_ms: 60_000,
            pointer_lease_ms: 30_000,
            scanner_lease_ms: 30_000,
            scan_backoff_min_ms: 50,
            scan_backoff_max_ms: 5_000,
            max_park_ms: 60_000,
            max_concurrent_managers: 16,
            scan_overfetch_factor: 4,
            manager_batch_size: 8,
            max_scan_rows: 256,
            fifo_head_recheck_ms: 250,
            default_order_by: OrderBy::Vesting,
            retry_by_default: false,
            default_retry: RetryBehavior::default(),
            min_inactive_before_delete_ms: 60_000,
            maintenance_interval_ms: 60_000,
        }
    }
}

impl EngineConfig {
    /// Resolve with precedence `explicit > stored > built-in default`.
    pub fn resolve(stored: Option<&ConfigOverride>, explicit: &ConfigOverride) -> Self {
        let mut config = Self::default();
        if let Some(stored) = stored {
            stored.apply_to(&mut config);
        }
        explicit.apply_to(&mut config);
        config
    }

    /// Interval between heartbeats for a long-running execution.
    pub fn heartbeat_interval_ms(&self) -> i64 {
        (self.item_lease_ms / 2).max(1)
    }

    pub fn pointer_scan_limit(&self) -> usize {
        self.max_concurrent_managers
            .saturating_mul(self.scan_overfetch_factor.max(1))
    }
}

/// A partial configuration. Unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverride {
    pub item_lease_ms: Option<i64>,
    pub pointer_lease_ms: Option<i64>,
    pub scanner_lease_ms: Option<i64>,
    pub scan_backoff_min_ms: Option<i64>,
    pub scan_backoff_max_ms: Option<i64>,
    pub max_park_ms: Option<i64>,
    pub max_concurrent_managers: Option<usize>,
    pub scan_overfetch_factor: Option<usize>,
    pub manager_batch_size: Option<usize>,
    pub max_scan_rows: Option<usize>,
    pub fifo_head_recheck_ms: Option<i64>,
    pub default_order_by: Option<OrderBy>,
    pub retry_by_default: Option<bool>,
    pub default_retry: Option<RetryBehavior>,
    pub min_inactive_before_delete_ms: Option<i64>,
    pub maintenance_interval_ms: Option<i64>,
}

macro_rules! overlay {
    ($src:expr, $dst:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $src.$field.clone() {
                $dst.$field = value;
            }
        )+
    };
}

impl ConfigOverride {
    fn apply_to(&self, config: &mut EngineConfig) {
        overlay!(
            self,
            config,
            item_lease_ms,
            pointer_lease_ms,
            scanner_lease_ms,
            scan_backoff_min_ms,
            scan_backoff_max_ms,
            max_park_ms,
            max_concurrent_managers,
            scan_overfetch_factor,
            manager_batch_size,
            max_scan_rows,
            fifo_head_recheck_ms,
            default_order_by,
            retry_by_default,
            default_retry,
            min_inactive_before_delete_ms,
            maintenance_interval_ms,
        );
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Parse an override from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad engine config: {e}")))
    }

    /// Load an override from a TOML file.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read engine config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}
