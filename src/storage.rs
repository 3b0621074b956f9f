//! SQLite storage layer.
//!
//! Single source of truth for queue items, queue pointers, the scanner row
//! and the stored config override. Every engine operation is one closure run
//! by [`Storage::with_transaction`]; the transaction is the only atomicity
//! boundary the engine relies on.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::time::Duration;

use crate::config::{ConfigOverride, EngineConfig};
use crate::error::{Error, Result};
use crate::model::*;
use crate::retry::RetryBehavior;

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// Carries the instant the transaction started at and the engine config
/// resolved for it, so every decision inside one transaction sees the same
/// `now` and the same tuning.
pub struct TxContext<'a> {
    tx: &'a Connection,
    now: i64,
    config: EngineConfig,
    wake_requested: bool,
}

/// Side effects a committed transaction asks the engine to perform.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TxEffects {
    pub wake: bool,
}

const ITEM_COLUMNS: &str = "seq, id, queue_id, payload, handler, handler_kind, on_complete, \
     context, phase, completion_status, completion_result, on_complete_timeout_retries, \
     retry_enabled, retry_behavior, vesting_time, lease_id, lease_expiry, error_count, created_at";

const POINTER_COLUMNS: &str =
    "queue_id, vesting_time, lease_id, lease_expiry, last_active_time, order_by";

impl Storage {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.init()?;
        Ok(storage)
    }

    fn init(&mut self) -> Result<()> {
        // WAL mode for concurrent readers
        self.conn
            .query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        self.conn.busy_timeout(Duration::from_secs(5))?;

        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS queue_items (
                seq                         INTEGER PRIMARY KEY AUTOINCREMENT,
                id                          TEXT NOT NULL UNIQUE,
                queue_id                    TEXT NOT NULL,
                payload                     TEXT NOT NULL,
                handler                     TEXT NOT NULL,
                handler_kind                TEXT NOT NULL,
                on_complete                 TEXT,
                context                     TEXT,
                phase                       TEXT NOT NULL DEFAULT 'run',
                completion_status           TEXT,
                completion_result           TEXT,
                on_complete_timeout_retries INTEGER NOT NULL DEFAULT 0,
                retry_enabled               INTEGER NOT NULL,
                retry_behavior              TEXT NOT NULL,
                vesting_time                INTEGER NOT NULL,
                lease_id                    TEXT,
                lease_expiry                INTEGER,
                error_count                 INTEGER NOT NULL DEFAULT 0,
                created_at                  INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_items_vesting
                ON queue_items(queue_id, vesting_time, seq);
            CREATE INDEX IF NOT EXISTS idx_items_order
                ON queue_items(queue_id, seq);

            CREATE TABLE IF NOT EXISTS queue_pointers (
                queue_id         TEXT PRIMARY KEY,
                vesting_time     INTEGER NOT NULL,
                lease_id         TEXT,
                lease_expiry     INTEGER,
                last_active_time INTEGER NOT NULL,
                order_by         TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_pointers_vesting
                ON queue_pointers(vesting_time);

            CREATE TABLE IF NOT EXISTS scanner_state (
                id           INTEGER PRIMARY KEY CHECK (id = 1),
                lease_id     TEXT,
                lease_expiry INTEGER,
                last_run_at  INTEGER,
                continuation TEXT,
                next_run_at  INTEGER,
                backoff_ms   INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS engine_config (
                id        INTEGER PRIMARY KEY CHECK (id = 1),
                overrides TEXT NOT NULL
            );
            ",
        )?;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within a SQLite transaction.
    ///
    /// The transaction commits if the closure returns Ok, rolls back on Err.
    /// The write lock is taken up front so read-then-write lease checks
    /// cannot interleave with another connection.
    pub(crate) fn with_transaction<F, T>(
        &mut self,
        now: i64,
        explicit: &ConfigOverride,
        f: F,
    ) -> Result<(T, TxEffects)>
    where
        F: FnOnce(&mut TxContext) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = stored_override_on(&tx)?;
        let mut ctx = TxContext {
            tx: &tx,
            now,
            config: EngineConfig::resolve(stored.as_ref(), explicit),
            wake_requested: false,
        };
        let result = f(&mut ctx)?;
        let effects = TxEffects {
            wake: ctx.wake_requested,
        };
        tx.commit()?;
        Ok((result, effects))
    }

    /// Read the stored config override outside any engine transaction.
    pub fn stored_override(&self) -> Result<Option<ConfigOverride>> {
        stored_override_on(&self.conn)
    }
}

impl TxContext<'_> {
    /// The instant this transaction runs at, in epoch milliseconds.
    pub fn now(&self) -> i64 {
        self.now
    }

    /// The engine configuration resolved for this transaction.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Raw access for handlers that keep their own tables in the same store.
    pub fn connection(&self) -> &Connection {
        self.tx
    }

    /// Ask the engine to wake the scanner once this transaction commits.
    pub(crate) fn request_wake(&mut self) {
        self.wake_requested = true;
    }

    // -----------------------------------------------------------------------
    // Queue items
    // -----------------------------------------------------------------------

    /// Insert an item and return its insertion sequence number.
    pub(crate) fn insert_item(&self, item: &QueueItem) -> Result<i64> {
        self.tx.execute(
            "INSERT INTO queue_items (
                id, queue_id, payload, handler, handler_kind, on_complete, context,
                phase, completion_status, completion_result, on_complete_timeout_retries,
                retry_enabled, retry_behavior, vesting_time, lease_id, lease_expiry,
                error_count, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                item.id.to_string(),
                item.queue_id,
                serde_json::to_string(&item.payload)?,
                item.handler.as_str(),
                item.handler_kind.as_str(),
                item.on_complete.as_ref().map(HandlerRef::as_str),
                item.context.as_ref().map(serde_json::to_string).transpose()?,
                item.phase.as_str(),
                item.completion_status.map(CompletionStatus::as_str),
                item.completion_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                item.on_complete_timeout_retries,
                item.retry_enabled,
                serde_json::to_string(&item.retry_behavior)?,
                item.vesting_time,
                item.lease.map(|l| l.id.to_string()),
                item.lease.map(|l| l.expiry),
                item.error_count,
                item.created_at,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Get an item by ID.
    pub fn get_item(&self, id: ItemId) -> Result<Option<QueueItem>> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ?1");
        Ok(self
            .tx
            .query_row(&sql, params![id.to_string()], row_to_item)
            .optional()?)
    }

    /// Write back every mutable column of an item.
    pub(crate) fn update_item(&self, item: &QueueItem) -> Result<()> {
        let changed = self.tx.execute(
            "UPDATE queue_items SET
                phase = ?1, completion_status = ?2, completion_result = ?3,
                on_complete_timeout_retries = ?4, vesting_time = ?5,
                lease_id = ?6, lease_expiry = ?7, error_count = ?8
             WHERE id = ?9",
            params![
                item.phase.as_str(),
                item.completion_status.map(CompletionStatus::as_str),
                item.completion_result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                item.on_complete_timeout_retries,
                item.vesting_time,
                item.lease.map(|l| l.id.to_string()),
                item.lease.map(|l| l.expiry),
                item.error_count,
                item.id.to_string(),
            ],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("queue item {}", item.id)));
        }
        Ok(())
    }

    pub(crate) fn delete_item(&self, id: ItemId) -> Result<()> {
        self.tx.execute(
            "DELETE FROM queue_items WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Items of one queue ordered by vesting time, then insertion order.
    pub(crate) fn items_by_vesting(&self, queue_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items
                 WHERE queue_id = ?1 ORDER BY vesting_time ASC, seq ASC LIMIT ?2"
            ),
            queue_id,
            limit,
        )
    }

    /// Items of one queue in insertion order.
    pub(crate) fn items_by_insertion(&self, queue_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        self.query_items(
            &format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items
                 WHERE queue_id = ?1 ORDER BY seq ASC LIMIT ?2"
            ),
            queue_id,
            limit,
        )
    }

    fn query_items(&self, sql: &str, queue_id: &str, limit: usize) -> Result<Vec<QueueItem>> {
        let mut stmt = self.tx.prepare(sql)?;
        let items = stmt
            .query_map(params![queue_id, limit as i64], row_to_item)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub(crate) fn queue_has_items(&self, queue_id: &str) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM queue_items WHERE queue_id = ?1 LIMIT 1",
                params![queue_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Count items in a queue, split by whether they are under an unexpired lease.
    pub fn queue_stats(&self, queue_id: &str) -> Result<QueueStats> {
        let (total, leased): (i64, i64) = self.tx.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN lease_id IS NOT NULL AND lease_expiry > ?2 THEN 1 ELSE 0 END), 0)
             FROM queue_items WHERE queue_id = ?1",
            params![queue_id, self.now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(QueueStats {
            item_count: total as u64,
            pending_count: (total - leased) as u64,
            leased_count: leased as u64,
        })
    }

    // -----------------------------------------------------------------------
    // Queue pointers
    // -----------------------------------------------------------------------

    pub fn get_pointer(&self, queue_id: &str) -> Result<Option<QueuePointer>> {
        let sql = format!("SELECT {POINTER_COLUMNS} FROM queue_pointers WHERE queue_id = ?1");
        Ok(self
            .tx
            .query_row(&sql, params![queue_id], row_to_pointer)
            .optional()?)
    }

    /// Insert or overwrite a pointer row.
    pub(crate) fn put_pointer(&self, pointer: &QueuePointer) -> Result<()> {
        self.tx.execute(
            "INSERT INTO queue_pointers (queue_id, vesting_time, lease_id, lease_expiry, last_active_time, order_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (queue_id) DO UPDATE SET
                vesting_time = excluded.vesting_time,
                lease_id = excluded.lease_id,
                lease_expiry = excluded.lease_expiry,
                last_active_time = excluded.last_active_time,
                order_by = excluded.order_by",
            params![
                pointer.queue_id,
                pointer.vesting_time,
                pointer.lease.map(|l| l.id.to_string()),
                pointer.lease.map(|l| l.expiry),
                pointer.last_active_time,
                pointer.order_by.map(OrderBy::as_str),
            ],
        )?;
        Ok(())
    }

    pub(crate) fn delete_pointer(&self, queue_id: &str) -> Result<()> {
        self.tx.execute(
            "DELETE FROM queue_pointers WHERE queue_id = ?1",
            params![queue_id],
        )?;
        Ok(())
    }

    /// Pointers whose vesting time has arrived, earliest first.
    pub(crate) fn due_pointers(&self, limit: usize) -> Result<Vec<QueuePointer>> {
        let sql = format!(
            "SELECT {POINTER_COLUMNS} FROM queue_pointers
             WHERE vesting_time <= ?1 ORDER BY vesting_time ASC LIMIT ?2"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let pointers = stmt
            .query_map(params![self.now, limit as i64], row_to_pointer)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pointers)
    }

    /// The pointer with the earliest vesting time, if any pointer exists.
    pub(crate) fn earliest_pointer(&self) -> Result<Option<QueuePointer>> {
        let sql = format!(
            "SELECT {POINTER_COLUMNS} FROM queue_pointers ORDER BY vesting_time ASC LIMIT 1"
        );
        Ok(self.tx.query_row(&sql, [], row_to_pointer).optional()?)
    }

    /// Unleased pointers of empty queues last active before `cutoff`,
    /// least recently active first. Vesting time plays no part: a manager
    /// re-parks an empty queue's pointer into the future on every visit.
    pub(crate) fn idle_pointers(&self, cutoff: i64, limit: usize) -> Result<Vec<QueuePointer>> {
        let sql = format!(
            "SELECT {POINTER_COLUMNS} FROM queue_pointers p
             WHERE p.last_active_time < ?1
               AND (p.lease_id IS NULL OR p.lease_expiry <= ?2)
               AND NOT EXISTS (SELECT 1 FROM queue_items i WHERE i.queue_id = p.queue_id)
             ORDER BY p.last_active_time ASC LIMIT ?3"
        );
        let mut stmt = self.tx.prepare(&sql)?;
        let pointers = stmt
            .query_map(params![cutoff, self.now, limit as i64], row_to_pointer)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(pointers)
    }

    pub(crate) fn any_pointer_leased(&self) -> Result<bool> {
        let found: Option<i64> = self
            .tx
            .query_row(
                "SELECT 1 FROM queue_pointers
                 WHERE lease_id IS NOT NULL AND lease_expiry > ?1 LIMIT 1",
                params![self.now],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    // -----------------------------------------------------------------------
    // Scanner state
    // -----------------------------------------------------------------------

    pub fn scanner_state(&self) -> Result<ScannerState> {
        let state = self
            .tx
            .query_row(
                "SELECT lease_id, lease_expiry, last_run_at, continuation, next_run_at, backoff_ms
                 FROM scanner_state WHERE id = 1",
                [],
                |row| {
                    let continuation: Option<String> = row.get(3)?;
                    Ok(ScannerState {
                        lease: lease_from_columns(row, 0, 1)?,
                        last_run_at: row.get(2)?,
                        continuation: continuation
                            .map(|s| uuid::Uuid::parse_str(&s).map_err(|e| conversion_err(3, e)))
                            .transpose()?,
                        next_run_at: row.get(4)?,
                        backoff_ms: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    pub(crate) fn put_scanner_state(&self, state: &ScannerState) -> Result<()> {
        self.tx.execute(
            "INSERT INTO scanner_state (id, lease_id, lease_expiry, last_run_at, continuation, next_run_at, backoff_ms)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                lease_id = excluded.lease_id,
                lease_expiry = excluded.lease_expiry,
                last_run_at = excluded.last_run_at,
                continuation = excluded.continuation,
                next_run_at = excluded.next_run_at,
                backoff_ms = excluded.backoff_ms",
            params![
                state.lease.map(|l| l.id.to_string()),
                state.lease.map(|l| l.expiry),
                state.last_run_at,
                state.continuation.map(|c| c.to_string()),
                state.next_run_at,
                state.backoff_ms,
            ],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Stored config override
    // -----------------------------------------------------------------------

    pub fn stored_override(&self) -> Result<Option<ConfigOverride>> {
        stored_override_on(self.tx)
    }

    /// Replace the stored override; `None` clears it.
    pub(crate) fn set_stored_override(&mut self, overrides: Option<&ConfigOverride>) -> Result<()> {
        match overrides {
            Some(overrides) => {
                self.tx.execute(
                    "INSERT INTO engine_config (id, overrides) VALUES (1, ?1)
                     ON CONFLICT (id) DO UPDATE SET overrides = excluded.overrides",
                    params![serde_json::to_string(overrides)?],
                )?;
            }
            None => {
                self.tx.execute("DELETE FROM engine_config WHERE id = 1", [])?;
            }
        }
        Ok(())
    }
}

fn stored_override_on(conn: &Connection) -> Result<Option<ConfigOverride>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT overrides FROM engine_config WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(Error::from))
        .transpose()
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

fn conversion_err<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_err(idx, e))
}

fn parse_optional_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: std::str::FromStr<Err = Error>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn json_column(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| serde_json::from_str(&s).map_err(|e| conversion_err(idx, e)))
        .transpose()
}

fn lease_from_columns(
    row: &rusqlite::Row,
    id_idx: usize,
    expiry_idx: usize,
) -> rusqlite::Result<Option<Lease>> {
    let id: Option<String> = row.get(id_idx)?;
    let expiry: Option<i64> = row.get(expiry_idx)?;
    match (id, expiry) {
        (Some(id), Some(expiry)) => {
            let uuid = uuid::Uuid::parse_str(&id).map_err(|e| conversion_err(id_idx, e))?;
            Ok(Some(Lease {
                id: LeaseId(uuid),
                expiry,
            }))
        }
        _ => Ok(None),
    }
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<QueueItem> {
    let retry_raw: String = row.get(13)?;
    let retry_behavior: RetryBehavior =
        serde_json::from_str(&retry_raw).map_err(|e| conversion_err(13, e))?;

    Ok(QueueItem {
        seq: row.get(0)?,
        id: parse_column(row, 1)?,
        queue_id: row.get(2)?,
        payload: json_column(row, 3)?.unwrap_or(serde_json::Value::Null),
        handler: HandlerRef(row.get(4)?),
        handler_kind: parse_column(row, 5)?,
        on_complete: row.get::<_, Option<String>>(6)?.map(HandlerRef),
        context: json_column(row, 7)?,
        phase: parse_column(row, 8)?,
        completion_status: parse_optional_column(row, 9)?,
        completion_result: json_column(row, 10)?,
        on_complete_timeout_retries: row.get(11)?,
        retry_enabled: row.get(12)?,
        retry_behavior,
        vesting_time: row.get(14)?,
        lease: lease_from_columns(row, 15, 16)?,
        error_count: row.get(17)?,
        created_at: row.get(18)?,
    })
}

fn row_to_pointer(row: &rusqlite::Row) -> rusqlite::Result<QueuePointer> {
    Ok(QueuePointer {
        queue_id: row.get(0)?,
        vesting_time: row.get(1)?,
        lease: lease_from_columns(row, 2, 3)?,
        last_active_time: row.get(4)?,
        order_by: parse_optional_column(row, 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_item(queue_id: &str, vesting_time: i64) -> QueueItem {
        QueueItem {
            id: ItemId::new(),
            seq: 0,
            queue_id: queue_id.to_string(),
            payload: json!({ "n": 1 }),
            handler: HandlerRef::new("work"),
            handler_kind: HandlerKind::NonTransactional,
            on_complete: Some(HandlerRef::new("done")),
            context: Some(json!(["ctx"])),
            phase: Phase::Run,
            completion_status: None,
            completion_result: None,
            on_complete_timeout_retries: 0,
            retry_enabled: true,
            retry_behavior: RetryBehavior::default(),
            vesting_time,
            lease: None,
            error_count: 0,
            created_at: 0,
        }
    }

    #[test]
    fn item_row_survives_storage() {
        let mut storage = Storage::in_memory().unwrap();
        let mut item = sample_item("q", 10);
        let (stored, _) = storage
            .with_transaction(0, &ConfigOverride::default(), |ctx| {
                item.seq = ctx.insert_item(&item)?;
                item.lease = Some(Lease {
                    id: LeaseId::new(),
                    expiry: 99,
                });
                item.completion_status = Some(CompletionStatus::Failure);
                ctx.update_item(&item)?;
                ctx.get_item(item.id)
            })
            .unwrap();
        assert_eq!(stored, Some(item));
    }

    #[test]
    fn vesting_scan_orders_by_time_then_insertion() {
        let mut storage = Storage::in_memory().unwrap();
        let (ids, _) = storage
            .with_transaction(0, &ConfigOverride::default(), |ctx| {
                let late = sample_item("q", 30);
                let early = sample_item("q", 10);
                let tied = sample_item("q", 10);
                let other = sample_item("other", 0);
                for item in [&late, &early, &tied, &other] {
                    ctx.insert_item(item)?;
                }
                let by_vesting: Vec<ItemId> =
                    ctx.items_by_vesting("q", 10)?.iter().map(|i| i.id).collect();
                let by_insertion: Vec<ItemId> =
                    ctx.items_by_insertion("q", 10)?.iter().map(|i| i.id).collect();
                assert_eq!(by_vesting, vec![early.id, tied.id, late.id]);
                assert_eq!(by_insertion, vec![late.id, early.id, tied.id]);
                Ok(by_vesting)
            })
            .unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn failed_closure_rolls_back() {
        let mut storage = Storage::in_memory().unwrap();
        let item = sample_item("q", 0);
        let result: Result<((), TxEffects)> =
            storage.with_transaction(0, &ConfigOverride::default(), |ctx| {
                ctx.insert_item(&item)?;
                Err(Error::Other("boom".to_string()))
            });
        assert!(result.is_err());

        let (found, _) = storage
            .with_transaction(0, &ConfigOverride::default(), |ctx| ctx.get_item(item.id))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn stored_override_feeds_resolved_config() {
        let mut storage = Storage::in_memory().unwrap();
        let overrides = ConfigOverride {
            manager_batch_size: Some(3),
            ..Default::default()
        };
        storage
            .with_transaction(0, &ConfigOverride::default(), |ctx| {
                ctx.set_stored_override(Some(&overrides))
            })
            .unwrap();

        let (batch, _) = storage
            .with_transaction(0, &ConfigOverride::default(), |ctx| {
                Ok(ctx.config().manager_batch_size)
            })
            .unwrap();
        assert_eq!(batch, 3);
        assert_eq!(storage.stored_override().unwrap(), Some(overrides));
    }
}
