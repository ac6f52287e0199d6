//! # The Durable Store
//!
//! The relational sink for ingested events and the source of truth for all
//! downstream reads. One row per event, partitioned logically by tenant id,
//! plus a cursor table tracking each consumer's resumption point.
//!
//! ## The Durability Contract
//!
//! [`LogStore::commit_row`] inserts the row and advances the consumer's
//! cursor in a single transaction. Either both land or neither does, which
//! is what makes the pipeline's central invariant hold across crashes:
//!
//! > The cursor never advances past an entry that has not been durably
//! > written to the store.
//!
//! A crash between "row committed" and "cursor advanced" cannot happen,
//! because there is no such gap.
//!
//! ## The Sink Seam
//!
//! The consumer talks to the store through the [`LogSink`] trait rather than
//! a concrete handle. Production uses [`SqliteSink`] (lazily opened, can be
//! dropped and reopened after an outage); tests inject failing sinks to
//! exercise the retry path without a real outage.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use tracing::info;

use crate::codec::current_time_ms;
use crate::error::{Error, Result};
use crate::schema::StoreDb;
use crate::types::{EntryId, LogEvent, LogRow, TenantId};

// =============================================================================
// The Store
// =============================================================================

/// An open durable store, owning its write connection.
///
/// # Ownership
///
/// One `LogStore` = one SQLite connection, owned exclusively by whoever
/// holds the value (in the pipeline: the consumer's sink). There is no
/// shared global handle; everything is passed by value.
#[derive(Debug)]
pub struct LogStore {
    conn: Connection,
}

impl LogStore {
    /// Opens a store database file, creating and initializing it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            conn: StoreDb::open(path)?.into_connection(),
        })
    }

    /// Creates an in-memory store for unit tests.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: StoreDb::open_in_memory()?.into_connection(),
        })
    }

    /// Cheap liveness probe, used by [`SqliteSink`] to decide whether an
    /// existing connection is still usable after an error.
    pub fn ping(&self) -> Result<()> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    /// Loads the persisted cursor for a consumer, if one exists.
    pub fn load_cursor(&self, consumer: &str) -> Result<Option<EntryId>> {
        let cursor = self
            .conn
            .query_row(
                "SELECT time_ms, seq FROM ingest_cursors WHERE consumer = ?1",
                [consumer],
                |row| {
                    let time_ms: i64 = row.get(0)?;
                    let seq: i64 = row.get(1)?;
                    Ok(EntryId::from_parts(time_ms as u64, seq as u64))
                },
            )
            .ok();
        Ok(cursor)
    }

    /// Commits one row and the advanced cursor in a single transaction.
    ///
    /// # Errors
    ///
    /// [`Error::MissingTenant`] if the event has no usable tenant id. The
    /// consumer validates first, so this check is redundant by design: the
    /// writer boundary is the last place a tenant-less row can be stopped
    /// before it reaches disk.
    pub fn commit_row(&mut self, consumer: &str, event: &LogEvent, cursor: EntryId) -> Result<()> {
        if event.tenant().is_none() {
            return Err(Error::MissingTenant);
        }

        let now = current_time_ms();
        let tx = self.conn.transaction()?;
        insert_row(&tx, event, now)?;
        upsert_cursor(&tx, consumer, cursor, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Advances the cursor without writing a row (skipped entry).
    ///
    /// Durable for the same reason row commits are: a restart must not
    /// re-observe an entry the consumer already decided to drop.
    pub fn commit_skip(&mut self, consumer: &str, cursor: EntryId) -> Result<()> {
        let now = current_time_ms();
        let tx = self.conn.transaction()?;
        upsert_cursor(&tx, consumer, cursor, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Commits a batch of rows plus the final cursor in one transaction.
    ///
    /// All-or-nothing: either every row becomes visible and the cursor lands
    /// on `cursor`, or nothing changes. That property is what makes batching
    /// a safe optimization — after a failure the consumer knows exactly
    /// which rows committed (none), so duplication stays bounded.
    pub fn commit_batch(
        &mut self,
        consumer: &str,
        events: &[LogEvent],
        cursor: EntryId,
    ) -> Result<()> {
        if events.iter().any(|e| e.tenant().is_none()) {
            return Err(Error::MissingTenant);
        }

        let now = current_time_ms();
        let tx = self.conn.transaction()?;
        for event in events {
            insert_row(&tx, event, now)?;
        }
        upsert_cursor(&tx, consumer, cursor, now)?;
        tx.commit()?;
        Ok(())
    }

    /// Reads rows for one tenant in insertion order.
    ///
    /// This is the only read surface the ingestion core exposes; the query
    /// layer downstream builds on the same partition key. Tenant isolation
    /// is absolute: the filter is an equality on `tenant_id`, so rows from
    /// other tenants can never appear.
    pub fn rows_for_tenant(&self, tenant: &TenantId, limit: usize) -> Result<Vec<LogRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT row_id, tenant_id, service, level, message, ts, inserted_ms \
             FROM log_rows WHERE tenant_id = ?1 ORDER BY row_id LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![tenant.as_str(), limit as i64], |row| {
            Ok(LogRow {
                row_id: row.get(0)?,
                tenant_id: row.get(1)?,
                service: row.get(2)?,
                level: row.get(3)?,
                message: row.get(4)?,
                timestamp: row.get(5)?,
                inserted_ms: row.get::<_, i64>(6)? as u64,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::from)
    }

    /// Total number of stored rows, across all tenants.
    pub fn total_rows(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM log_rows", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Inserts one event row. Caller has already validated the tenant; the
/// NOT NULL constraint is the schema-level backstop.
fn insert_row(conn: &Connection, event: &LogEvent, now_ms: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO log_rows (tenant_id, service, level, message, ts, inserted_ms) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            event.tenant_id,
            event.service,
            event.level,
            event.message,
            event.timestamp,
            now_ms as i64,
        ],
    )?;
    Ok(())
}

/// Upserts a consumer's cursor. The WHERE clause refuses to move a cursor
/// backwards, so a replayed commit can never regress the resumption point.
fn upsert_cursor(conn: &Connection, consumer: &str, cursor: EntryId, now_ms: u64) -> Result<()> {
    conn.execute(
        "INSERT INTO ingest_cursors (consumer, time_ms, seq, updated_ms) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(consumer) DO UPDATE SET \
             time_ms = excluded.time_ms, \
             seq = excluded.seq, \
             updated_ms = excluded.updated_ms \
         WHERE excluded.time_ms > ingest_cursors.time_ms \
            OR (excluded.time_ms = ingest_cursors.time_ms \
                AND excluded.seq > ingest_cursors.seq)",
        params![
            consumer,
            cursor.time_ms() as i64,
            cursor.seq() as i64,
            now_ms as i64,
        ],
    )?;
    Ok(())
}

// =============================================================================
// The Sink Seam
// =============================================================================

/// The consumer's view of a durable sink.
///
/// Implemented by [`SqliteSink`] for production and by test doubles that
/// inject outages. Every method may fail transiently; the consumer reacts by
/// backing off, calling [`ensure_connected`], and retrying the same commit.
///
/// [`ensure_connected`]: LogSink::ensure_connected
pub trait LogSink: Send {
    /// Establishes (or re-establishes) the store connection. Called once at
    /// startup as the readiness gate, and again after any failed commit.
    fn ensure_connected(&mut self) -> Result<()>;

    /// Loads the persisted cursor for a consumer.
    fn load_cursor(&mut self, consumer: &str) -> Result<Option<EntryId>>;

    /// Commits one row plus the advanced cursor, atomically.
    fn commit_row(&mut self, consumer: &str, event: &LogEvent, cursor: EntryId) -> Result<()>;

    /// Durably advances the cursor past a skipped entry.
    fn commit_skip(&mut self, consumer: &str, cursor: EntryId) -> Result<()>;

    /// Commits a batch of rows plus the final cursor, all-or-nothing.
    fn commit_batch(&mut self, consumer: &str, events: &[LogEvent], cursor: EntryId)
        -> Result<()>;
}

/// The production sink: a lazily opened [`LogStore`] at a fixed path.
///
/// Holding the path rather than an open store is what makes outage recovery
/// possible: after a failure the consumer calls [`ensure_connected`], which
/// probes the existing connection and reopens from scratch if it is dead.
///
/// [`ensure_connected`]: LogSink::ensure_connected
pub struct SqliteSink {
    path: PathBuf,
    store: Option<LogStore>,
}

impl SqliteSink {
    /// Creates a sink for the store at `path`. No I/O happens here; the
    /// first [`LogSink::ensure_connected`] call opens the database.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            store: None,
        }
    }

    fn connected(&mut self) -> Result<&mut LogStore> {
        self.store
            .as_mut()
            .ok_or_else(|| Error::Schema("sink used before ensure_connected".to_string()))
    }
}

impl LogSink for SqliteSink {
    fn ensure_connected(&mut self) -> Result<()> {
        if let Some(store) = &self.store {
            if store.ping().is_ok() {
                return Ok(());
            }
            // Stale connection; drop it and reopen below.
            self.store = None;
        }

        let store = LogStore::open(&self.path)?;
        info!(path = %self.path.display(), "connected to durable store");
        self.store = Some(store);
        Ok(())
    }

    fn load_cursor(&mut self, consumer: &str) -> Result<Option<EntryId>> {
        self.connected()?.load_cursor(consumer)
    }

    fn commit_row(&mut self, consumer: &str, event: &LogEvent, cursor: EntryId) -> Result<()> {
        self.connected()?.commit_row(consumer, event, cursor)
    }

    fn commit_skip(&mut self, consumer: &str, cursor: EntryId) -> Result<()> {
        self.connected()?.commit_skip(consumer, cursor)
    }

    fn commit_batch(
        &mut self,
        consumer: &str,
        events: &[LogEvent],
        cursor: EntryId,
    ) -> Result<()> {
        self.connected()?.commit_batch(consumer, events, cursor)
    }
}

// =============================================================================
// Tests
// =============================================================================
