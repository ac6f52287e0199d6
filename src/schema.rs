//! # SQLite Schemas for the Pipeline
//!
//! Two databases, two schemas:
//!
//! ```text
//! stream.db                          store.db
//! ┌──────────────────┐               ┌──────────────────────┐
//! │ stream_entries   │               │ log_rows             │
//! │  time_ms  ┐ PK   │   ingestion   │  row_id (PK)         │
//! │  seq      ┘      │  ──────────►  │  tenant_id NOT NULL  │
//! │  checksum        │   consumer    │  service/level/...   │
//! │  payload BLOB    │               │  inserted_ms         │
//! └──────────────────┘               ├──────────────────────┤
//!                                    │ ingest_cursors       │
//!                                    │  consumer (PK)       │
//!                                    │  time_ms, seq        │
//!                                    └──────────────────────┘
//! ```
//!
//! ## Design Decisions
//!
//! ### Why does the cursor live in `store.db`, not `stream.db`?
//!
//! The cursor invariant is "never advance past an entry that is not durably
//! written to the store". Keeping the cursor in the same database as the rows
//! lets both commit in one transaction, so the invariant holds even across a
//! crash mid-entry. The stream stays a pure append-only log with no consumer
//! state in it.
//!
//! ### Why `(time_ms, seq)` columns instead of one packed integer?
//!
//! The two components have different semantics (coarse wall clock vs.
//! per-millisecond sequence) and SQLite compares the composite primary key
//! exactly the way [`EntryId`](crate::types::EntryId)'s `Ord` does. Packing
//! would save a few bytes and cost readability of every ad-hoc query.

use rusqlite::Connection;

use crate::{Error, Result};

// =============================================================================
// Schema Versions
// =============================================================================

/// Current stream schema version. Incremented on breaking changes; there is
/// no migration support, a mismatch is an error.
const STREAM_SCHEMA_VERSION: i32 = 1;

/// Current store schema version.
const STORE_SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL: Event Stream
// =============================================================================

/// The `stream_entries` table is the append-only event log.
///
/// # Columns
///
/// - `time_ms`: coarse time component of the entry id (Unix milliseconds)
/// - `seq`: per-millisecond sequence component of the entry id
/// - `checksum`: XXH3-64 of `payload`, verified on every read
/// - `payload`: the JSON-encoded event map
///
/// # Invariants
///
/// - `(time_ms, seq)` strictly increases in append order, never reused
/// - Rows are never updated or deleted; retention is indefinite
///   (compaction/TTL is a deployment concern, deliberately unspecified)
const CREATE_STREAM_ENTRIES: &str = r#"
CREATE TABLE IF NOT EXISTS stream_entries (
    time_ms  INTEGER NOT NULL,
    seq      INTEGER NOT NULL,
    checksum INTEGER NOT NULL,
    payload  BLOB NOT NULL,
    PRIMARY KEY (time_ms, seq)
)
"#;

// =============================================================================
// DDL: Durable Store
// =============================================================================

/// The `log_rows` table holds ingested events, one row per event.
///
/// # Columns
///
/// - `row_id`: store-assigned identity
/// - `tenant_id`: partition key; NOT NULL is the schema-level half of the
///   "every stored row has a tenant" invariant (the writer checks too)
/// - `service`, `level`, `message`, `ts`: event fields, nullable because the
///   wire shape tolerates their absence
/// - `inserted_ms`: insertion time assigned by the store writer
const CREATE_LOG_ROWS: &str = r#"
CREATE TABLE IF NOT EXISTS log_rows (
    row_id      INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id   TEXT NOT NULL,
    service     TEXT,
    level       TEXT,
    message     TEXT,
    ts          TEXT,
    inserted_ms INTEGER NOT NULL
)
"#;

/// Index backing the only read pattern the core exposes: rows for one tenant
/// in insertion order. Also what keeps tenant isolation cheap.
const CREATE_LOG_ROWS_TENANT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS log_rows_tenant
ON log_rows(tenant_id, row_id)
"#;

/// The `ingest_cursors` table tracks each consumer's resumption point.
///
/// # Columns
///
/// - `consumer`: consumer name (partitioned ingestion gives each partition
///   its own name, hence its own cursor)
/// - `time_ms`, `seq`: the last processed entry id
/// - `updated_ms`: when the cursor last moved
///
/// # Invariant
///
/// A cursor row only ever moves forward. The upsert in the store writer
/// refuses to regress it.
const CREATE_INGEST_CURSORS: &str = r#"
CREATE TABLE IF NOT EXISTS ingest_cursors (
    consumer   TEXT PRIMARY KEY,
    time_ms    INTEGER NOT NULL,
    seq        INTEGER NOT NULL,
    updated_ms INTEGER NOT NULL
)
"#;

/// Metadata table, one per database, currently holding the schema version.
const CREATE_META: &str = r#"
CREATE TABLE IF NOT EXISTS logdrain_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

// =============================================================================
// Shared Initialization
// =============================================================================

/// Applies the pragmas both databases run with.
///
/// WAL lets the reader connections see committed writes without blocking the
/// writer; `synchronous = NORMAL` syncs the WAL on commit but not on every
/// write, which is the standard durability/throughput trade for this kind of
/// sink (the stream retains everything, so a torn tail is recoverable).
fn apply_pragmas(conn: &Connection) -> Result<()> {
    // busy_timeout first: the pragmas below may briefly contend with another
    // connection's writes, and should wait rather than fail fast.
    conn.execute_batch("PRAGMA busy_timeout = 5000")?;
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = NORMAL")?;
    Ok(())
}

/// Verifies the stored schema version, or stamps it on a fresh database.
fn verify_or_set_version(conn: &Connection, expected: i32) -> Result<()> {
    let existing: Option<i32> = conn
        .query_row(
            "SELECT value FROM logdrain_meta WHERE key = 'schema_version'",
            [],
            |row| {
                let s: String = row.get(0)?;
                Ok(s.parse().unwrap_or(0))
            },
        )
        .ok();

    match existing {
        None => {
            conn.execute(
                "INSERT INTO logdrain_meta (key, value) VALUES ('schema_version', ?)",
                [expected.to_string()],
            )?;
            Ok(())
        }
        Some(v) if v == expected => Ok(()),
        Some(v) => Err(Error::Schema(format!(
            "schema version mismatch: database has version {v}, this build requires {expected}"
        ))),
    }
}

// =============================================================================
// Database Wrappers
// =============================================================================

/// A SQLite connection with the event stream schema applied.
///
/// Owns its `Connection`; dropping the wrapper closes the database. The
/// stream writer thread takes the connection out via [`into_connection`]
/// and owns it exclusively from then on.
///
/// [`into_connection`]: StreamDb::into_connection
#[derive(Debug)]
pub struct StreamDb {
    conn: Connection,
}

impl StreamDb {
    /// Opens a stream database file, creating and initializing it if needed.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        apply_pragmas(&self.conn)?;
        self.conn.execute_batch(CREATE_META)?;
        self.conn.execute_batch(CREATE_STREAM_ENTRIES)?;
        verify_or_set_version(&self.conn, STREAM_SCHEMA_VERSION)
    }

    /// Consumes the wrapper and returns the raw connection for the writer
    /// thread to own.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

/// A SQLite connection with the durable store schema applied.
#[derive(Debug)]
pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Opens a store database file, creating and initializing it if needed.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates an in-memory store for unit tests. Lost on drop; the stream
    /// side has no in-memory variant because its reader connections need a
    /// shared file.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    fn initialize(&self) -> Result<()> {
        apply_pragmas(&self.conn)?;
        self.conn.execute_batch(CREATE_META)?;
        self.conn.execute_batch(CREATE_LOG_ROWS)?;
        self.conn.execute_batch(CREATE_LOG_ROWS_TENANT_INDEX)?;
        self.conn.execute_batch(CREATE_INGEST_CURSORS)?;
        verify_or_set_version(&self.conn, STORE_SCHEMA_VERSION)
    }

    /// Consumes the wrapper and returns the raw connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .expect("prepare");
        stmt.query_map([], |row| row.get(0))
            .expect("query")
            .collect::<std::result::Result<Vec<_>, _>>()
            .expect("collect")
    }

    #[test]
    fn store_schema_creates_tables_and_index() {
        let db = StoreDb::open_in_memory().expect("create store");
        assert_eq!(
            table_names(&db.conn),
            vec!["ingest_cursors", "log_rows", "logdrain_meta"]
        );

        let indexes: Vec<String> = {
            let mut stmt = db
                .conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'index' \
                     AND name NOT LIKE 'sqlite_%'",
                )
                .expect("prepare");
            stmt.query_map([], |row| row.get(0))
                .expect("query")
                .collect::<std::result::Result<Vec<_>, _>>()
                .expect("collect")
        };
        assert!(indexes.contains(&"log_rows_tenant".to_string()));
    }

    #[test]
    fn stream_schema_creates_entries_table() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db = StreamDb::open(dir.path().join("stream.db")).expect("create stream");
        assert_eq!(table_names(&db.conn), vec!["logdrain_meta", "stream_entries"]);
    }

    #[test]
    fn schema_version_is_stamped() {
        let db = StoreDb::open_in_memory().expect("create store");
        let version: String = db
            .conn
            .query_row(
                "SELECT value FROM logdrain_meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .expect("version row");
        assert_eq!(version, STORE_SCHEMA_VERSION.to_string());
    }

    #[test]
    fn double_initialization_is_idempotent() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("store.db");
        {
            let _db = StoreDb::open(&path).expect("first open");
        }
        {
            let db = StoreDb::open(&path).expect("second open");
            assert_eq!(table_names(&db.conn).len(), 3);
        }
    }

    #[test]
    fn rows_without_tenant_are_rejected_by_the_schema() {
        let db = StoreDb::open_in_memory().expect("create store");
        let result = db.conn.execute(
            "INSERT INTO log_rows (tenant_id, inserted_ms) VALUES (NULL, 0)",
            [],
        );
        assert!(result.is_err(), "NOT NULL constraint should reject the row");
    }
}
