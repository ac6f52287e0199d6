//! # The Append-Only Event Stream
//!
//! This module implements the durable, totally ordered event log that sits
//! between producers and the ingestion consumer.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Producer Tasks                            │
//! │   task1 ─┐                                                     │
//! │   task2 ─┼─ tokio::sync::mpsc ──┐          (one total order)   │
//! │   task3 ─┘     (async send)     │                              │
//! └─────────────────────────────────┼──────────────────────────────┘
//!                                   ▼
//!                       ┌───────────────────────┐
//!                       │  Writer Thread        │  ← std::thread::spawn
//!                       │  assigns EntryId,     │
//!                       │  INSERT, publish head │
//!                       └───────────┬───────────┘
//!                                   │ watch<Option<EntryId>>
//!                                   ▼
//!                       ┌───────────────────────┐
//!                       │  StreamReader         │  read-only connection,
//!                       │  read_from(cursor)    │  wakes on head changes
//!                       └───────────────────────┘
//! ```
//!
//! ## Why a Dedicated Writer Thread?
//!
//! Producers may append concurrently from any number of tasks. Funnelling
//! every append through one mpsc channel into one thread gives the stream
//! its total order for free: the thread assigns strictly increasing entry
//! ids and commits entries one at a time, so concurrent appends can never
//! collide or reorder. SQLite's `Connection` is also `!Sync`, so exclusive
//! ownership by one thread is the natural shape anyway.
//!
//! ## Blocking Reads
//!
//! The reader holds its own read-only connection (WAL mode makes committed
//! writes visible immediately) plus a `watch` receiver carrying the head
//! entry id. `read_from` queries past the cursor; when the log is drained it
//! parks on the watch channel until the writer publishes a new head or the
//! block timeout expires. Marking the watch as seen *before* each query
//! closes the race where an append lands between the query and the wait.
//!
//! ## Invariants
//!
//! - Entry ids strictly increase, across restarts and clock regressions
//! - Entries are immutable once appended; nothing here deletes or updates
//! - A read never returns a smaller id after a larger one

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, OpenFlags};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error};

use crate::codec::{self, compute_checksum, current_time_ms};
use crate::error::{Error, Result};
use crate::schema::StreamDb;
use crate::types::{EntryId, LogEvent, StreamEntry};

// =============================================================================
// Configuration
// =============================================================================

/// Size of the append command channel.
const APPEND_CHANNEL_SIZE: usize = 4096;

/// Configuration for an event stream.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Capacity of the append channel. Producers that outrun the writer
    /// block on `send` (backpressure) rather than buffering without bound.
    pub channel_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channel_capacity: APPEND_CHANNEL_SIZE,
        }
    }
}

// =============================================================================
// Append Requests
// =============================================================================

/// An append sent to the writer thread. The payload is encoded on the
/// producer's task; the writer only assigns the id and commits.
struct AppendRequest {
    payload: Vec<u8>,
    response: oneshot::Sender<Result<EntryId>>,
}

// =============================================================================
// The Stream Handle
// =============================================================================

/// Handle to an open event stream.
///
/// # Thread Safety
///
/// `EventStream` is `Clone + Send + Sync`; clone it freely into producer
/// tasks. All clones feed the same writer thread. The writer shuts down when
/// the last handle is dropped; readers blocked at that point wake with
/// [`Error::StreamClosed`].
#[derive(Clone)]
pub struct EventStream {
    append_tx: mpsc::Sender<AppendRequest>,
    head_rx: watch::Receiver<Option<EntryId>>,
    path: PathBuf,
}

impl EventStream {
    /// Opens (or creates) the stream database and spawns the writer thread.
    pub fn open(path: impl AsRef<Path>, config: StreamConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = StreamDb::open(&path)?.into_connection();

        // Recover the resumption point so ids keep increasing across
        // restarts even if the wall clock went backwards in between.
        let last = last_entry_id(&conn)?;
        debug!(head = ?last.map(|id| id.to_string()), "event stream opened");

        let (append_tx, append_rx) = mpsc::channel(config.channel_capacity);
        let (head_tx, head_rx) = watch::channel(last);

        thread::Builder::new()
            .name("logdrain-stream-writer".to_string())
            .spawn(move || writer_loop(conn, append_rx, head_tx, last))
            .map_err(|e| Error::Schema(format!("failed to spawn stream writer: {e}")))?;

        Ok(Self {
            append_tx,
            head_rx,
            path,
        })
    }

    /// Appends an event, returning its stream-assigned entry id once the
    /// entry is durably committed.
    ///
    /// Safe under any number of concurrent callers; the writer thread
    /// serializes appends into one total order.
    pub async fn append(&self, event: &LogEvent) -> Result<EntryId> {
        let payload = codec::encode_event(event)?;
        let (response, response_rx) = oneshot::channel();

        self.append_tx
            .send(AppendRequest { payload, response })
            .await
            .map_err(|_| Error::StreamClosed)?;

        response_rx.await.map_err(|_| Error::StreamClosed)?
    }

    /// Opens a new reader over this stream.
    ///
    /// Each reader owns its own read-only connection; acquiring a fresh one
    /// after a read failure is how the consumer "reconnects" to the stream.
    pub fn reader(&self) -> Result<StreamReader> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch("PRAGMA busy_timeout = 5000")?;

        Ok(StreamReader {
            conn,
            head_rx: self.head_rx.clone(),
        })
    }

    /// The id of the most recently committed entry, if any.
    pub fn head(&self) -> Option<EntryId> {
        *self.head_rx.borrow()
    }
}

// =============================================================================
// Writer Thread
// =============================================================================

/// Reads the highest entry id in the log, if the log is non-empty.
fn last_entry_id(conn: &Connection) -> Result<Option<EntryId>> {
    let id = conn
        .query_row(
            "SELECT time_ms, seq FROM stream_entries ORDER BY time_ms DESC, seq DESC LIMIT 1",
            [],
            |row| {
                let time_ms: i64 = row.get(0)?;
                let seq: i64 = row.get(1)?;
                Ok(EntryId::from_parts(time_ms as u64, seq as u64))
            },
        )
        .ok();
    Ok(id)
}

/// The writer loop: assign id, insert, publish head, respond. Exits when the
/// last stream handle is dropped (channel closed).
fn writer_loop(
    conn: Connection,
    mut append_rx: mpsc::Receiver<AppendRequest>,
    head_tx: watch::Sender<Option<EntryId>>,
    mut last: Option<EntryId>,
) {
    while let Some(request) = append_rx.blocking_recv() {
        let now = current_time_ms();
        let id = match last {
            Some(prev) => prev.successor(now),
            None => EntryId::from_parts(now, 0),
        };

        let result = insert_entry(&conn, id, &request.payload);

        match result {
            Ok(()) => {
                last = Some(id);
                // Publish after commit so a woken reader always finds the
                // entry on disk. No receivers is fine (producer-only use).
                let _ = head_tx.send(Some(id));
                let _ = request.response.send(Ok(id));
            }
            Err(e) => {
                error!(entry_id = %id, error = %e, "stream append failed");
                let _ = request.response.send(Err(e));
            }
        }
    }

    debug!("stream writer shutting down");
}

/// Inserts one entry in its own (implicit) transaction.
fn insert_entry(conn: &Connection, id: EntryId, payload: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT INTO stream_entries (time_ms, seq, checksum, payload) VALUES (?1, ?2, ?3, ?4)",
        params![
            id.time_ms() as i64,
            id.seq() as i64,
            compute_checksum(payload),
            payload,
        ],
    )?;
    Ok(())
}

// =============================================================================
// Stream Reader
// =============================================================================

/// A sequential reader over the stream, owning its read-only connection.
///
/// Readers are cheap to create and hold no cursor state of their own; the
/// consumer passes its cursor into every [`read_from`] call and persists it
/// elsewhere (the durable store).
///
/// [`read_from`]: StreamReader::read_from
pub struct StreamReader {
    conn: Connection,
    head_rx: watch::Receiver<Option<EntryId>>,
}

impl StreamReader {
    /// Reads entries with ids strictly greater than `cursor`, in id order.
    ///
    /// # Blocking Semantics
    ///
    /// - If at least one entry exists past the cursor, up to `max_count`
    ///   entries are returned immediately.
    /// - Otherwise the call waits for a new append, up to `block`
    ///   (`None` = wait indefinitely), and returns an empty batch only on
    ///   timeout.
    ///
    /// # Ordering Guarantee
    ///
    /// Entries come back in exact append order; within one read, no entry
    /// with a smaller id ever follows one with a larger id.
    ///
    /// # Errors
    ///
    /// - [`Error::Corruption`] if a stored checksum does not match
    /// - [`Error::StreamClosed`] if the writer is gone and the log past the
    ///   cursor is empty
    pub async fn read_from(
        &mut self,
        cursor: Option<EntryId>,
        block: Option<Duration>,
        max_count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = block.map(|d| Instant::now() + d);

        loop {
            // Mark the current head version seen before querying; an append
            // that lands after the query then flags the watch as changed.
            self.head_rx.borrow_and_update();

            let batch = self.read_batch(cursor, max_count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    match tokio::time::timeout(deadline - now, self.head_rx.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Err(Error::StreamClosed),
                        Err(_) => return Ok(Vec::new()),
                    }
                }
                None => match self.head_rx.changed().await {
                    Ok(()) => continue,
                    Err(_) => return Err(Error::StreamClosed),
                },
            }
        }
    }

    /// One catch-up query, no blocking.
    fn read_batch(&self, cursor: Option<EntryId>, max_count: usize) -> Result<Vec<StreamEntry>> {
        let (after_ms, after_seq) = match cursor {
            Some(id) => (id.time_ms() as i64, id.seq() as i64),
            // Sorts before every real id, so "no cursor" reads from the start.
            None => (-1, -1),
        };

        let mut stmt = self.conn.prepare_cached(
            "SELECT time_ms, seq, checksum, payload FROM stream_entries \
             WHERE time_ms > ?1 OR (time_ms = ?1 AND seq > ?2) \
             ORDER BY time_ms, seq LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![after_ms, after_seq, max_count as i64], |row| {
            let time_ms: i64 = row.get(0)?;
            let seq: i64 = row.get(1)?;
            let checksum: i64 = row.get(2)?;
            let payload: Vec<u8> = row.get(3)?;
            Ok((EntryId::from_parts(time_ms as u64, seq as u64), checksum, payload))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (entry_id, checksum, payload) = row?;
            if checksum != compute_checksum(&payload) {
                return Err(Error::Corruption { entry_id });
            }
            entries.push(StreamEntry {
                entry_id,
                event: codec::decode_event(&payload)?,
            });
        }
        Ok(entries)
    }
}

// =============================================================================
// Tests
// =============================================================================
