//! # The Ingestion Consumer
//!
//! The single logical reader that drains the event stream from its persisted
//! cursor, turns each entry into a durable store row, and only then considers
//! the cursor advanced.
//!
//! ## State Machine
//!
//! ```text
//!                ┌──────────┐
//!                │ Starting │  connecting to store (bounded backoff)
//!                └────┬─────┘
//!                     ▼
//!                ┌──────────┐
//!                │  Ready   │  cursor loaded from the store
//!                └────┬─────┘
//!                     ▼
//!                ┌──────────┐   store unreachable   ┌──────────────┐
//!                │ Draining │ ───────────────────►  │ RetryBackoff │
//!                │          │ ◄───────────────────  │              │
//!                └──────────┘   store recovered     └──────────────┘
//! ```
//!
//! No terminal state exists except externally-triggered shutdown (via
//! [`IngesterHandle::shutdown`]) or, under [`MalformedPolicy::Halt`], the
//! first tenant-less entry.
//!
//! ## The Cursor Invariant
//!
//! Processing one entry is: commit (row + cursor, one transaction), then
//! move on. The in-memory cursor copy only ever mirrors what the store has
//! already made durable, so the consumer can never advance past an entry
//! that is not written. On store failure the consumer keeps its position,
//! backs off, reconnects, and retries the *same* entry — at-least-once,
//! never a gap.
//!
//! ## Malformed Entries
//!
//! An entry without a usable `tenant_id` cannot be attributed to any tenant.
//! The default policy skips it (logged, cursor advanced) so one bad producer
//! can never block the stream for everyone else. Deployments that prefer
//! loud failure over silent data loss set [`MalformedPolicy::Halt`].

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::store::LogSink;
use crate::stream::{EventStream, StreamReader};
use crate::types::{EntryId, LogEvent, StreamEntry, TenantId};

// =============================================================================
// Configuration
// =============================================================================

/// Default maximum entries per stream read.
const DEFAULT_BATCH_SIZE: usize = 100;

/// What to do with an entry that has no usable tenant id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    /// Log the entry and durably advance the cursor past it. The stream is
    /// never blocked by one bad producer; the event is dropped.
    Skip,

    /// Stop the consumer with [`Error::MalformedEntry`] without advancing.
    /// For deployments where dropping data silently is worse than stalling.
    Halt,
}

impl Default for MalformedPolicy {
    fn default() -> Self {
        MalformedPolicy::Skip
    }
}

/// Bounded exponential backoff for store (re)connection.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,

    /// Cap on the per-attempt delay; doubling stops here.
    pub max_delay: Duration,

    /// Total time budget for one outage episode. `None` (the default) waits
    /// forever at the capped interval — the consumer is crash-only and
    /// supervisor-restartable, so "keep waiting" is a valid strategy.
    pub max_elapsed: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            max_elapsed: None,
        }
    }
}

/// A partition assignment for horizontally scaled ingestion.
///
/// Partition `index` of `count` owns exactly the tenants whose XXH3 hash
/// lands on it. One tenant maps to one partition, so per-tenant ordering is
/// preserved while different tenants drain in parallel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    /// This consumer's partition index, `0..count`.
    pub index: u32,

    /// Total number of partitions.
    pub count: u32,
}

impl Partition {
    /// Whether this partition owns the given tenant.
    pub fn owns(&self, tenant: &TenantId) -> bool {
        tenant.hash() % u64::from(self.count) == u64::from(self.index)
    }
}

/// Configuration for an ingestion consumer.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Name keying this consumer's cursor row in the store. Two consumers
    /// with the same name share a cursor (don't run them concurrently); two
    /// with different names each see the whole stream.
    pub consumer_name: String,

    /// Maximum entries per stream read.
    pub batch_size: usize,

    /// How long a stream read blocks when the log is drained. `None` (the
    /// default) blocks indefinitely — the consumer has no other work.
    pub block_timeout: Option<Duration>,

    /// Policy for entries without a usable tenant id.
    pub malformed: MalformedPolicy,

    /// Commit each read batch in one store transaction instead of one
    /// transaction per entry. All-or-nothing per batch; higher throughput,
    /// same visibility guarantees.
    pub commit_batch: bool,

    /// Backoff for store connection and retry.
    pub backoff: BackoffConfig,

    /// Partition assignment. `None` = the single-consumer design; set by
    /// [`spawn_partitioned`].
    pub partition: Option<Partition>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            consumer_name: "ingest".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: None,
            malformed: MalformedPolicy::default(),
            commit_batch: false,
            backoff: BackoffConfig::default(),
            partition: None,
        }
    }
}

// =============================================================================
// Observable State
// =============================================================================

/// The consumer's lifecycle state, observable via [`IngesterHandle::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    /// Connecting to the durable store (readiness gate).
    Starting,

    /// Store attached, cursor established.
    Ready,

    /// Actively reading the stream and writing rows.
    Draining,

    /// Store unreachable; backing off before reconnecting.
    RetryBackoff,
}

// =============================================================================
// Backoff Bookkeeping
// =============================================================================

/// One outage episode's backoff state: delay doubles up to the cap, and the
/// episode as a whole may carry a time budget.
struct Backoff {
    delay: Duration,
    attempt: u32,
    started: Instant,
    max_delay: Duration,
    max_elapsed: Option<Duration>,
}

impl Backoff {
    fn new(config: &BackoffConfig) -> Self {
        Self {
            delay: config.initial,
            attempt: 0,
            started: Instant::now(),
            max_delay: config.max_delay,
            max_elapsed: config.max_elapsed,
        }
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The next delay to sleep, or `None` when the episode budget is spent.
    fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_elapsed) = self.max_elapsed {
            if self.started.elapsed() >= max_elapsed {
                return None;
            }
        }
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max_delay);
        self.attempt += 1;
        Some(delay)
    }
}

// =============================================================================
// Spawning
// =============================================================================

/// Control flow signal threaded through the run loop: either keep going or
/// an external shutdown was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Shutdown,
}

impl Flow {
    fn is_shutdown(self) -> bool {
        matches!(self, Flow::Shutdown)
    }
}

/// Handle to a running ingestion consumer.
pub struct IngesterHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<IngestState>,
    join: tokio::task::JoinHandle<Result<()>>,
}

impl IngesterHandle {
    /// The consumer's current lifecycle state.
    pub fn state(&self) -> IngestState {
        *self.state_rx.borrow()
    }

    /// Whether the consumer task has exited (only happens on shutdown, a
    /// halt, or a non-retryable error).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Requests shutdown and waits for the consumer to finish its current
    /// entry and exit.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join
            .await
            .map_err(|e| Error::Schema(format!("consumer task panicked: {e}")))?
    }

    /// Waits for the consumer to exit on its own (Halt policy, retry budget
    /// exhausted, or a permanent fault).
    pub async fn join(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| Error::Schema(format!("consumer task panicked: {e}")))?
    }
}

/// Spawns the single-consumer ingestion loop.
///
/// The stream handle and the sink are passed in by value: no module-level
/// connection state anywhere, which is also what lets tests run in parallel
/// with their own stores and inject failing sinks.
pub fn spawn_ingester<S: LogSink + 'static>(
    stream: EventStream,
    sink: S,
    config: IngestConfig,
) -> IngesterHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state_tx, state_rx) = watch::channel(IngestState::Starting);

    let ingester = Ingester {
        stream,
        sink,
        config,
        cursor: None,
        state_tx,
        shutdown_rx,
    };

    IngesterHandle {
        shutdown_tx,
        state_rx,
        join: tokio::spawn(ingester.run()),
    }
}

/// Spawns one ingester per sink, partitioning tenants across them by hash.
///
/// Each partition gets its own consumer name (`"<name>-p<i>"`), hence its
/// own cursor, its own stream reader, and its own store connection. Every
/// partition scans the whole stream and durably advances its cursor past
/// every entry, but writes rows only for tenants it owns — so per-tenant
/// ordering is exactly what the single-consumer design gives, with tenants
/// draining in parallel. Tenant-less entries are policy-handled (logged or
/// halted on) by partition 0 alone.
pub fn spawn_partitioned<S: LogSink + 'static>(
    stream: EventStream,
    sinks: Vec<S>,
    config: IngestConfig,
) -> Vec<IngesterHandle> {
    let count = sinks.len() as u32;

    sinks
        .into_iter()
        .enumerate()
        .map(|(index, sink)| {
            let mut partition_config = config.clone();
            partition_config.consumer_name = format!("{}-p{index}", config.consumer_name);
            partition_config.partition = Some(Partition {
                index: index as u32,
                count,
            });
            spawn_ingester(stream.clone(), sink, partition_config)
        })
        .collect()
}

// =============================================================================
// The Ingester
// =============================================================================

/// What to commit for one step: a row, a cursor-only skip, or a whole batch.
#[derive(Clone, Copy)]
enum CommitOp<'a> {
    Row(&'a LogEvent),
    Skip,
    Batch(&'a [LogEvent]),
}

struct Ingester<S: LogSink> {
    stream: EventStream,
    sink: S,
    config: IngestConfig,

    /// In-memory mirror of the durably persisted cursor. Only updated after
    /// a successful commit; never leads the store.
    cursor: Option<EntryId>,

    state_tx: watch::Sender<IngestState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: LogSink> Ingester<S> {
    async fn run(mut self) -> Result<()> {
        self.set_state(IngestState::Starting);

        // Readiness gate: nothing happens until the store answers.
        if self.connect_with_backoff().await?.is_shutdown() {
            return Ok(());
        }

        // Resume from wherever the last run durably got to.
        self.cursor = loop {
            match self.sink.load_cursor(&self.config.consumer_name) {
                Ok(cursor) => break cursor,
                Err(e) if e.is_retryable() => {
                    if self.outage_backoff(&e).await?.is_shutdown() {
                        return Ok(());
                    }
                }
                Err(e) => return Err(e),
            }
        };

        self.set_state(IngestState::Ready);
        info!(
            consumer = %self.config.consumer_name,
            cursor = self.cursor.map(|c| c.to_string()).unwrap_or_else(|| "start".into()),
            "consumer ready"
        );

        let mut reader = match self.acquire_reader().await? {
            Some(reader) => reader,
            None => return Ok(()),
        };

        loop {
            self.set_state(IngestState::Draining);

            let cursor = self.cursor;
            let block = self.config.block_timeout;
            let batch_size = self.config.batch_size;

            let batch = tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => return Ok(()),
                result = reader.read_from(cursor, block, batch_size) => result,
            };

            match batch {
                Ok(batch) => {
                    // Empty means the blocking read timed out. The loop never
                    // terminates on that; it just blocks again.
                    if batch.is_empty() {
                        continue;
                    }
                    let flow = if self.config.commit_batch {
                        self.process_batch(&batch).await?
                    } else {
                        self.process_entries(&batch).await?
                    };
                    if flow.is_shutdown() {
                        return Ok(());
                    }
                }
                Err(e) if e.is_retryable() => {
                    // Stream trouble: reacquire a reader and resume from the
                    // same cursor. Nothing is lost; the stream still holds
                    // every unconsumed entry.
                    warn!(error = %e, "stream read failed; reconnecting");
                    reader = match self.acquire_reader().await? {
                        Some(reader) => reader,
                        None => return Ok(()),
                    };
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Processes a batch entry-by-entry, one commit per entry.
    async fn process_entries(&mut self, batch: &[StreamEntry]) -> Result<Flow> {
        for entry in batch {
            match entry.event.tenant() {
                Some(tenant) => {
                    let owned = self
                        .config
                        .partition
                        .map_or(true, |p| p.owns(&tenant));
                    let op = if owned {
                        CommitOp::Row(&entry.event)
                    } else {
                        // Another partition's tenant; just move our cursor.
                        CommitOp::Skip
                    };
                    if self.commit_with_retry(op, entry.entry_id).await?.is_shutdown() {
                        return Ok(Flow::Shutdown);
                    }
                }
                None => {
                    if let Some(flow) = self.handle_malformed(entry).await? {
                        return Ok(flow);
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    /// Processes a batch with a single all-or-nothing commit.
    async fn process_batch(&mut self, batch: &[StreamEntry]) -> Result<Flow> {
        let mut rows: Vec<LogEvent> = Vec::new();
        let mut last_id: Option<EntryId> = None;

        for entry in batch {
            match entry.event.tenant() {
                Some(tenant) => {
                    let owned = self
                        .config
                        .partition
                        .map_or(true, |p| p.owns(&tenant));
                    if owned {
                        rows.push(entry.event.clone());
                    }
                    last_id = Some(entry.entry_id);
                }
                None => {
                    if self.handles_malformed() && self.config.malformed == MalformedPolicy::Halt {
                        // Commit the valid prefix, then stop without ever
                        // moving past the offending entry.
                        if let Some(id) = last_id {
                            if self
                                .commit_with_retry(CommitOp::Batch(&rows), id)
                                .await?
                                .is_shutdown()
                            {
                                return Ok(Flow::Shutdown);
                            }
                        }
                        return Err(Error::MalformedEntry {
                            entry_id: entry.entry_id,
                        });
                    }
                    if self.handles_malformed() {
                        warn!(
                            entry_id = %entry.entry_id,
                            "skipping event without tenant_id"
                        );
                    }
                    last_id = Some(entry.entry_id);
                }
            }
        }

        if let Some(id) = last_id {
            return self.commit_with_retry(CommitOp::Batch(&rows), id).await;
        }
        Ok(Flow::Continue)
    }

    /// Applies the malformed-entry policy. Returns `Some(flow)` when the run
    /// loop must stop iterating this batch.
    async fn handle_malformed(&mut self, entry: &StreamEntry) -> Result<Option<Flow>> {
        if self.handles_malformed() {
            match self.config.malformed {
                MalformedPolicy::Skip => {
                    warn!(
                        entry_id = %entry.entry_id,
                        event = ?entry.event,
                        "skipping event without tenant_id"
                    );
                }
                MalformedPolicy::Halt => {
                    return Err(Error::MalformedEntry {
                        entry_id: entry.entry_id,
                    });
                }
            }
        }
        // Either way the cursor moves durably past the entry; under Skip it
        // must, and a non-handling partition treats it as foreign.
        let flow = self.commit_with_retry(CommitOp::Skip, entry.entry_id).await?;
        Ok(flow.is_shutdown().then_some(Flow::Shutdown))
    }

    /// Whether this consumer applies the malformed policy (partition 0 does;
    /// the other partitions silently advance so a skip is logged once, not
    /// once per partition).
    fn handles_malformed(&self) -> bool {
        self.config.partition.map_or(true, |p| p.index == 0)
    }

    /// Commits one step, retrying through store outages. The cursor mirror
    /// is updated only after the store acknowledged the transaction.
    async fn commit_with_retry(&mut self, op: CommitOp<'_>, entry_id: EntryId) -> Result<Flow> {
        loop {
            let result = match op {
                CommitOp::Row(event) => {
                    self.sink
                        .commit_row(&self.config.consumer_name, event, entry_id)
                }
                CommitOp::Skip => self.sink.commit_skip(&self.config.consumer_name, entry_id),
                CommitOp::Batch(events) => {
                    self.sink
                        .commit_batch(&self.config.consumer_name, events, entry_id)
                }
            };

            match result {
                Ok(()) => {
                    self.cursor = Some(entry_id);
                    return Ok(Flow::Continue);
                }
                Err(e) if e.is_retryable() => {
                    if self.outage_backoff(&e).await?.is_shutdown() {
                        return Ok(Flow::Shutdown);
                    }
                    self.set_state(IngestState::Draining);
                    // Loop retries the same entry; the cursor did not move.
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One outage episode: back off, reconnect, repeat until the store
    /// answers or the episode budget runs out.
    async fn outage_backoff(&mut self, cause: &Error) -> Result<Flow> {
        self.set_state(IngestState::RetryBackoff);
        let mut backoff = Backoff::new(&self.config.backoff);
        let mut last_error = cause.to_string();

        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(Error::StoreUnavailable(format!(
                    "still unreachable after {} attempts: {last_error}",
                    backoff.attempt()
                )));
            };
            warn!(
                consumer = %self.config.consumer_name,
                attempt = backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = %last_error,
                "durable store not ready; backing off"
            );

            if self.sleep_or_shutdown(delay).await {
                return Ok(Flow::Shutdown);
            }

            match self.sink.ensure_connected() {
                Ok(()) => {
                    debug!(consumer = %self.config.consumer_name, "store connection re-established");
                    return Ok(Flow::Continue);
                }
                Err(e) if e.is_retryable() => last_error = e.to_string(),
                Err(e) => return Err(e),
            }
        }
    }

    /// The startup readiness gate: same backoff, but entered before any
    /// connection exists.
    async fn connect_with_backoff(&mut self) -> Result<Flow> {
        let mut backoff = Backoff::new(&self.config.backoff);

        loop {
            match self.sink.ensure_connected() {
                Ok(()) => return Ok(Flow::Continue),
                Err(e) if e.is_retryable() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(Error::StoreUnavailable(format!(
                            "not ready after {} attempts: {e}",
                            backoff.attempt()
                        )));
                    };
                    warn!(
                        consumer = %self.config.consumer_name,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "durable store not ready; waiting"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(Flow::Shutdown);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Opens a stream reader, retrying through transient failures.
    /// Returns `None` when shutdown was requested while waiting.
    async fn acquire_reader(&mut self) -> Result<Option<StreamReader>> {
        let mut backoff = Backoff::new(&self.config.backoff);

        loop {
            match self.stream.reader() {
                Ok(reader) => return Ok(Some(reader)),
                Err(e) if e.is_retryable() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(e);
                    };
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "stream reader unavailable");
                    if self.sleep_or_shutdown(delay).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Sleeps for `delay`, returning early (true) on shutdown.
    async fn sleep_or_shutdown(&mut self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown_rx.changed() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn set_state(&self, state: IngestState) {
        self.state_tx.send_replace(state);
    }
}

// =============================================================================
// Tests
// =============================================================================
