#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use logdrain::store::{LogSink, SqliteSink};
use logdrain::{EntryId, EventStream, LogEvent, LogStore, Result, StreamConfig, TenantId};

/// Creates a temp directory with paths for a stream and a store database.
pub fn temp_pipeline_paths() -> (tempfile::TempDir, PathBuf, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let stream_path = dir.path().join("stream.db");
    let store_path = dir.path().join("store.db");
    (dir, stream_path, store_path)
}

/// Opens an event stream on the given path with default config.
pub fn open_stream(path: &std::path::Path) -> EventStream {
    EventStream::open(path, StreamConfig::default()).expect("open event stream")
}

/// Opens an independent read connection to the store for verification.
pub fn open_store(path: &std::path::Path) -> LogStore {
    LogStore::open(path).expect("open store")
}

/// A well-formed event in the shape the producers send.
pub fn event(tenant: &str, message: &str) -> LogEvent {
    LogEvent::for_tenant(tenant)
        .with_service("auth-service")
        .with_level("INFO")
        .with_message(message)
        .with_timestamp("2024-01-01T00:00:00Z")
}

/// An event with no tenant_id at all.
pub fn malformed_event(message: &str) -> LogEvent {
    LogEvent::default()
        .with_service("auth-service")
        .with_level("INFO")
        .with_message(message)
}

/// Messages of a tenant's rows, in insertion order.
pub fn messages_for(store: &LogStore, tenant: &str) -> Vec<String> {
    store
        .rows_for_tenant(&TenantId::new(tenant), 1000)
        .expect("read rows")
        .into_iter()
        .map(|row| row.message.unwrap_or_default())
        .collect()
}

/// Polls `f` until it returns `Some`, or panics after `timeout`.
pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

/// Convenience wrapper with the defaults most tests want.
pub async fn settle<T>(mut f: impl FnMut() -> Option<T>) -> T {
    eventually(Duration::from_secs(5), Duration::from_millis(10), &mut f).await
}

// =============================================================================
// Outage-Injection Sink
// =============================================================================

/// Shared switchboard for a [`FlakySink`]: flip `down` to simulate a store
/// outage, read `failed_commits` to see how hard the consumer is retrying.
#[derive(Clone, Default)]
pub struct Outage {
    down: Arc<AtomicBool>,
    failed_commits: Arc<AtomicU64>,
}

impl Outage {
    pub fn begin(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn end(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    pub fn failed_commits(&self) -> u64 {
        self.failed_commits.load(Ordering::SeqCst)
    }

    fn fail(&self) -> logdrain::Error {
        self.failed_commits.fetch_add(1, Ordering::SeqCst);
        // Any retryable error will do; the consumer only looks at the class.
        logdrain::Error::Sqlite(rusqlite::Error::InvalidQuery)
    }
}

/// A sink that forwards to a real [`SqliteSink`] unless the outage switch is
/// on, in which case every call fails with a retryable error.
pub struct FlakySink {
    inner: SqliteSink,
    outage: Outage,
}

impl FlakySink {
    pub fn new(store_path: &std::path::Path, outage: Outage) -> Self {
        Self {
            inner: SqliteSink::new(store_path),
            outage,
        }
    }
}

impl LogSink for FlakySink {
    fn ensure_connected(&mut self) -> Result<()> {
        if self.outage.is_down() {
            return Err(self.outage.fail());
        }
        self.inner.ensure_connected()
    }

    fn load_cursor(&mut self, consumer: &str) -> Result<Option<EntryId>> {
        if self.outage.is_down() {
            return Err(self.outage.fail());
        }
        self.inner.load_cursor(consumer)
    }

    fn commit_row(&mut self, consumer: &str, event: &LogEvent, cursor: EntryId) -> Result<()> {
        if self.outage.is_down() {
            return Err(self.outage.fail());
        }
        self.inner.commit_row(consumer, event, cursor)
    }

    fn commit_skip(&mut self, consumer: &str, cursor: EntryId) -> Result<()> {
        if self.outage.is_down() {
            return Err(self.outage.fail());
        }
        self.inner.commit_skip(consumer, cursor)
    }

    fn commit_batch(
        &mut self,
        consumer: &str,
        events: &[LogEvent],
        cursor: EntryId,
    ) -> Result<()> {
        if self.outage.is_down() {
            return Err(self.outage.fail());
        }
        self.inner.commit_batch(consumer, events, cursor)
    }
}

/// Fast-retry backoff so outage tests don't sleep their way to the timeout.
pub fn test_backoff() -> logdrain::BackoffConfig {
    logdrain::BackoffConfig {
        initial: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        max_elapsed: None,
    }
}
