//! # Error Handling for logdrain
//!
//! A single crate-wide error enum keeps function signatures simple and lets
//! callers handle failures uniformly. The variants map directly onto the
//! pipeline's failure taxonomy:
//!
//! | Category          | Variants                        | Typical response            |
//! |-------------------|---------------------------------|-----------------------------|
//! | Malformed event   | `MalformedEntry`, `MissingTenant` | Skip (or halt by policy)  |
//! | Store unavailable | `Sqlite`, `StoreUnavailable`    | Backoff, reconnect, retry   |
//! | Stream trouble    | `StreamClosed`, `Corruption`    | Reconnect / investigate     |
//! | Internal          | `Codec`, `Schema`               | Log and investigate         |
//!
//! Nothing here is fatal to the process by design: the consumer is a
//! supervisor-restartable, crash-only component. [`Error::is_retryable`]
//! tells the retry loops which failures are worth waiting out.

use thiserror::Error;

use crate::types::EntryId;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in pipeline operations.
#[derive(Error, Debug)]
pub enum Error {
    /// An entry without a usable tenant id was encountered while the
    /// malformed-entry policy is `Halt`.
    ///
    /// Under the default `Skip` policy this error never surfaces; the entry
    /// is logged and the cursor advances past it instead.
    #[error("entry {entry_id} has no tenant_id; ingestion halted by policy")]
    MalformedEntry {
        /// The stream entry that could not be attributed to a tenant.
        entry_id: EntryId,
    },

    /// A row without a non-empty tenant id reached the store writer.
    ///
    /// The consumer validates before writing, so hitting this means a caller
    /// bypassed validation. The writer-side check is deliberately redundant:
    /// the schema invariant (every row has a tenant) is enforced at the last
    /// boundary before disk.
    #[error("log row rejected: tenant_id is missing or empty")]
    MissingTenant,

    /// The durable store stayed unreachable past the configured retry budget.
    ///
    /// Only produced when `BackoffConfig::max_elapsed` is set; with the
    /// default (no budget) the consumer waits at the capped interval forever.
    #[error("durable store unavailable: {0}")]
    StoreUnavailable(String),

    /// The stream writer has shut down (every stream handle was dropped).
    ///
    /// Blocked readers wake up with this instead of hanging forever.
    #[error("event stream closed")]
    StreamClosed,

    /// A stream entry's payload failed checksum verification.
    ///
    /// Indicates on-disk corruption or an out-of-band modification of the
    /// stream database. The entry cannot be trusted; manual intervention is
    /// required.
    #[error("stream entry {entry_id} failed checksum verification")]
    Corruption {
        /// The entry whose stored checksum did not match its payload.
        entry_id: EntryId,
    },

    /// SQLite operation failed (locked file, full disk, I/O error, ...).
    ///
    /// This is the "store unavailable" failure class: the consumer does not
    /// advance its cursor and retries after backoff.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Wire payload could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Schema version mismatch or other database-shape problem.
    #[error("schema error: {0}")]
    Schema(String),
}

impl Error {
    /// Returns true for transient failures that a backoff-and-reconnect loop
    /// should wait out, false for permanent faults that must surface.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Sqlite(_))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
