//! # Domain Types for logdrain
//!
//! This module defines the core types used throughout the pipeline: tenant
//! identifiers, stream entry identifiers, the wire-level log event, and the
//! stored row shape.
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! Identifiers are wrapped in single-field structs rather than passed around
//! as raw strings and integers. A `TenantId` cannot be confused with a
//! `service` name, and an `EntryId` cannot be mixed up with a row id.
//!
//! ## Invariants
//!
//! - [`EntryId`]: strictly increasing, assigned only by the stream writer,
//!   never reused, never regresses even when the wall clock does
//! - [`TenantId`]: non-empty; the partition key for every store read
//! - [`StreamEntry`]: immutable once appended
//! - [`LogRow`]: immutable once inserted

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Tenant Identification
// =============================================================================

/// An opaque identifier for the tenant that owns an event.
///
/// # What is a Tenant?
///
/// A tenant is an isolated customer or namespace. Every stored row carries a
/// tenant id, and every read filters by one; rows from tenant A must never be
/// visible when querying tenant B.
///
/// # Validity
///
/// A `TenantId` is always non-empty. The only way to obtain one from untrusted
/// input is [`LogEvent::tenant`], which returns `None` for an absent or empty
/// `tenant_id` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id from a trusted, known-non-empty string.
    ///
    /// For untrusted wire input, go through [`LogEvent::tenant`] instead.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Computes the partition hash of this tenant id.
    ///
    /// # Algorithm: XXH3
    ///
    /// XXH3-64 is formally specified, so the same tenant id hashes to the
    /// same value forever, across platforms and versions. Partitioned
    /// ingestion routes a tenant by `hash % partition_count`; a stable hash
    /// means a tenant never migrates between partitions across restarts.
    pub fn hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.0.as_bytes())
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Entry Identification
// =============================================================================

/// A stream-assigned identifier establishing the total order of entries.
///
/// # Composite Structure
///
/// An entry id is `(time_ms, seq)`: coarse wall-clock milliseconds plus a
/// per-millisecond sequence number. Two appends in the same millisecond get
/// sequence numbers 0, 1, 2, ...; the next millisecond resets the sequence.
/// Displayed as `"<time_ms>-<seq>"`.
///
/// # Invariants
///
/// - Strictly increases with each append; never reused
/// - Assigned only by the stream writer thread (producers never pick ids)
/// - Never regresses: the writer clamps a backwards wall clock to the
///   previous entry's `time_ms` and keeps incrementing the sequence
///
/// # Ordering
///
/// The derived `Ord` compares `time_ms` first, then `seq`, which matches the
/// append order exactly. Consumers use the last processed id as their cursor
/// and resume with strictly-greater ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    time_ms: u64,
    seq: u64,
}

impl EntryId {
    /// Creates an entry id from its raw parts.
    ///
    /// Primarily for reading persisted cursors and rows back from SQLite.
    /// Live ids are assigned by the stream writer.
    pub fn from_parts(time_ms: u64, seq: u64) -> Self {
        Self { time_ms, seq }
    }

    /// The coarse time component (Unix milliseconds at append).
    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    /// The per-millisecond sequence component.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Returns the id the writer assigns to the next entry, given the
    /// current wall clock.
    ///
    /// If the clock moved forward, the sequence resets to 0. If the clock
    /// stalled or moved backwards, the time component is clamped to this
    /// id's and the sequence increments, preserving strict ordering.
    pub fn successor(&self, now_ms: u64) -> Self {
        if now_ms > self.time_ms {
            Self { time_ms: now_ms, seq: 0 }
        } else {
            Self { time_ms: self.time_ms, seq: self.seq + 1 }
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.time_ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = crate::Error;

    /// Parses the `"<time_ms>-<seq>"` display form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (time_ms, seq) = s
            .split_once('-')
            .ok_or_else(|| crate::Error::Schema(format!("malformed entry id '{s}'")))?;
        let time_ms = time_ms
            .parse()
            .map_err(|_| crate::Error::Schema(format!("malformed entry id '{s}'")))?;
        let seq = seq
            .parse()
            .map_err(|_| crate::Error::Schema(format!("malformed entry id '{s}'")))?;
        Ok(Self { time_ms, seq })
    }
}

// =============================================================================
// Log Events
// =============================================================================

/// A log event as it crosses the wire: a string-keyed map where every field
/// may be absent.
///
/// # Untrusted Input
///
/// Producers are outside the core's correctness contract, so nothing here is
/// validated at construction. The only field whose absence changes processing
/// is `tenant_id` (see [`LogEvent::tenant`]); everything else is carried
/// through to the store as-is, including `level` and `timestamp`, which the
/// core treats as uninterpreted strings.
///
/// # Serialization
///
/// Serializes to a JSON map with absent fields omitted. Unknown keys in an
/// incoming map are ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Owning tenant. Required for ingestion; absence triggers the
    /// malformed-entry policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Name of the emitting component.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,

    /// Severity label (e.g. INFO/WARN/ERROR). Uninterpreted by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Free-text message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Producer-supplied event time. Opaque to the core; not validated
    /// against ingestion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl LogEvent {
    /// Starts a well-formed event for a tenant (builder pattern).
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
            ..Self::default()
        }
    }

    /// Sets the emitting service.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Sets the severity label.
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = Some(level.into());
        self
    }

    /// Sets the message text.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Sets the producer-side timestamp string.
    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Returns the owning tenant, or `None` if the event is malformed.
    ///
    /// An absent `tenant_id` and an empty `tenant_id` are the same thing:
    /// an event that cannot be attributed to a tenant and therefore must not
    /// produce a store row.
    pub fn tenant(&self) -> Option<TenantId> {
        match self.tenant_id.as_deref() {
            Some(t) if !t.is_empty() => Some(TenantId::new(t)),
            _ => None,
        }
    }
}

// =============================================================================
// Stream Entries
// =============================================================================

/// A log event wrapped with its stream-assigned entry id.
///
/// This is the read-side shape: what [`crate::stream::StreamReader`] returns.
/// Immutable from the instant it is appended; the consumer uses `entry_id`
/// as its ordering and resumption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stream-assigned, strictly increasing identifier.
    pub entry_id: EntryId,

    /// The decoded event payload.
    pub event: LogEvent,
}

// =============================================================================
// Stored Rows
// =============================================================================

/// A row as stored in the durable store.
///
/// All five event fields plus the store-assigned row id and insertion time.
/// `tenant_id` is guaranteed non-empty here: the store writer rejects rows
/// without one, independent of consumer-side validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRow {
    /// Store-assigned identity (SQLite rowid).
    pub row_id: i64,

    /// Owning tenant; the partition key for all reads.
    pub tenant_id: String,

    /// Emitting component, if the event carried one.
    pub service: Option<String>,

    /// Severity label, if the event carried one.
    pub level: Option<String>,

    /// Message text, if the event carried one.
    pub message: Option<String>,

    /// Producer-supplied event time, if the event carried one.
    pub timestamp: Option<String>,

    /// Insertion time assigned by the store writer (Unix milliseconds).
    pub inserted_ms: u64,
}

// =============================================================================
// Tests
// =============================================================================
