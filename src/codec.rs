//! # Wire Payload Encoding and Decoding
//!
//! This module provides the codec for stream entry payloads. An entry's
//! payload is the producer's event serialized as a JSON map:
//!
//! ```text
//! {"tenant_id":"t1","service":"auth","level":"ERROR","message":"boom",
//!  "timestamp":"2024-01-01T00:00:00Z"}
//! ```
//!
//! Any subset of the keys may be absent, and unknown keys are ignored on
//! decode. The entry id, checksum and append time live in the
//! `stream_entries` columns, not in the payload.
//!
//! ## Checksums
//!
//! Every payload is checksummed with XXH3-64 at append time and verified on
//! every read. A mismatch means the stream database was corrupted or
//! modified out of band; the reader surfaces [`Error::Corruption`] rather
//! than handing a mangled event to the consumer.
//!
//! [`Error::Corruption`]: crate::Error::Corruption

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;
use crate::types::LogEvent;

// =============================================================================
// Encoding
// =============================================================================

/// Encodes an event into its stream payload bytes.
///
/// Absent fields are omitted from the JSON map entirely, matching the wire
/// shape producers use.
pub fn encode_event(event: &LogEvent) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(event)?)
}

// =============================================================================
// Decoding
// =============================================================================

/// Decodes a stream payload back into an event.
///
/// Tolerant by design: missing keys become `None`, unknown keys are dropped.
/// Only structurally invalid JSON (or non-string field values) is an error.
pub fn decode_event(payload: &[u8]) -> Result<LogEvent> {
    Ok(serde_json::from_slice(payload)?)
}

// =============================================================================
// Checksums and Time
// =============================================================================

/// Computes the XXH3-64 checksum of a payload.
///
/// Stored as a signed 64-bit integer in SQLite (the cast is a bit-level
/// reinterpretation, reversed on read).
pub fn compute_checksum(payload: &[u8]) -> i64 {
    xxhash_rust::xxh3::xxh3_64(payload) as i64
}

/// Returns the current Unix time in milliseconds.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================
