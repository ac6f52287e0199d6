//! # Producer Harness
//!
//! Producers are external to the core's correctness contract — anything can
//! append to the stream — but something has to define the shape the core
//! must accept. This module is that something: a synthetic event generator
//! cycling through a fixed set of tenants, services, and severity levels,
//! stamping each event with an RFC 3339 UTC timestamp.
//!
//! The generator is deterministic (a counter, not a RNG) so tests and load
//! runs are reproducible: event `n` always belongs to tenant
//! `tenants[n % tenants.len()]`.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;
use crate::stream::EventStream;
use crate::types::LogEvent;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the synthetic producer.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Tenants to cycle through.
    pub tenants: Vec<String>,

    /// Emitting services to cycle through.
    pub services: Vec<String>,

    /// Severity labels to cycle through.
    pub levels: Vec<String>,

    /// Delay between appends.
    pub interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            tenants: vec![
                "tenant_project_auth".to_string(),
                "tenant_project_payments".to_string(),
                "6720833e-6eaf-4b5d-b0a4-28c6ea99142b".to_string(),
            ],
            services: vec![
                "auth-service".to_string(),
                "payment-service".to_string(),
                "user-service".to_string(),
            ],
            levels: vec!["INFO".to_string(), "ERROR".to_string(), "WARN".to_string()],
            interval: Duration::from_secs(3),
        }
    }
}

// =============================================================================
// Event Generation
// =============================================================================

/// Builds the `n`-th synthetic event.
///
/// Cycles through the configured tenants, services, and levels independently
/// so the combinations interleave; the message matches the level the way a
/// real service's log lines would.
pub fn synthetic_event(config: &ProducerConfig, n: usize) -> LogEvent {
    let tenant = &config.tenants[n % config.tenants.len()];
    let service = &config.services[n % config.services.len()];
    let level = &config.levels[n % config.levels.len()];

    let message = match level.as_str() {
        "ERROR" => format!("{service} failed to process request"),
        "WARN" => format!("{service} slow response detected"),
        _ => format!("{service} request processed"),
    };

    LogEvent::for_tenant(tenant)
        .with_service(service)
        .with_level(level)
        .with_message(message)
        .with_timestamp(chrono::Utc::now().to_rfc3339())
}

// =============================================================================
// The Producer Loop
// =============================================================================

/// Appends one synthetic event per interval until shutdown.
///
/// Returns the number of events appended. Append failures propagate — a
/// producer that cannot reach the stream has nothing useful left to do, and
/// its supervisor decides what happens next.
pub async fn run_producer(
    stream: &EventStream,
    config: &ProducerConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<u64> {
    let mut produced: u64 = 0;
    info!(interval_ms = config.interval.as_millis() as u64, "producer started");

    loop {
        let event = synthetic_event(config, produced as usize);
        let entry_id = stream.append(&event).await?;
        produced += 1;
        debug!(
            entry_id = %entry_id,
            tenant = event.tenant_id.as_deref().unwrap_or(""),
            "produced event"
        );

        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!(produced, "producer stopped");
                return Ok(produced);
            }
            _ = tokio::time::sleep(config.interval) => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
