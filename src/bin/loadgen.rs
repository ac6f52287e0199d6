//! Load generator for the event stream.
//!
//! A standalone binary that floods a stream with synthetic tenant events
//! from concurrent producer tasks and reports the append rate. Run with:
//! `cargo run --release --bin loadgen -- [OPTIONS]`
//!
//! # Examples
//!
//! ```bash
//! # Default: 1000 events across 3 tenants from 4 concurrent producers
//! cargo run --release --bin loadgen
//!
//! # Heavier run with a malformed event every 50 appends
//! cargo run --release --bin loadgen -- --events 100000 --tenants 20 \
//!     --concurrency 16 --malformed-every 50
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use logdrain::{EventStream, LogEvent, StreamConfig};

/// Load generator configuration.
struct Config {
    /// Total number of events to append.
    num_events: usize,
    /// Number of distinct tenants to spread events across.
    num_tenants: usize,
    /// Number of concurrent producer tasks.
    concurrency: usize,
    /// Append an event without a tenant_id every N events (0 = never).
    malformed_every: usize,
    /// Path to the stream database (temp file if not given).
    stream_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_events: 1000,
            num_tenants: 3,
            concurrency: 4,
            malformed_every: 0,
            stream_path: None,
        }
    }
}

fn parse_args() -> Config {
    let args: Vec<String> = std::env::args().collect();
    let mut config = Config::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--events" | "-e" => {
                i += 1;
                config.num_events = args[i].parse().expect("Invalid --events value");
            }
            "--tenants" | "-t" => {
                i += 1;
                config.num_tenants = args[i].parse().expect("Invalid --tenants value");
            }
            "--concurrency" | "-c" => {
                i += 1;
                config.concurrency = args[i].parse().expect("Invalid --concurrency value");
            }
            "--malformed-every" => {
                i += 1;
                config.malformed_every = args[i].parse().expect("Invalid --malformed-every value");
            }
            "--stream" | "-s" => {
                i += 1;
                config.stream_path = Some(args[i].clone());
            }
            "--help" | "-h" => {
                println!(
                    r#"logdrain Load Generator

Usage: loadgen [OPTIONS]

Options:
  -e, --events <N>       Total events to append (default: 1000)
  -t, --tenants <N>      Distinct tenants (default: 3)
  -c, --concurrency <N>  Concurrent producer tasks (default: 4)
  --malformed-every <N>  Drop the tenant_id every N events (default: never)
  -s, --stream <PATH>    Stream database path (default: temp file)
  -h, --help             Show this help
"#
                );
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {arg}");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() {
    let config = parse_args();

    println!("logdrain Load Generator");
    println!("=======================");
    println!("Events:      {}", config.num_events);
    println!("Tenants:     {}", config.num_tenants);
    println!("Concurrency: {}", config.concurrency);
    if config.malformed_every > 0 {
        println!("Malformed:   every {} events", config.malformed_every);
    }

    let stream_path = match &config.stream_path {
        Some(path) => path.clone(),
        None => std::env::temp_dir()
            .join(format!("logdrain-loadgen-{}.db", std::process::id()))
            .display()
            .to_string(),
    };
    println!("Stream:      {stream_path}");
    println!();

    let stream =
        EventStream::open(&stream_path, StreamConfig::default()).expect("open event stream");

    let appended = Arc::new(AtomicU64::new(0));
    let per_task = config.num_events / config.concurrency;
    let malformed_every = config.malformed_every;
    let num_tenants = config.num_tenants;

    println!("Appending...");
    let start = Instant::now();

    let mut handles = Vec::with_capacity(config.concurrency);
    for task in 0..config.concurrency {
        let stream = stream.clone();
        let appended = Arc::clone(&appended);

        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let n = task * per_task + i;
                let event = if malformed_every > 0 && n % malformed_every == 0 {
                    // No tenant_id: exercises the consumer's skip path.
                    LogEvent::default()
                        .with_service("loadgen")
                        .with_level("INFO")
                        .with_message(format!("malformed event {n}"))
                } else {
                    LogEvent::for_tenant(format!("tenant-{}", n % num_tenants))
                        .with_service("loadgen")
                        .with_level("INFO")
                        .with_message(format!("event {n}"))
                        .with_timestamp(chrono::Utc::now().to_rfc3339())
                };

                stream.append(&event).await.expect("append failed");
                appended.fetch_add(1, Ordering::Relaxed);
            }
        }));
    }

    for handle in handles {
        handle.await.expect("producer task panicked");
    }

    let elapsed = start.elapsed();
    let total = appended.load(Ordering::Relaxed);

    println!();
    println!("Results");
    println!("-------");
    println!("Appended:    {total}");
    println!("Elapsed:     {:.2}s", elapsed.as_secs_f64());
    println!(
        "Rate:        {:.0} events/s",
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!(
        "Stream head: {}",
        stream
            .head()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "empty".to_string())
    );
}
