//! The pipeline daemon: stream + consumer(s) + optional built-in producer.
//!
//! Run with: `cargo run --bin drain`
//!
//! Configuration is environment-driven:
//!
//! | Variable                     | Default     | Meaning                             |
//! |------------------------------|-------------|-------------------------------------|
//! | `LOGDRAIN_STREAM`            | `stream.db` | event stream database path          |
//! | `LOGDRAIN_STORE`             | `store.db`  | durable store database path         |
//! | `LOGDRAIN_PARTITIONS`        | `1`         | consumer partitions (>1 scales out) |
//! | `LOGDRAIN_BATCH`             | `100`       | max entries per stream read         |
//! | `LOGDRAIN_HALT_ON_MALFORMED` | unset       | set to halt instead of skipping     |
//! | `LOGDRAIN_PRODUCER`          | unset       | set to run the synthetic producer   |
//! | `RUST_LOG`                   | `info`      | tracing filter                      |
//!
//! Runs until SIGINT, then shuts the consumers down cleanly.

use std::time::Duration;

use tokio::sync::watch;
use tracing::info;

use logdrain::{
    run_producer, spawn_ingester, spawn_partitioned, EventStream, IngestConfig, MalformedPolicy,
    ProducerConfig, SqliteSink, StreamConfig,
};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let stream_path = env_or("LOGDRAIN_STREAM", "stream.db");
    let store_path = env_or("LOGDRAIN_STORE", "store.db");
    let partitions: usize = env_or("LOGDRAIN_PARTITIONS", "1")
        .parse()
        .expect("LOGDRAIN_PARTITIONS must be a positive integer");
    let batch_size: usize = env_or("LOGDRAIN_BATCH", "100")
        .parse()
        .expect("LOGDRAIN_BATCH must be a positive integer");

    let config = IngestConfig {
        batch_size,
        malformed: if std::env::var("LOGDRAIN_HALT_ON_MALFORMED").is_ok() {
            MalformedPolicy::Halt
        } else {
            MalformedPolicy::Skip
        },
        ..IngestConfig::default()
    };

    let stream =
        EventStream::open(&stream_path, StreamConfig::default()).expect("open event stream");
    info!(stream = %stream_path, store = %store_path, partitions, "pipeline starting");

    let handles = if partitions > 1 {
        let sinks = (0..partitions).map(|_| SqliteSink::new(&store_path)).collect();
        spawn_partitioned(stream.clone(), sinks, config)
    } else {
        vec![spawn_ingester(
            stream.clone(),
            SqliteSink::new(&store_path),
            config,
        )]
    };

    // Optional built-in producer for demos and smoke tests.
    let (producer_shutdown_tx, producer_shutdown_rx) = watch::channel(false);
    let producer = if std::env::var("LOGDRAIN_PRODUCER").is_ok() {
        let stream = stream.clone();
        Some(tokio::spawn(async move {
            let config = ProducerConfig {
                interval: Duration::from_secs(1),
                ..ProducerConfig::default()
            };
            run_producer(&stream, &config, producer_shutdown_rx).await
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await.expect("install SIGINT handler");
    info!("shutting down");

    let _ = producer_shutdown_tx.send(true);
    if let Some(producer) = producer {
        let _ = producer.await;
    }
    for handle in handles {
        if let Err(e) = handle.shutdown().await {
            eprintln!("consumer exited with error: {e}");
        }
    }
}
