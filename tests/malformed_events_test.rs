mod common;

use logdrain::{spawn_ingester, Error, IngestConfig, MalformedPolicy, SqliteSink};

/// The default policy: an event without a tenant_id produces no row, but the
/// cursor still advances durably past it.
#[tokio::test]
async fn tenantless_event_is_skipped_and_cursor_advances() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    let skipped_id = stream
        .append(&common::malformed_event("orphan"))
        .await
        .unwrap();

    let handle = spawn_ingester(
        stream.clone(),
        SqliteSink::new(&store_path),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (store.load_cursor("ingest").unwrap() == Some(skipped_id)).then_some(())
    })
    .await;

    let store = common::open_store(&store_path);
    assert_eq!(store.total_rows().unwrap(), 0, "no row for the orphan event");

    handle.shutdown().await.unwrap();
}

/// An empty tenant_id is as malformed as an absent one.
#[tokio::test]
async fn empty_tenant_id_is_treated_as_absent() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    let event = logdrain::LogEvent {
        tenant_id: Some(String::new()),
        ..common::malformed_event("empty tenant")
    };
    let skipped_id = stream.append(&event).await.unwrap();

    let handle = spawn_ingester(
        stream.clone(),
        SqliteSink::new(&store_path),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (store.load_cursor("ingest").unwrap() == Some(skipped_id)).then_some(())
    })
    .await;

    assert_eq!(common::open_store(&store_path).total_rows().unwrap(), 0);
    handle.shutdown().await.unwrap();
}

/// No head-of-line blocking: a malformed entry never delays the valid entry
/// appended after it.
#[tokio::test]
async fn valid_event_after_malformed_is_still_processed() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    stream
        .append(&common::malformed_event("orphan"))
        .await
        .unwrap();
    stream.append(&common::event("t1", "survives")).await.unwrap();

    let handle = spawn_ingester(
        stream.clone(),
        SqliteSink::new(&store_path),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (common::messages_for(&store, "t1") == vec!["survives"]).then_some(())
    })
    .await;

    // Exactly one row total: the orphan never landed anywhere.
    assert_eq!(common::open_store(&store_path).total_rows().unwrap(), 1);

    handle.shutdown().await.unwrap();
}

/// The skip also holds in batch-commit mode, where malformed entries are
/// dropped from the batch but still covered by the batch's cursor.
#[tokio::test]
async fn batch_mode_skips_malformed_within_the_batch() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    stream.append(&common::event("t1", "before")).await.unwrap();
    stream
        .append(&common::malformed_event("orphan"))
        .await
        .unwrap();
    let last_id = stream.append(&common::event("t1", "after")).await.unwrap();

    let config = IngestConfig {
        commit_batch: true,
        ..IngestConfig::default()
    };
    let handle = spawn_ingester(stream.clone(), SqliteSink::new(&store_path), config);

    common::settle(|| {
        let store = common::open_store(&store_path);
        (common::messages_for(&store, "t1") == vec!["before", "after"]).then_some(())
    })
    .await;

    let store = common::open_store(&store_path);
    assert_eq!(store.total_rows().unwrap(), 2);
    assert_eq!(store.load_cursor("ingest").unwrap(), Some(last_id));

    handle.shutdown().await.unwrap();
}

/// Under `Halt`, the consumer stops at the malformed entry without moving
/// past it — and without losing the valid entries before it.
#[tokio::test]
async fn halt_policy_stops_without_advancing() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    let good_id = stream.append(&common::event("t1", "good")).await.unwrap();
    let bad_id = stream
        .append(&common::malformed_event("poison"))
        .await
        .unwrap();
    stream.append(&common::event("t1", "unreached")).await.unwrap();

    let config = IngestConfig {
        malformed: MalformedPolicy::Halt,
        ..IngestConfig::default()
    };
    let handle = spawn_ingester(stream.clone(), SqliteSink::new(&store_path), config);

    let result = handle.join().await;
    match result {
        Err(Error::MalformedEntry { entry_id }) => assert_eq!(entry_id, bad_id),
        other => panic!("expected MalformedEntry, got {other:?}"),
    }

    let store = common::open_store(&store_path);
    // The valid prefix was committed; the cursor never crossed the poison
    // entry, so a restart re-reads from there.
    assert_eq!(common::messages_for(&store, "t1"), vec!["good"]);
    assert_eq!(store.load_cursor("ingest").unwrap(), Some(good_id));
}
