mod common;

use logdrain::{spawn_partitioned, IngestConfig, Partition, SqliteSink, TenantId};

fn partition_sinks(store_path: &std::path::Path, n: usize) -> Vec<SqliteSink> {
    (0..n).map(|_| SqliteSink::new(store_path)).collect()
}

/// Partitioned ingestion drains every tenant exactly once: each tenant is
/// owned by one partition, so scaling out never duplicates rows.
#[tokio::test]
async fn partitions_cover_all_tenants_without_duplication() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    let tenants: Vec<String> = (0..6).map(|i| format!("tenant-{i}")).collect();
    for round in 0..3 {
        for tenant in &tenants {
            stream
                .append(&common::event(tenant, &format!("{tenant} r{round}")))
                .await
                .unwrap();
        }
    }

    let handles = spawn_partitioned(
        stream.clone(),
        partition_sinks(&store_path, 3),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (store.total_rows().unwrap() == 18).then_some(())
    })
    .await;

    // Exactly 18 — no tenant was ingested by two partitions.
    let store = common::open_store(&store_path);
    for tenant in &tenants {
        let rows = store.rows_for_tenant(&TenantId::new(tenant), 100).unwrap();
        assert_eq!(rows.len(), 3, "{tenant} must appear exactly three times");
    }

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// Per-tenant ordering survives partitioned draining: within one tenant,
/// rows appear in append order even while other tenants drain in parallel.
#[tokio::test]
async fn per_tenant_order_is_preserved_across_partitions() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    let tenants: Vec<String> = (0..4).map(|i| format!("tenant-{i}")).collect();
    for i in 0..5 {
        for tenant in &tenants {
            stream
                .append(&common::event(tenant, &format!("m{i}")))
                .await
                .unwrap();
        }
    }

    let handles = spawn_partitioned(
        stream.clone(),
        partition_sinks(&store_path, 2),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (store.total_rows().unwrap() == 20).then_some(())
    })
    .await;

    let store = common::open_store(&store_path);
    let expected: Vec<String> = (0..5).map(|i| format!("m{i}")).collect();
    for tenant in &tenants {
        assert_eq!(
            common::messages_for(&store, tenant),
            expected,
            "{tenant} rows must be in append order"
        );
    }

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// Every partition durably advances its own cursor to the stream head,
/// including past entries owned by other partitions.
#[tokio::test]
async fn every_partition_advances_its_own_cursor_to_head() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    for i in 0..9 {
        stream
            .append(&common::event(&format!("tenant-{}", i % 3), "m"))
            .await
            .unwrap();
    }
    let head = stream.head();

    let handles = spawn_partitioned(
        stream.clone(),
        partition_sinks(&store_path, 3),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        let all_at_head = (0..3).all(|i| {
            store
                .load_cursor(&format!("ingest-p{i}"))
                .unwrap()
                == head
        });
        all_at_head.then_some(())
    })
    .await;

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// A tenant-less entry in partitioned mode: all partitions move past it,
/// none writes a row for it, and ingestion continues everywhere.
#[tokio::test]
async fn malformed_entries_do_not_stall_any_partition() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    stream
        .append(&common::malformed_event("orphan"))
        .await
        .unwrap();
    for i in 0..4 {
        stream
            .append(&common::event(&format!("tenant-{i}"), "after"))
            .await
            .unwrap();
    }
    let head = stream.head();

    let handles = spawn_partitioned(
        stream.clone(),
        partition_sinks(&store_path, 2),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (store.total_rows().unwrap() == 4
            && store.load_cursor("ingest-p0").unwrap() == head
            && store.load_cursor("ingest-p1").unwrap() == head)
            .then_some(())
    })
    .await;

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}

/// Routing sanity: the partition that `Partition::owns` says owns a tenant
/// is the one whose consumer actually wrote its rows.
#[tokio::test]
async fn routing_matches_the_partition_function() {
    let (_dir, stream_path, store_path) = common::temp_pipeline_paths();
    let stream = common::open_stream(&stream_path);

    let tenant = TenantId::new("tenant_project_auth");
    stream
        .append(&common::event(tenant.as_str(), "routed"))
        .await
        .unwrap();
    let head = stream.head();

    let count = 4u32;
    let owner = (0..count)
        .find(|&index| Partition { index, count }.owns(&tenant))
        .expect("some partition owns the tenant");

    let handles = spawn_partitioned(
        stream.clone(),
        partition_sinks(&store_path, count as usize),
        IngestConfig::default(),
    );

    common::settle(|| {
        let store = common::open_store(&store_path);
        (store.total_rows().unwrap() == 1
            && store.load_cursor(&format!("ingest-p{owner}")).unwrap() == head)
            .then_some(())
    })
    .await;

    for handle in handles {
        handle.shutdown().await.unwrap();
    }
}
