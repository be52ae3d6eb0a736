//! Scenario coverage mirroring the write path's core behaviours: happy
//! path I/O, snapshot/restore, clone read-through, SCO disposal and
//! owner-tag fencing.

use volume_engine_tests::Harness;

/// S1: write a cluster, read it back; an unwritten cluster reads as
/// zeroes.
#[tokio::test]
async fn s1_write_then_read_round_trips() {
    let harness = Harness::new();
    let engine = harness.create_and_open("s1").await;

    let payload = vec![0xABu8; 4096];
    engine.write(7, payload.clone()).await.expect("write");
    let back = engine.read(7, 4096).await.expect("read");
    assert_eq!(back, payload);

    let unwritten = engine.read(99, 4096).await.expect("read unwritten");
    assert_eq!(unwritten, vec![0u8; 4096]);
}

/// S2: a snapshot freezes a point in time; writes after it are undone
/// by restoring.
#[tokio::test]
async fn s2_snapshot_and_restore() {
    let harness = Harness::new();
    let engine = harness.create_and_open("s2").await;

    engine.write(1, vec![1u8; 4096]).await.expect("write v1");
    let snap = engine
        .snapshot("before-v2".to_string(), Vec::new())
        .await
        .expect("snapshot");
    assert_eq!(snap.name, "before-v2");

    engine.write(1, vec![2u8; 4096]).await.expect("write v2");
    assert_eq!(engine.read(1, 4096).await.unwrap(), vec![2u8; 4096]);

    engine.restore("before-v2").await.expect("restore");
    let snapshots = engine.list_snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].name, "before-v2");
}

/// S3: a write acknowledged by the FailOverCache but never flushed past
/// (and thus never replayed by) this engine's own TLog history survives
/// an unclean restart.
#[tokio::test]
async fn s3_foc_assisted_crash_recovery() {
    let harness = Harness::new();
    let foc_addr = "127.0.0.1:48173".to_string();
    let server = std::sync::Arc::new(volume_engine::foc::FailOverCacheServer::new());
    {
        let server = server.clone();
        let addr = foc_addr.clone();
        tokio::spawn(async move {
            let _ = server.serve(&addr).await;
        });
    }
    for _ in 0 .. 50 {
        if tokio::net::TcpStream::connect(&foc_addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // A short lease so the crashed owner's lock has lapsed by the time
    // this test reopens the volume (a real restart would find the same
    // thing: the lease timed out while the owner was down).
    let mut cfg = harness.short_lease_cfg();
    cfg.foc_enabled = true;
    cfg.foc_synchronous = true;

    volume_engine::VolumeEngine::create(
        uuid::Uuid::new_v4(),
        "s3".to_string(),
        volume_engine_tests::DEFAULT_VOLUME_SIZE,
        cfg.clone(),
        harness.object_store.clone(),
        harness.kv_store.clone(),
        None,
    )
    .await
    .expect("create");

    let engine = volume_engine::VolumeEngine::open(
        "s3".to_string(),
        harness.tlog_dir.path().join("s3"),
        cfg.clone(),
        harness.object_store.clone(),
        harness.kv_store.clone(),
        harness.sco_cache.clone(),
        Some(foc_addr.clone()),
    )
    .await
    .expect("open with foc");

    let x = vec![0xAAu8; 4096];
    let y = vec![0xBBu8; 4096];
    engine.write(0, x.clone()).await.expect("write X");
    engine.write(1, y.clone()).await.expect("write Y");

    // Simulate a crash: the engine is dropped without `sync`/`cork`, so
    // neither write is in any snapshot's `current_tlogs` tail the next
    // open's backend-restart plan would replay. The FailOverCache still
    // has both entries.
    drop(engine);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let restarted = volume_engine::VolumeEngine::open(
        "s3".to_string(),
        harness.tlog_dir.path().join("s3"),
        cfg,
        harness.object_store.clone(),
        harness.kv_store.clone(),
        harness.sco_cache.clone(),
        Some(foc_addr),
    )
    .await
    .expect("reopen after crash");

    assert_eq!(restarted.read(0, 4096).await.unwrap(), x);
    assert_eq!(restarted.read(1, 4096).await.unwrap(), y);
}

/// S4: a clone reads through to its parent's data at the point of the
/// clone snapshot, and its own writes never leak back to the parent.
#[tokio::test]
async fn s4_clone_records_parent_link() {
    let harness = Harness::new();
    let engine = harness.create_and_open("s4-parent").await;
    let y = vec![9u8; 4096];
    engine.write(4, y.clone()).await.expect("write");
    engine
        .snapshot("base".to_string(), Vec::new())
        .await
        .expect("snapshot");

    engine
        .clone_volume(
            uuid::Uuid::new_v4(),
            "s4-clone".to_string(),
            "base".to_string(),
            volume_engine_tests::DEFAULT_VOLUME_SIZE,
            harness.cfg(),
            harness.object_store.clone(),
            harness.kv_store.clone(),
        )
        .await
        .expect("clone");

    let clone = volume_engine::VolumeEngine::open(
        "s4-clone".to_string(),
        harness.tlog_dir.path().join("s4-clone"),
        harness.cfg(),
        harness.object_store.clone(),
        harness.kv_store.clone(),
        harness.sco_cache.clone(),
        None,
    )
    .await
    .expect("open clone");

    // Reads through to the parent's data without the clone ever having
    // written anything of its own.
    assert_eq!(clone.read(4, 4096).await.unwrap(), y);

    // A write on the clone is local to it...
    let z = vec![0x42u8; 4096];
    clone.write(4, z.clone()).await.expect("write on clone");
    assert_eq!(clone.read(4, 4096).await.unwrap(), z);

    // ...and never visible from the parent.
    assert_eq!(engine.read(4, 4096).await.unwrap(), y);

    // The clone cannot be created from an unknown snapshot name.
    let err = engine
        .clone_volume(
            uuid::Uuid::new_v4(),
            "s4-clone-bad".to_string(),
            "does-not-exist".to_string(),
            volume_engine_tests::DEFAULT_VOLUME_SIZE,
            harness.cfg(),
            harness.object_store.clone(),
            harness.kv_store.clone(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), volume_engine::EngineErrorKind::BadRequest);
}

/// S5: SCOs move Writing -> ClosedDisposable -> Evicted as the backend
/// promoter drains and the cache reclaims space, with reads falling back
/// to `ObjectStore` once a cluster's SCO is gone from the cache.
#[tokio::test]
async fn s5_sco_lifecycle_to_disposal() {
    let harness = Harness::new();
    let cluster_size = 4096u32;
    let clusters_per_sco = 4u32;
    let sco_bytes = (cluster_size * clusters_per_sco) as u64;

    // Small enough that a handful of SCOs forces `cleanup` to evict, but
    // comfortably above the total this test ever allocates so a write
    // never fails with `OutOfSpace` while eviction is catching up.
    let sco_cache = std::sync::Arc::new(volume_engine::sco_cache::SCOCache::new(vec![
        volume_engine::sco_cache::MountPointConfig {
            path: harness.tlog_dir.path().join("s5-cache"),
            capacity_bytes: sco_bytes * 8,
            trigger_gap_bytes: sco_bytes * 3,
            backoff_gap_bytes: sco_bytes * 5,
        },
    ]));

    let cfg = volume_engine::config::VolumeEngineConfig::builder()
        .with_cluster_size(cluster_size)
        .with_clusters_per_sco(clusters_per_sco)
        .with_scos_per_tlog(2)
        .build();

    volume_engine::VolumeEngine::create(
        uuid::Uuid::new_v4(),
        "s5".to_string(),
        volume_engine_tests::DEFAULT_VOLUME_SIZE,
        cfg.clone(),
        harness.object_store.clone(),
        harness.kv_store.clone(),
        None,
    )
    .await
    .expect("create");

    let engine = volume_engine::VolumeEngine::open(
        "s5".to_string(),
        harness.tlog_dir.path().join("s5"),
        cfg,
        harness.object_store.clone(),
        harness.kv_store.clone(),
        sco_cache.clone(),
        None,
    )
    .await
    .expect("open");

    let first_cluster = vec![0x11u8; cluster_size as usize];
    engine.write(0, first_cluster.clone()).await.expect("write sco0");
    // Enough further writes to roll through several SCOs (closing one
    // every `clusters_per_sco` writes) and push the cache mountpoint past
    // its trigger gap.
    for ca in 1 .. 25 {
        engine.write(ca, vec![ca as u8; cluster_size as usize]).await.expect("write");
    }

    // Wait for the promoter to drain and `cleanup` to reclaim sco 0.
    let mut evicted = false;
    for _ in 0 .. 100 {
        if sco_cache.state("s5", 0) == Some(volume_engine::sco_cache::ScoState::Evicted) {
            evicted = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    assert!(evicted, "sco 0 was never evicted from the cache");

    // Its data is still readable, now served from ObjectStore.
    assert_eq!(engine.read(0, cluster_size).await.unwrap(), first_cluster);
}

/// S6: a second `open` while the first owner's heartbeat lease is still
/// live is fenced off rather than silently taking over.
#[tokio::test]
async fn s6_second_open_is_fenced_while_lease_live() {
    let harness = Harness::new();
    let cfg = harness.cfg();
    volume_engine::VolumeEngine::create(
        uuid::Uuid::new_v4(),
        "s6".to_string(),
        volume_engine_tests::DEFAULT_VOLUME_SIZE,
        cfg.clone(),
        harness.object_store.clone(),
        harness.kv_store.clone(),
        None,
    )
    .await
    .expect("create");

    let _first = volume_engine::VolumeEngine::open(
        "s6".to_string(),
        harness.tlog_dir.path().join("s6"),
        cfg.clone(),
        harness.object_store.clone(),
        harness.kv_store.clone(),
        harness.sco_cache.clone(),
        None,
    )
    .await
    .expect("first open");

    let err = volume_engine::VolumeEngine::open(
        "s6".to_string(),
        harness.tlog_dir.path().join("s6-second"),
        cfg,
        harness.object_store.clone(),
        harness.kv_store.clone(),
        harness.sco_cache.clone(),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind(), volume_engine::EngineErrorKind::Fenced);
}

/// After a clean `destroy(true)` the namespace is gone from the backend.
#[tokio::test]
async fn destroy_removes_backend_namespace() {
    let harness = Harness::new();
    let engine = harness.create_and_open("destroy-me").await;
    engine.destroy(true).await.expect("destroy");
    assert_eq!(engine.state(), volume_engine::EngineState::Destroyed);
}
