//! Shared fixtures for volume engine scenario tests: an in-memory
//! `ObjectStore`/`KvStore` pair and a small helper to stand up a
//! `VolumeEngine` against a temporary TLog/SCO cache directory.

use std::{sync::Arc, time::Duration};
use tempfile::TempDir;
use volume_engine::{
    config::VolumeEngineConfig,
    kv_store::{memory::InMemoryKvStore, KvStore},
    object_store::{local_fs::LocalFsObjectStore, ObjectStore},
    sco_cache::{MountPointConfig, SCOCache},
    VolumeEngine,
};

/// Nominal volume size handed to `create_and_open`; comfortably larger
/// than anything a scenario test writes.
pub const DEFAULT_VOLUME_SIZE: u64 = 1 << 30;

pub struct Harness {
    pub object_store: Arc<dyn ObjectStore>,
    pub kv_store: Arc<dyn KvStore>,
    pub sco_cache: Arc<SCOCache>,
    _backend_dir: TempDir,
    _scocache_dir: TempDir,
    pub tlog_dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let backend_dir = TempDir::new().expect("backend tempdir");
        let scocache_dir = TempDir::new().expect("scocache tempdir");
        let tlog_dir = TempDir::new().expect("tlog tempdir");

        let object_store = Arc::new(LocalFsObjectStore::new(backend_dir.path()));
        let kv_store = Arc::new(InMemoryKvStore::new());
        let sco_cache = Arc::new(SCOCache::new(vec![MountPointConfig {
            path: scocache_dir.path().to_path_buf(),
            capacity_bytes: 1 << 30,
            trigger_gap_bytes: 1 << 26,
            backoff_gap_bytes: 1 << 27,
        }]));

        Self {
            object_store,
            kv_store,
            sco_cache,
            _backend_dir: backend_dir,
            _scocache_dir: scocache_dir,
            tlog_dir,
        }
    }

    pub fn cfg(&self) -> VolumeEngineConfig {
        VolumeEngineConfig::builder()
            .with_cluster_size(4096)
            .with_clusters_per_sco(8)
            .with_scos_per_tlog(4)
            .with_foc_enabled(false)
            .build()
    }

    pub fn short_lease_cfg(&self) -> VolumeEngineConfig {
        let mut cfg = self.cfg();
        cfg.heartbeat_lease = Duration::from_millis(50);
        cfg
    }

    pub async fn create_and_open(&self, namespace: &str) -> VolumeEngine {
        let cfg = self.cfg();
        VolumeEngine::create(
            uuid::Uuid::new_v4(),
            namespace.to_string(),
            DEFAULT_VOLUME_SIZE,
            cfg.clone(),
            self.object_store.clone(),
            self.kv_store.clone(),
            None,
        )
        .await
        .expect("create volume");

        VolumeEngine::open(
            namespace.to_string(),
            self.tlog_dir.path().join(namespace),
            cfg,
            self.object_store.clone(),
            self.kv_store.clone(),
            self.sco_cache.clone(),
            None,
        )
        .await
        .expect("open volume")
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
