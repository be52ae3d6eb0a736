//! Component L: `VolumeEngine`, the per-volume façade the router hands
//! out to FUSE/XMLRPC/NetworkXio front-ends. Composes D-K into the
//! public read/write/snapshot/clone/restart contract and owns the
//! `Creating -> Running <-> Degraded -> Halted | Destroyed` state
//! machine.

use crate::{
    backend_promoter::{BackendPromoter, PromotionItem, RetryPolicy},
    config::VolumeEngineConfig,
    data_store::{DataStore, DataStoreGeometry},
    error::{EngineError, EngineResult},
    foc::{client::FocMode, FailOverCacheClient},
    health::{ComponentFailure, HealthMonitor, HealthState},
    kv_store::KvStore,
    lock::HeartbeatLock,
    metadata_store::{backend::KvStoreBackend, MetaDataStore, NSIDMap},
    object_store::{ObjectStore, WriteCondition},
    restart::{replay_tlogs, BackendRestartAccumulator},
    sco_cache::SCOCache,
    snapshot::{Snapshot, SnapshotManager},
    types::{ClusterAddress, NamespaceId, OwnerTag, VolumeId},
};
use parking_lot::RwLock as PLRwLock;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

/// Persisted at `volume.cfg` in the `ObjectStore`; the durable record of
/// how a volume was created, independent of the in-memory `VolumeEngineConfig`
/// defaults a node happens to be running with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub volume_id: VolumeId,
    pub namespace: NamespaceId,
    /// Nominal volume size in bytes; `write`/`read` reject any `CA` whose
    /// cluster range falls outside it.
    pub size: u64,
    pub cluster_size: u32,
    pub clusters_per_sco: u32,
    pub scos_per_tlog: u32,
    pub parent: Option<(NamespaceId, String)>,
    /// Fencing tag of the last owner to successfully `open` this volume;
    /// updated on every open, kept here for observability alongside the
    /// live `HeartbeatLock` record, which remains the actual source of
    /// truth for fencing.
    pub owner_tag: OwnerTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Creating,
    Running,
    Degraded,
    Halted,
    Destroyed,
}

const VOLUME_CONFIG_OBJECT: &str = "volume.cfg";

/// The live, per-volume façade. One instance per open volume; created by
/// `create`/`open` and torn down by `destroy`/`migrate`.
pub struct VolumeEngine {
    volume_id: VolumeId,
    namespace: NamespaceId,
    size: u64,
    cluster_size: u32,
    owner_tag: OwnerTag,
    cfg: VolumeEngineConfig,
    object_store: Arc<dyn ObjectStore>,
    kv_store: Arc<dyn KvStore>,
    metadata_store: Arc<MetaDataStore>,
    sco_cache: Arc<SCOCache>,
    data_store: AsyncMutex<DataStore>,
    foc_client: Option<Arc<FailOverCacheClient>>,
    snapshot_manager: Arc<SnapshotManager>,
    promoter: BackendPromoter,
    health: Arc<HealthMonitor>,
    lock: PLRwLock<HeartbeatLock>,
    state: PLRwLock<EngineState>,
}

impl VolumeEngine {
    /// Allocates namespace state and writes the durable `VolumeConfig`.
    /// Does not open the volume for I/O; callers still need `open`.
    #[instrument(skip(object_store, kv_store))]
    pub async fn create(
        volume_id: VolumeId,
        namespace: NamespaceId,
        size: u64,
        cfg: VolumeEngineConfig,
        object_store: Arc<dyn ObjectStore>,
        kv_store: Arc<dyn KvStore>,
        parent: Option<(NamespaceId, String)>,
    ) -> EngineResult<()> {
        object_store
            .create_namespace(&namespace)
            .await
            .map_err(|source| EngineError::ObjectStore {
                volume: namespace.clone(),
                source,
            })?;

        let config = VolumeConfig {
            volume_id,
            namespace: namespace.clone(),
            size,
            cluster_size: cfg.cluster_size,
            clusters_per_sco: cfg.clusters_per_sco,
            scos_per_tlog: cfg.scos_per_tlog,
            parent,
            owner_tag: OwnerTag::ZERO,
        };
        let bytes = serde_json::to_vec(&config).expect("volume config always serializes");
        object_store
            .write(&namespace, VOLUME_CONFIG_OBJECT, bytes.into(), WriteCondition::IfAbsent)
            .await
            .map_err(|source| EngineError::ObjectStore {
                volume: namespace.clone(),
                source,
            })?;

        let manager = SnapshotManager::new(namespace.clone(), object_store.clone(), config.parent.is_some());
        manager.load().await.map_err(|source| EngineError::Snapshot {
            volume: namespace.clone(),
            source,
        })?;
        info!(volume = %namespace, "volume created");
        Ok(())
    }

    /// Opens a volume for I/O. Acquires the heartbeat lock (minting a
    /// fresh fencing `OwnerTag`), then local-restarts if the local TLog
    /// directory looks intact, falling back to a full backend restart.
    #[instrument(skip(object_store, kv_store, cfg))]
    pub async fn open(
        namespace: NamespaceId,
        tlog_dir: std::path::PathBuf,
        cfg: VolumeEngineConfig,
        object_store: Arc<dyn ObjectStore>,
        kv_store: Arc<dyn KvStore>,
        sco_cache: Arc<SCOCache>,
        foc_addr: Option<String>,
    ) -> EngineResult<Self> {
        let bytes = object_store
            .read_latest(&namespace, VOLUME_CONFIG_OBJECT)
            .await
            .map_err(|source| EngineError::ObjectStore {
                volume: namespace.clone(),
                source,
            })?;
        let config: VolumeConfig = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::BadRequest {
                volume: namespace.clone(),
                message: format!("corrupt volume.cfg: {e}"),
            }
        })?;

        let tag_seed = OwnerTag(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        );
        let mut lock = HeartbeatLock::acquire(
            namespace.clone(),
            kv_store.clone(),
            tag_seed,
            cfg.heartbeat_lease,
        )
        .await
        .map_err(|source| EngineError::Lock {
            volume: namespace.clone(),
            source,
        })?;
        let owner_tag = tag_seed;
        lock.renew().await.ok();

        let persisted = VolumeConfig { owner_tag, ..config.clone() };
        let persisted_bytes = serde_json::to_vec(&persisted).expect("volume config always serializes");
        object_store
            .write(&namespace, VOLUME_CONFIG_OBJECT, persisted_bytes.into(), WriteCondition::Always)
            .await
            .map_err(|source| EngineError::ObjectStore {
                volume: namespace.clone(),
                source,
            })?;

        // Backed by the shared `KvStore` rather than an in-process map so a
        // clone's ancestor fallback (below) can see the parent's pages even
        // though parent and clone are separate `VolumeEngine` instances.
        let metadata_store = Arc::new(MetaDataStore::new(
            namespace.clone(),
            Arc::new(KvStoreBackend::new(kv_store.clone())),
        ));
        if let Some((parent_namespace, _parent_snap)) = &config.parent {
            let mut nsid_map = NSIDMap::new();
            nsid_map.insert(1, parent_namespace.clone());
            metadata_store.set_nsid_map(nsid_map);
        }

        let snapshot_manager = Arc::new(SnapshotManager::new(
            namespace.clone(),
            object_store.clone(),
            config.parent.is_some(),
        ));
        snapshot_manager
            .load()
            .await
            .map_err(|source| EngineError::Snapshot {
                volume: namespace.clone(),
                source,
            })?;

        // Backend restart: replay every TLog since the last known cork.
        let accumulator = BackendRestartAccumulator::new(metadata_store.nsid_map());
        let snapshots = snapshot_manager.list();
        let current_tlogs = snapshot_manager.current_tlogs();
        let plan = accumulator
            .plan(&[(0, snapshots, current_tlogs.clone())], None, None)
            .map_err(|source| EngineError::BadRequest {
                volume: namespace.clone(),
                message: source.to_string(),
            })?;
        for (_clone_id, tlog_ids) in &plan.by_clone {
            replay_tlogs(&metadata_store, &object_store, &namespace, &tlog_dir, tlog_ids)
                .await
                .map_err(|source| EngineError::BadRequest {
                    volume: namespace.clone(),
                    message: source.to_string(),
                })?;
        }

        let next_sco_number = sco_cache.list(&namespace).into_iter().max().map(|n| n + 1).unwrap_or(0);
        let mut data_store = DataStore::new(
            DataStoreGeometry {
                namespace: namespace.clone(),
                cluster_size: config.cluster_size,
                clusters_per_sco: config.clusters_per_sco,
                scos_per_tlog: config.scos_per_tlog,
                open_scos_per_volume: cfg.open_scos_per_volume,
                tlog_dir,
            },
            sco_cache.clone(),
            next_sco_number,
            uuid::Uuid::new_v4(),
        )
        .map_err(|source| EngineError::ScoCache {
            volume: namespace.clone(),
            source: crate::sco_cache::SCOCacheError::Io {
                path: namespace.clone(),
                message: source.to_string(),
            },
        })?;

        let health = Arc::new(HealthMonitor::new(cfg.degraded_error_threshold, cfg.degraded_window));

        let foc_client = if cfg.foc_enabled {
            if let Some(addr) = foc_addr {
                let mode = if cfg.foc_synchronous {
                    FocMode::Synchronous
                } else {
                    FocMode::Asynchronous { queue_depth: cfg.foc_queue_depth }
                };
                let health_cb = health.clone();
                let client = FailOverCacheClient::connect(
                    addr,
                    namespace.clone(),
                    config.cluster_size,
                    owner_tag,
                    mode,
                    cfg.acquire_timeout,
                    Some(Arc::new(move |_err| {
                        health_cb.report(ComponentFailure { at: Instant::now() });
                    })),
                )
                .await;
                match client {
                    Ok(c) => Some(c),
                    Err(e) if cfg.ignore_foc_if_unreachable => {
                        warn!(volume = %namespace, error = %e, "failover cache unreachable, continuing without it");
                        None
                    }
                    Err(e) => {
                        return Err(EngineError::FailOverCache {
                            volume: namespace.clone(),
                            source: e,
                        })
                    }
                }
            } else {
                None
            }
        } else {
            None
        };

        // FOC-assisted crash recovery: entries the failover cache still
        // holds but this restart's TLog replay never picked up (the local
        // write crashed before it reached the TLog) are re-applied as
        // fresh writes so nothing acknowledged to the FOC is lost.
        if let Some(foc) = &foc_client {
            let entries = foc.get_range().await.map_err(|source| EngineError::FailOverCache {
                volume: namespace.clone(),
                source,
            })?;
            for entry in entries {
                let wanted_hash = crate::types::ContentHash::of(&entry.bytes);
                let current = metadata_store
                    .read(entry.lba as ClusterAddress)
                    .await
                    .map_err(|source| EngineError::MetaData {
                        volume: namespace.clone(),
                        source,
                    })?;
                if current.map(|(_, hash)| hash) == Some(wanted_hash) {
                    continue;
                }
                let (cl, hash) = data_store.append(&entry.bytes).map_err(|source| EngineError::ScoCache {
                    volume: namespace.clone(),
                    source: match source {
                        crate::data_store::DataStoreError::ScoCache { source } => source,
                        _ => crate::sco_cache::SCOCacheError::Io {
                            path: namespace.clone(),
                            message: source.to_string(),
                        },
                    },
                })?;
                data_store
                    .append_loc(entry.lba as ClusterAddress, cl, hash)
                    .map_err(|source| EngineError::ScoCache {
                        volume: namespace.clone(),
                        source: match source {
                            crate::data_store::DataStoreError::ScoCache { source } => source,
                            _ => crate::sco_cache::SCOCacheError::Io {
                                path: namespace.clone(),
                                message: source.to_string(),
                            },
                        },
                    })?;
                metadata_store
                    .write(entry.lba as ClusterAddress, cl, hash)
                    .await
                    .map_err(|source| EngineError::MetaData {
                        volume: namespace.clone(),
                        source,
                    })?;
            }
            info!(volume = %namespace, "replayed outstanding failover cache entries");
        }

        let promoter = BackendPromoter::start(
            object_store.clone(),
            sco_cache.clone(),
            cfg.promoter_worker_count,
            cfg.promoter_queue_depth,
            RetryPolicy {
                retries_on_error: cfg.retries_on_error,
                retry_interval: cfg.retry_interval,
                retry_backoff_multiplier: cfg.retry_backoff_multiplier,
            },
        );

        info!(volume = %namespace, owner_tag = %owner_tag, "volume opened");

        Ok(Self {
            volume_id: config.volume_id,
            namespace,
            size: config.size,
            cluster_size: config.cluster_size,
            owner_tag,
            cfg,
            object_store,
            kv_store,
            metadata_store,
            sco_cache,
            data_store: AsyncMutex::new(data_store),
            foc_client,
            snapshot_manager,
            promoter,
            health,
            lock: PLRwLock::new(lock),
            state: PLRwLock::new(EngineState::Running),
        })
    }

    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    pub fn owner_tag(&self) -> OwnerTag {
        self.owner_tag
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn ensure_not_halted(&self) -> EngineResult<()> {
        if *self.state.read() == EngineState::Halted {
            return Err(EngineError::Halted {
                volume: self.namespace.clone(),
                reason: "engine halted, awaiting operator intervention".to_string(),
            });
        }
        Ok(())
    }

    /// Any invariant violation routes here: transitions the engine to
    /// `Halted` so all further writes fail until an operator intervenes.
    pub fn halt(&self, reason: String) {
        warn!(volume = %self.namespace, reason = %reason, "halting volume engine");
        *self.state.write() = EngineState::Halted;
        self.health.halt(reason);
    }

    /// Rejects a `CA` whose cluster range falls outside the volume's
    /// configured `size`.
    fn ensure_in_bounds(&self, ca: ClusterAddress) -> EngineResult<()> {
        let end = (ca as u64 + 1) * self.cluster_size as u64;
        if end > self.size {
            return Err(EngineError::BadRequest {
                volume: self.namespace.clone(),
                message: format!(
                    "cluster address {ca} (end byte {end}) exceeds volume size {} bytes",
                    self.size
                ),
            });
        }
        Ok(())
    }

    fn sync_health_state(&self) {
        let mut state = self.state.write();
        if *state == EngineState::Halted {
            return;
        }
        *state = match self.health.state() {
            HealthState::Running => EngineState::Running,
            HealthState::Degraded => EngineState::Degraded,
            HealthState::Halted => EngineState::Halted,
        };
    }

    /// Consults `MetaDataStore`; an unmapped `CA` reads back as zeroes
    /// (a never-written cluster), otherwise locates the cluster via
    /// `SCOCache`, falling back to streaming it in from `ObjectStore`.
    #[instrument(skip(self))]
    pub async fn read(&self, ca: ClusterAddress, cluster_size: u32) -> EngineResult<Vec<u8>> {
        self.ensure_not_halted()?;
        self.ensure_in_bounds(ca)?;
        let entry = self
            .metadata_store
            .read(ca)
            .await
            .map_err(|source| EngineError::MetaData {
                volume: self.namespace.clone(),
                source,
            })?;
        let Some((cl, expected_hash)) = entry else {
            return Ok(vec![0u8; cluster_size as usize]);
        };

        // A location inherited from a clone ancestor lives under the
        // ancestor's own namespace, not this volume's.
        let read_namespace = if cl.is_own() {
            self.namespace.clone()
        } else {
            self.metadata_store
                .nsid_map()
                .resolve(cl.clone_id)
                .map(|ns| ns.clone())
                .map_err(|source| EngineError::MetaData {
                    volume: self.namespace.clone(),
                    source,
                })?
        };

        let mut handle = match self.sco_cache.open_sco(&read_namespace, cl.sco_number) {
            Ok(h) => h,
            Err(_) => {
                let object_name = format!("sco_{}", cl.sco_number);
                let bytes = self
                    .object_store
                    .read(&read_namespace, &object_name)
                    .await
                    .map_err(|source| EngineError::ObjectStore {
                        volume: self.namespace.clone(),
                        source,
                    })?;
                let start = cl.sco_offset as usize * cluster_size as usize;
                let end = start + cluster_size as usize;
                let data = bytes[start .. end].to_vec();
                let actual = crate::types::ContentHash::of(&data);
                if actual != expected_hash {
                    return Err(EngineError::ObjectStore {
                        volume: self.namespace.clone(),
                        source: crate::object_store::ObjectStoreError::ChecksumMismatch {
                            namespace: self.namespace.clone(),
                            name: object_name,
                        },
                    });
                }
                return Ok(data);
            }
        };
        let mut buf = vec![0u8; cluster_size as usize];
        handle
            .read_at(cl.sco_offset as u64 * cluster_size as u64, &mut buf)
            .map_err(|e| EngineError::ScoCache {
                volume: self.namespace.clone(),
                source: crate::sco_cache::SCOCacheError::Io {
                    path: handle.path.display().to_string(),
                    message: e.to_string(),
                },
            })?;
        let actual = crate::types::ContentHash::of(&buf);
        if actual != expected_hash {
            return Err(EngineError::ObjectStore {
                volume: self.namespace.clone(),
                source: crate::object_store::ObjectStoreError::ChecksumMismatch {
                    namespace: self.namespace.clone(),
                    name: format!("sco_{}", cl.sco_number),
                },
            });
        }
        Ok(buf)
    }

    /// `DataStore.append -> FailOverCacheClient.add -> TLog.append(LOC) ->
    /// MetaDataStore.write -> ack`, per §4.L.
    #[instrument(skip(self, bytes))]
    pub async fn write(&self, ca: ClusterAddress, bytes: Vec<u8>) -> EngineResult<()> {
        self.ensure_not_halted()?;
        self.ensure_in_bounds(ca)?;
        let mut ds = self.data_store.lock().await;
        let (cl, hash) = ds.append(&bytes).map_err(|source| EngineError::ScoCache {
            volume: self.namespace.clone(),
            source: match source {
                crate::data_store::DataStoreError::ScoCache { source } => source,
                _ => crate::sco_cache::SCOCacheError::Io {
                    path: self.namespace.clone(),
                    message: source.to_string(),
                },
            },
        })?;

        if let Some(foc) = &self.foc_client {
            let lba = ca as u64;
            if let Err(e) = foc.add(cl, lba, bytes).await {
                self.health.report(ComponentFailure { at: Instant::now() });
                self.sync_health_state();
                if !self.cfg.ignore_foc_if_unreachable {
                    return Err(EngineError::FailOverCache {
                        volume: self.namespace.clone(),
                        source: e,
                    });
                }
            }
        }

        ds.append_loc(ca, cl, hash)
            .map_err(|source| EngineError::ScoCache {
                volume: self.namespace.clone(),
                source: match source {
                    crate::data_store::DataStoreError::ScoCache { source } => source,
                    _ => crate::sco_cache::SCOCacheError::Io {
                        path: self.namespace.clone(),
                        message: source.to_string(),
                    },
                },
            })?;

        self.metadata_store
            .write(ca, cl, hash)
            .await
            .map_err(|source| EngineError::MetaData {
                volume: self.namespace.clone(),
                source,
            })?;

        let closed_scos = ds.drain_closed();
        let sealed_tlogs = ds.drain_sealed_tlogs();
        drop(ds);
        self.submit_promotions(closed_scos, sealed_tlogs).await
    }

    /// Submits every closed SCO and sealed TLog to the `BackendPromoter`.
    /// TLogs are submitted alongside their SCOs (not before) so the
    /// promoter's `UploadedSet` dependency gate has something to wait on.
    async fn submit_promotions(
        &self,
        closed_scos: Vec<crate::data_store::ClosedSco>,
        sealed_tlogs: Vec<crate::data_store::SealedTLog>,
    ) -> EngineResult<()> {
        for closed in closed_scos {
            self.promoter
                .submit(PromotionItem::Sco {
                    namespace: closed.namespace,
                    sco_number: closed.sco_number,
                    path: self.sco_cache.open_sco(&self.namespace, closed.sco_number)
                        .map(|h| h.path.clone())
                        .unwrap_or_default(),
                    owning_tlog: closed.tlog_id,
                })
                .await
                .map_err(|source| EngineError::Promoter {
                    volume: self.namespace.clone(),
                    source,
                })?;
        }
        for sealed in sealed_tlogs {
            self.promoter
                .submit(PromotionItem::TLog {
                    namespace: sealed.namespace,
                    tlog_id: sealed.tlog_id,
                    path: sealed.path,
                    depends_on_scos: sealed.depends_on_scos,
                })
                .await
                .map_err(|source| EngineError::Promoter {
                    volume: self.namespace.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Flushes the `FailOverCacheClient`, seals the current TLog/SCO
    /// buffers, and corks `MetaDataStore`.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> EngineResult<()> {
        self.ensure_not_halted()?;
        if let Some(foc) = &self.foc_client {
            foc.flush().await.map_err(|source| EngineError::FailOverCache {
                volume: self.namespace.clone(),
                source,
            })?;
        }
        let (tlog_id, closed_scos, sealed_tlogs) = {
            let mut ds = self.data_store.lock().await;
            let tlog_id = ds.rotate_tlog().map_err(|source| EngineError::ScoCache {
                volume: self.namespace.clone(),
                source: match source {
                    crate::data_store::DataStoreError::ScoCache { source } => source,
                    _ => crate::sco_cache::SCOCacheError::Io {
                        path: self.namespace.clone(),
                        message: source.to_string(),
                    },
                },
            })?;
            (tlog_id, ds.drain_closed(), ds.drain_sealed_tlogs())
        };
        self.submit_promotions(closed_scos, sealed_tlogs).await?;
        self.snapshot_manager.note_current_tlog(tlog_id);
        let cork = uuid::Uuid::new_v4();
        self.metadata_store
            .cork(cork)
            .await
            .map_err(|source| EngineError::MetaData {
                volume: self.namespace.clone(),
                source,
            })
    }

    pub async fn snapshot(&self, name: String, metadata: Vec<u8>) -> EngineResult<Snapshot> {
        self.ensure_not_halted()?;
        self.sync().await?;
        let cork = self.metadata_store.last_cork().unwrap_or_else(uuid::Uuid::new_v4);
        self.snapshot_manager
            .create(name, metadata, cork, self.sco_cache.non_disposable_bytes(&self.namespace))
            .await
            .map_err(|source| EngineError::Snapshot {
                volume: self.namespace.clone(),
                source,
            })
    }

    pub async fn restore(&self, name: &str) -> EngineResult<()> {
        self.ensure_not_halted()?;
        self.snapshot_manager
            .restore(name, &self.metadata_store)
            .await
            .map(|_| ())
            .map_err(|source| EngineError::Snapshot {
                volume: self.namespace.clone(),
                source,
            })
    }

    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.snapshot_manager.list()
    }

    pub async fn destroy(&self, delete_backend: bool) -> EngineResult<()> {
        *self.state.write() = EngineState::Destroyed;
        if delete_backend {
            self.object_store
                .delete_namespace(&self.namespace)
                .await
                .map_err(|source| EngineError::ObjectStore {
                    volume: self.namespace.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    /// Creates a new namespace for a clone of this volume anchored at
    /// `parent_snap`, writing a `VolumeConfig` that records the parent
    /// link. The clone's own metadata is not copied: its `MetaDataStore`
    /// resolves unwritten clusters through the `NSIDMap` back into this
    /// volume's namespace, lazily.
    #[instrument(skip(self, object_store, kv_store))]
    pub async fn clone_volume(
        &self,
        new_volume_id: VolumeId,
        new_namespace: NamespaceId,
        parent_snap: String,
        size: u64,
        cfg: VolumeEngineConfig,
        object_store: Arc<dyn ObjectStore>,
        kv_store: Arc<dyn KvStore>,
    ) -> EngineResult<()> {
        self.ensure_not_halted()?;
        if !self.snapshot_manager.list().iter().any(|s| s.name == parent_snap) {
            return Err(EngineError::BadRequest {
                volume: self.namespace.clone(),
                message: format!("unknown parent snapshot {parent_snap}"),
            });
        }
        Self::create(
            new_volume_id,
            new_namespace,
            size,
            cfg,
            object_store,
            kv_store,
            Some((self.namespace.clone(), parent_snap)),
        )
        .await
    }

    /// Seals all local state, ensures the backend has everything up to
    /// the last cork, and unregisters from the FailOverCache, releasing
    /// ownership so `target_node` can take over.
    #[instrument(skip(self))]
    pub async fn migrate(&self, target_node: &str) -> EngineResult<()> {
        self.ensure_not_halted()?;
        self.sync().await?;
        if let Some(foc) = &self.foc_client {
            foc.unregister().await.map_err(|source| EngineError::FailOverCache {
                volume: self.namespace.clone(),
                source,
            })?;
        }
        info!(volume = %self.namespace, target_node, "volume migrated");
        Ok(())
    }

    /// Applies a scrub result to this volume's own metadata. Clone-tree
    /// traversal (parent-then-children) is the caller's concern — the
    /// orchestrator builds one `ScrubManager` per scrub with every
    /// affected namespace as a target; this method covers the
    /// single-namespace case a `VolumeEngine` can drive on its own.
    #[instrument(skip(self, relocs))]
    pub async fn apply_scrub_result(
        &self,
        scrub_id: crate::types::ScrubId,
        relocs: Vec<crate::metadata_store::Reloc>,
    ) -> EngineResult<()> {
        self.ensure_not_halted()?;
        let scrub = crate::snapshot::ScrubManager::new(
            self.namespace.clone(),
            self.kv_store.clone(),
            vec![(self.namespace.clone(), self.metadata_store.clone())],
        );
        scrub
            .apply_scrub_result(scrub_id, relocs, self.volume_id)
            .await
            .map_err(|source| EngineError::Snapshot {
                volume: self.namespace.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv_store::memory::InMemoryKvStore, object_store::local_fs::LocalFsObjectStore,
        sco_cache::MountPointConfig,
    };

    async fn harness(dir: &std::path::Path) -> (VolumeEngine, Arc<dyn ObjectStore>) {
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFsObjectStore::new(dir.join("backend")));
        let kv_store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let sco_cache = Arc::new(SCOCache::new(vec![MountPointConfig {
            path: dir.join("cache"),
            capacity_bytes: 1 << 24,
            trigger_gap_bytes: 1 << 20,
            backoff_gap_bytes: 1 << 22,
        }]));
        let cfg = VolumeEngineConfig::builder()
            .with_clusters_per_sco(4)
            .with_scos_per_tlog(2)
            .build();

        VolumeEngine::create(
            uuid::Uuid::new_v4(),
            "ns0".to_string(),
            1 << 30,
            cfg.clone(),
            object_store.clone(),
            kv_store.clone(),
            None,
        )
        .await
        .unwrap();

        let engine = VolumeEngine::open(
            "ns0".to_string(),
            dir.join("tlogs"),
            cfg,
            object_store.clone(),
            kv_store,
            sco_cache,
            None,
        )
        .await
        .unwrap();
        (engine, object_store)
    }

    #[tokio::test]
    async fn write_then_read_back_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _os) = harness(dir.path()).await;
        engine.write(42, vec![7u8; 4096]).await.unwrap();
        let data = engine.read(42, 4096).await.unwrap();
        assert_eq!(data, vec![7u8; 4096]);
    }

    #[tokio::test]
    async fn unwritten_cluster_reads_as_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _os) = harness(dir.path()).await;
        let data = engine.read(99, 4096).await.unwrap();
        assert_eq!(data, vec![0u8; 4096]);
    }

    #[tokio::test]
    async fn halt_rejects_further_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _os) = harness(dir.path()).await;
        engine.halt("disk full".to_string());
        let err = engine.write(1, vec![1u8; 4096]).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::EngineErrorKind::Halted);
    }
}
