//! `DataStore`: the append path. Owns a small number of write-open SCOs,
//! appends incoming cluster writes to them, and closes/rotates as they
//! fill up, handing closed SCOs off to the `BackendPromoter` queue.

use crate::{
    error::EngineErrorKind,
    sco_cache::{SCOCache, SCOCacheError},
    tlog::{Entry, TLog, TLogError},
    types::{ClusterLocation, ContentHash, NamespaceId, ScoNumber},
};
use snafu::Snafu;
use std::{collections::VecDeque, path::PathBuf, sync::Arc};

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum DataStoreError {
    #[snafu(display("sco cache error: {source}"))]
    ScoCache { source: SCOCacheError },
    #[snafu(display("tlog error: {source}"))]
    TLog { source: TLogError },
    #[snafu(display("open_scos_per_volume exceeded: {limit}"))]
    TooManyOpenScos { limit: u32 },
}

impl DataStoreError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            DataStoreError::ScoCache { source } => source.kind(),
            DataStoreError::TLog { source } => source.kind(),
            DataStoreError::TooManyOpenScos { .. } => {
                EngineErrorKind::BadRequest
            }
        }
    }
}

/// Closed SCO handed from `DataStore` to the `BackendPromoter` queue.
#[derive(Debug, Clone)]
pub struct ClosedSco {
    pub namespace: NamespaceId,
    pub sco_number: ScoNumber,
    pub tlog_id: crate::types::TLogId,
}

/// Sealed TLog handed from `DataStore` to the `BackendPromoter` queue,
/// carrying the SCOs it references so the promoter can wait for them to
/// land on the backend first.
#[derive(Debug, Clone)]
pub struct SealedTLog {
    pub namespace: NamespaceId,
    pub tlog_id: crate::types::TLogId,
    pub path: PathBuf,
    pub depends_on_scos: Vec<ScoNumber>,
}

struct OpenSco {
    sco_number: ScoNumber,
    next_offset: u16,
}

/// Configuration the `DataStore` needs from the volume: geometry and
/// limits that don't change across the volume's lifetime.
#[derive(Debug, Clone)]
pub struct DataStoreGeometry {
    pub namespace: NamespaceId,
    pub cluster_size: u32,
    pub clusters_per_sco: u32,
    pub scos_per_tlog: u32,
    pub open_scos_per_volume: u32,
    pub tlog_dir: PathBuf,
}

impl DataStoreGeometry {
    pub fn sco_size_bytes(&self) -> u64 {
        self.cluster_size as u64 * self.clusters_per_sco as u64
    }
}

/// The append path. Synchronous by design, per §5: the writer thread holds
/// the append mutex for the duration of `append`/`close_current`, and
/// never touches the backend directly.
pub struct DataStore {
    geometry: DataStoreGeometry,
    sco_cache: Arc<SCOCache>,
    next_sco_number: ScoNumber,
    open: VecDeque<OpenSco>,
    current_tlog: TLog,
    scos_closed_since_rotate: u32,
    closed_ready: Vec<ClosedSco>,
    sealed_ready: Vec<SealedTLog>,
    /// SCOs closed under the current (not yet sealed) TLog.
    current_tlog_scos: Vec<ScoNumber>,
}

impl DataStore {
    pub fn new(
        geometry: DataStoreGeometry,
        sco_cache: Arc<SCOCache>,
        next_sco_number: ScoNumber,
        tlog_id: crate::types::TLogId,
    ) -> Result<Self, DataStoreError> {
        std::fs::create_dir_all(&geometry.tlog_dir).ok();
        let current_tlog = TLog::create(&geometry.tlog_dir, tlog_id)
            .map_err(|source| DataStoreError::TLog { source })?;
        Ok(Self {
            geometry,
            sco_cache,
            next_sco_number,
            open: VecDeque::new(),
            current_tlog,
            scos_closed_since_rotate: 0,
            closed_ready: vec![],
            sealed_ready: vec![],
            current_tlog_scos: vec![],
        })
    }

    pub fn current_tlog_id(&self) -> crate::types::TLogId {
        self.current_tlog.id()
    }

    fn open_new_sco(&mut self) -> Result<(), DataStoreError> {
        if self.open.len() as u32 >= self.geometry.open_scos_per_volume {
            return Err(DataStoreError::TooManyOpenScos {
                limit: self.geometry.open_scos_per_volume,
            });
        }
        let sco_number = self.next_sco_number;
        self.next_sco_number += 1;
        self.sco_cache
            .create_sco(
                &self.geometry.namespace,
                sco_number,
                self.geometry.sco_size_bytes(),
            )
            .map_err(|source| DataStoreError::ScoCache { source })?;
        self.open.push_back(OpenSco {
            sco_number,
            next_offset: 0,
        });
        Ok(())
    }

    /// Appends one cluster. Returns the `(ClusterLocation, ContentHash)`
    /// pair the caller needs to record into the `MetaDataStore` and TLog.
    pub fn append(
        &mut self,
        bytes: &[u8],
    ) -> Result<(ClusterLocation, ContentHash), DataStoreError> {
        if self.open.is_empty() {
            self.open_new_sco()?;
        }
        let clusters_per_sco = self.geometry.clusters_per_sco as u16;
        let sco_full = self
            .open
            .back()
            .map(|o| o.next_offset >= clusters_per_sco)
            .unwrap_or(true);
        if sco_full {
            let sco_number = self.open.back().unwrap().sco_number;
            self.close_sco(sco_number)?;
            self.open_new_sco()?;
        }

        let hash = ContentHash::of(bytes);
        let open_sco = self.open.back_mut().unwrap();
        let sco_number = open_sco.sco_number;
        let sco_offset = open_sco.next_offset;
        open_sco.next_offset += 1;

        let mut handle = self
            .sco_cache
            .open_sco(&self.geometry.namespace, sco_number)
            .or_else(|_| {
                self.sco_cache.create_sco(
                    &self.geometry.namespace,
                    sco_number,
                    self.geometry.sco_size_bytes(),
                )
            })
            .map_err(|source| DataStoreError::ScoCache { source })?;
        handle
            .write_at(sco_offset as u64 * self.geometry.cluster_size as u64, bytes)
            .map_err(|e| DataStoreError::ScoCache {
                source: SCOCacheError::Io {
                    path: handle.path.display().to_string(),
                    message: e.to_string(),
                },
            })?;

        let cl = ClusterLocation::new(sco_number, sco_offset);
        Ok((cl, hash))
    }

    /// Closes the given SCO: fsyncs, appends an `SCOCRC` entry to the
    /// current TLog, records it for hand-off to `BackendPromoter`. Every
    /// `scos_per_tlog` closes also rolls the TLog.
    fn close_sco(&mut self, sco_number: ScoNumber) -> Result<(), DataStoreError> {
        self.open.retain(|o| o.sco_number != sco_number);
        let handle = self
            .sco_cache
            .open_sco(&self.geometry.namespace, sco_number)
            .map_err(|source| DataStoreError::ScoCache { source })?;
        handle.sync().map_err(|e| DataStoreError::ScoCache {
            source: SCOCacheError::Io {
                path: handle.path.display().to_string(),
                message: e.to_string(),
            },
        })?;
        let bytes = std::fs::read(&handle.path).map_err(|e| {
            DataStoreError::ScoCache {
                source: SCOCacheError::Io {
                    path: handle.path.display().to_string(),
                    message: e.to_string(),
                },
            }
        })?;
        let crc = crc::crc32::checksum_ieee(&bytes);
        self.current_tlog
            .append(Entry::SCOCRC(crc))
            .map_err(|source| DataStoreError::TLog { source })?;
        self.sco_cache
            .close_writing(&self.geometry.namespace, sco_number)
            .map_err(|source| DataStoreError::ScoCache { source })?;

        self.closed_ready.push(ClosedSco {
            namespace: self.geometry.namespace.clone(),
            sco_number,
            tlog_id: self.current_tlog.id(),
        });
        self.current_tlog_scos.push(sco_number);
        self.scos_closed_since_rotate += 1;
        if self.scos_closed_since_rotate >= self.geometry.scos_per_tlog {
            self.rotate_tlog()?;
        }
        Ok(())
    }

    /// Seals the current TLog and opens a fresh one, queuing it (with the
    /// SCOs it references) for promotion. Called automatically every
    /// `scos_per_tlog` closes, and explicitly by `SnapshotManager` when
    /// sealing a snapshot boundary.
    pub fn rotate_tlog(&mut self) -> Result<crate::types::TLogId, DataStoreError> {
        let sealed_id = self.current_tlog.id();
        let sealed_path = self
            .current_tlog
            .seal(&self.geometry.tlog_dir)
            .map_err(|source| DataStoreError::TLog { source })?;
        self.sealed_ready.push(SealedTLog {
            namespace: self.geometry.namespace.clone(),
            tlog_id: sealed_id,
            path: sealed_path,
            depends_on_scos: std::mem::take(&mut self.current_tlog_scos),
        });
        self.scos_closed_since_rotate = 0;
        let new_id = uuid::Uuid::new_v4();
        self.current_tlog = TLog::create(&self.geometry.tlog_dir, new_id)
            .map_err(|source| DataStoreError::TLog { source })?;
        Ok(sealed_id)
    }

    /// Drains the SCOs that have been closed since the last drain, for
    /// hand-off to `BackendPromoter`.
    pub fn drain_closed(&mut self) -> Vec<ClosedSco> {
        std::mem::take(&mut self.closed_ready)
    }

    /// Drains the TLogs sealed since the last drain, for hand-off to
    /// `BackendPromoter`.
    pub fn drain_sealed_tlogs(&mut self) -> Vec<SealedTLog> {
        std::mem::take(&mut self.sealed_ready)
    }

    pub fn append_loc(
        &mut self,
        ca: crate::types::ClusterAddress,
        cl: ClusterLocation,
        hash: ContentHash,
    ) -> Result<(), DataStoreError> {
        self.current_tlog
            .append(Entry::Loc { ca, cl, hash })
            .map_err(|source| DataStoreError::TLog { source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sco_cache::MountPointConfig;

    fn store(dir: &std::path::Path) -> DataStore {
        let sco_cache = Arc::new(SCOCache::new(vec![MountPointConfig {
            path: dir.join("scos"),
            capacity_bytes: 1 << 24,
            trigger_gap_bytes: 1 << 20,
            backoff_gap_bytes: 1 << 22,
        }]));
        DataStore::new(
            DataStoreGeometry {
                namespace: "ns0".to_string(),
                cluster_size: 4096,
                clusters_per_sco: 4,
                scos_per_tlog: 2,
                open_scos_per_volume: 1,
                tlog_dir: dir.join("tlogs"),
            },
            sco_cache,
            0,
            uuid::Uuid::new_v4(),
        )
        .unwrap()
    }

    #[test]
    fn append_fills_and_rotates_scos() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = store(dir.path());
        for i in 0 .. 4u32 {
            let (cl, _) = ds.append(&vec![i as u8; 4096]).unwrap();
            assert_eq!(cl.sco_number, 0);
            assert_eq!(cl.sco_offset, i as u16);
        }
        // Fifth write overflows the 4-cluster SCO: forces a close + new SCO.
        let (cl, _) = ds.append(&[9u8; 4096]).unwrap();
        assert_eq!(cl.sco_number, 1);
        assert_eq!(cl.sco_offset, 0);
        let closed = ds.drain_closed();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].sco_number, 0);
    }

    #[test]
    fn tlog_rotates_after_scos_per_tlog_closes() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = store(dir.path());
        let first_tlog = ds.current_tlog_id();
        // 2 full SCOs (scos_per_tlog=2) -> 8 clusters forces 2 closes.
        for i in 0 .. 8u32 {
            ds.append(&vec![i as u8; 4096]).unwrap();
        }
        assert_ne!(ds.current_tlog_id(), first_tlog);

        // The auto-rotate must have queued the sealed TLog for promotion,
        // carrying both SCOs it closed.
        let sealed = ds.drain_sealed_tlogs();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].tlog_id, first_tlog);
        assert_eq!(sealed[0].depends_on_scos, vec![0, 1]);
    }

    #[test]
    fn manual_rotate_also_queues_sealed_tlog() {
        let dir = tempfile::tempdir().unwrap();
        let mut ds = store(dir.path());
        ds.append(&[1u8; 4096]).unwrap();
        let sealed_id = ds.rotate_tlog().unwrap();
        let sealed = ds.drain_sealed_tlogs();
        assert_eq!(sealed.len(), 1);
        assert_eq!(sealed[0].tlog_id, sealed_id);
        assert!(sealed[0].depends_on_scos.is_empty());
    }
}
