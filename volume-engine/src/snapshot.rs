//! Component J: the ordered snapshot list plus its asynchronous scrub
//! post-processor.
//!
//! `SnapshotManager` owns one volume's snapshot history and the "current"
//! (not yet snapshotted) TLog sequence. `ScrubManager` applies scrub
//! relocation results to a clone-parent snapshot and then to every clone
//! in its DAG, persisting its work queue in `KvStore` so a crash mid-apply
//! resumes cleanly (apply_relocs is idempotent by `ScrubId`).

use crate::{
    error::EngineErrorKind,
    kv_store::{KvStore, KvStoreError},
    metadata_store::{MetaDataError, MetaDataStore, Reloc},
    object_store::{ObjectStore, ObjectStoreError, WriteCondition},
    types::{NamespaceId, ScrubId, TLogId, VolumeId},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum SnapshotError {
    #[snafu(display("no snapshot named {name} exists"))]
    NotFound { name: String },
    #[snafu(display("cannot delete {name}: it is the only remaining snapshot"))]
    LastSnapshot { name: String },
    #[snafu(display("cannot delete {name}: it is the clone-parent's first snapshot"))]
    CloneParentFirst { name: String },
    #[snafu(display("metadata description for {name} exceeds 4KB"))]
    MetadataTooLarge { name: String },
    #[snafu(display("object store error: {source}"))]
    ObjectStore { source: ObjectStoreError },
    #[snafu(display("metadata store error: {source}"))]
    MetaData { source: MetaDataError },
    #[snafu(display("kv store error: {source}"))]
    KvStore { source: KvStoreError },
}

impl SnapshotError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            SnapshotError::NotFound { .. } => EngineErrorKind::ObjectMissing,
            SnapshotError::LastSnapshot { .. }
            | SnapshotError::CloneParentFirst { .. }
            | SnapshotError::MetadataTooLarge { .. } => EngineErrorKind::BadRequest,
            SnapshotError::ObjectStore { .. } => EngineErrorKind::TransientBackend,
            SnapshotError::MetaData { .. } => EngineErrorKind::TransientBackend,
            SnapshotError::KvStore { .. } => EngineErrorKind::TransientBackend,
        }
    }
}

pub const MAX_SNAPSHOT_METADATA_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    /// Sealed locally; not every referenced TLog/SCO has reached the backend.
    Pending,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub name: String,
    pub metadata: Vec<u8>,
    pub tlog_ids: Vec<TLogId>,
    pub cork: Uuid,
    pub size_at_snapshot: u64,
    pub state: SnapshotState,
}

/// Serialized form persisted to `ObjectStore` — "snapshots.xml-equivalent"
/// in the original prose, here a JSON document under `snapshots.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotPersistor {
    snapshots: Vec<Snapshot>,
    current_tlogs: Vec<TLogId>,
}

const SNAPSHOTS_OBJECT_NAME: &str = "snapshots.json";

pub struct SnapshotManager {
    namespace: NamespaceId,
    object_store: Arc<dyn ObjectStore>,
    /// `Some` when this volume is a clone: the parent's own first
    /// snapshot may not be deleted out from under it.
    is_clone: bool,
    state: RwLock<SnapshotPersistor>,
}

impl SnapshotManager {
    pub fn new(
        namespace: NamespaceId,
        object_store: Arc<dyn ObjectStore>,
        is_clone: bool,
    ) -> Self {
        Self {
            namespace,
            object_store,
            is_clone,
            state: RwLock::new(SnapshotPersistor::default()),
        }
    }

    pub async fn load(&self) -> Result<(), SnapshotError> {
        match self
            .object_store
            .read_latest(&self.namespace, SNAPSHOTS_OBJECT_NAME)
            .await
        {
            Ok(bytes) => {
                let persistor: SnapshotPersistor = serde_json::from_slice(&bytes)
                    .unwrap_or_default();
                *self.state.write() = persistor;
                Ok(())
            }
            Err(ObjectStoreError::ObjectMissing { .. }) => Ok(()),
            Err(source) => Err(SnapshotError::ObjectStore { source }),
        }
    }

    async fn persist(&self) -> Result<(), SnapshotError> {
        let bytes = {
            let state = self.state.read();
            serde_json::to_vec(&*state).expect("snapshot list always serializes")
        };
        self.object_store
            .write(&self.namespace, SNAPSHOTS_OBJECT_NAME, bytes.into(), WriteCondition::Always)
            .await
            .map_err(|source| SnapshotError::ObjectStore { source })
    }

    pub fn list(&self) -> Vec<Snapshot> {
        self.state.read().snapshots.clone()
    }

    pub fn current_tlogs(&self) -> Vec<TLogId> {
        self.state.read().current_tlogs.clone()
    }

    pub fn note_current_tlog(&self, id: TLogId) {
        self.state.write().current_tlogs.push(id);
    }

    /// Seals the current TLog sequence into a new, `Pending` snapshot.
    /// Returns immediately; the caller (`BackendPromoter`'s completion
    /// hook) later calls `mark_complete` once every referenced TLog and
    /// SCO has reached the backend.
    pub async fn create(
        &self,
        name: String,
        metadata: Vec<u8>,
        cork: Uuid,
        size_at_snapshot: u64,
    ) -> Result<Snapshot, SnapshotError> {
        if metadata.len() > MAX_SNAPSHOT_METADATA_BYTES {
            return Err(SnapshotError::MetadataTooLarge { name });
        }
        let snapshot = {
            let mut state = self.state.write();
            let tlog_ids = std::mem::take(&mut state.current_tlogs);
            let snapshot = Snapshot {
                id: Uuid::new_v4(),
                name,
                metadata,
                tlog_ids,
                cork,
                size_at_snapshot,
                state: SnapshotState::Pending,
            };
            state.snapshots.push(snapshot.clone());
            snapshot
        };
        self.persist().await?;
        Ok(snapshot)
    }

    pub async fn mark_complete(&self, id: Uuid) -> Result<(), SnapshotError> {
        {
            let mut state = self.state.write();
            if let Some(s) = state.snapshots.iter_mut().find(|s| s.id == id) {
                s.state = SnapshotState::Complete;
            }
        }
        self.persist().await
    }

    /// Rewinds to `name`: drops every later snapshot's TLogs and the
    /// current TLog sequence, returning the cork to rewind the
    /// `MetaDataStore` to.
    pub async fn restore(
        &self,
        name: &str,
        metadata_store: &MetaDataStore,
    ) -> Result<Uuid, SnapshotError> {
        let cork = {
            let mut state = self.state.write();
            let idx = state
                .snapshots
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| SnapshotError::NotFound {
                    name: name.to_string(),
                })?;
            let cork = state.snapshots[idx].cork;
            state.snapshots.truncate(idx + 1);
            state.current_tlogs.clear();
            cork
        };
        metadata_store
            .uncork(Some(cork))
            .map_err(|source| SnapshotError::MetaData { source })?;
        self.persist().await?;
        Ok(cork)
    }

    /// Removes `name` unless it is the volume's only snapshot, or (for a
    /// clone) its first snapshot — the clone-parent boundary.
    pub async fn delete(&self, name: &str) -> Result<(), SnapshotError> {
        {
            let mut state = self.state.write();
            let idx = state
                .snapshots
                .iter()
                .position(|s| s.name == name)
                .ok_or_else(|| SnapshotError::NotFound {
                    name: name.to_string(),
                })?;
            if state.snapshots.len() == 1 {
                return Err(SnapshotError::LastSnapshot {
                    name: name.to_string(),
                });
            }
            if self.is_clone && idx == 0 {
                return Err(SnapshotError::CloneParentFirst {
                    name: name.to_string(),
                });
            }
            state.snapshots.remove(idx);
        }
        self.persist().await
    }
}

/// One queued scrub application: the relocation tuples plus which
/// namespaces (clone-parent first, then each clone) still need it applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScrubWork {
    scrub_id: ScrubId,
    relocs: Vec<SerializableReloc>,
    applied_to: Vec<NamespaceId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct SerializableReloc {
    ca: u32,
    old_cl: u64,
    new_cl: u64,
    hash: [u8; 16],
}

impl From<Reloc> for SerializableReloc {
    fn from(r: Reloc) -> Self {
        Self {
            ca: r.ca,
            old_cl: r.old_cl.to_bits(),
            new_cl: r.new_cl.to_bits(),
            hash: r.hash.0,
        }
    }
}

impl From<SerializableReloc> for Reloc {
    fn from(r: SerializableReloc) -> Self {
        Reloc {
            ca: r.ca,
            old_cl: crate::types::ClusterLocation::from_bits(r.old_cl),
            new_cl: crate::types::ClusterLocation::from_bits(r.new_cl),
            hash: crate::types::ContentHash(r.hash),
        }
    }
}

fn scrub_key(namespace: &str, scrub_id: ScrubId) -> String {
    format!("scrub/{namespace}/{scrub_id}")
}

/// Asynchronous post-processor applying scrub results to a clone-parent
/// snapshot's `MetaDataStore` and then to each clone in its DAG.
pub struct ScrubManager {
    namespace: NamespaceId,
    kv: Arc<dyn KvStore>,
    /// Clone-parent first, then each clone, in DAG traversal order.
    targets: Vec<(NamespaceId, Arc<MetaDataStore>)>,
}

impl ScrubManager {
    pub fn new(
        namespace: NamespaceId,
        kv: Arc<dyn KvStore>,
        targets: Vec<(NamespaceId, Arc<MetaDataStore>)>,
    ) -> Self {
        Self {
            namespace,
            kv,
            targets,
        }
    }

    /// Persists the work item, then applies it. Splitting these lets a
    /// crash between persist and apply resume via `resume_pending`
    /// without losing the relocation stream.
    pub async fn apply_scrub_result(
        &self,
        scrub_id: ScrubId,
        relocs: Vec<Reloc>,
        _volume: VolumeId,
    ) -> Result<(), SnapshotError> {
        let work = ScrubWork {
            scrub_id,
            relocs: relocs.iter().copied().map(SerializableReloc::from).collect(),
            applied_to: vec![],
        };
        self.persist_work(&work).await?;
        self.drive(work).await
    }

    async fn persist_work(&self, work: &ScrubWork) -> Result<(), SnapshotError> {
        let bytes = serde_json::to_vec(work).expect("scrub work always serializes");
        let key = scrub_key(&self.namespace, work.scrub_id);
        let existing = match self.kv.get(&key).await {
            Ok((_, tag)) => Some(tag),
            Err(KvStoreError::MissingKey { .. }) => None,
            Err(source) => return Err(SnapshotError::KvStore { source }),
        };
        self.kv
            .set(&key, bytes, existing)
            .await
            .map_err(|source| SnapshotError::KvStore { source })?;
        Ok(())
    }

    async fn drive(&self, mut work: ScrubWork) -> Result<(), SnapshotError> {
        let relocs: Vec<Reloc> = work.relocs.iter().copied().map(Reloc::from).collect();
        for (namespace, mds) in &self.targets {
            if work.applied_to.contains(namespace) {
                continue;
            }
            mds.apply_relocs(&relocs, work.scrub_id)
                .await
                .map_err(|source| SnapshotError::MetaData { source })?;
            work.applied_to.push(namespace.clone());
            self.persist_work(&work).await?;
        }
        Ok(())
    }

    /// Resumes any work item left partially applied by a crash: reads it
    /// back from `KvStore` and re-drives it. `apply_relocs` being
    /// idempotent by `scrub_id` makes re-applying to already-done targets
    /// harmless even if `applied_to` bookkeeping itself were lost.
    pub async fn resume_pending(&self, scrub_id: ScrubId) -> Result<(), SnapshotError> {
        let key = scrub_key(&self.namespace, scrub_id);
        let (bytes, _tag) = match self.kv.get(&key).await {
            Ok(v) => v,
            Err(KvStoreError::MissingKey { .. }) => return Ok(()),
            Err(source) => return Err(SnapshotError::KvStore { source }),
        };
        let work: ScrubWork = serde_json::from_slice(&bytes).map_err(|e| {
            SnapshotError::KvStore {
                source: KvStoreError::Codec {
                    key: key.clone(),
                    message: e.to_string(),
                },
            }
        })?;
        self.drive(work).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        kv_store::memory::InMemoryKvStore, metadata_store::InProcessBackend,
        object_store::local_fs::LocalFsObjectStore, types::ClusterLocation,
    };

    async fn fresh_manager(dir: &std::path::Path, is_clone: bool) -> SnapshotManager {
        let os = Arc::new(LocalFsObjectStore::new(dir.to_path_buf()));
        os.create_namespace("ns0").await.unwrap();
        SnapshotManager::new("ns0".to_string(), os, is_clone)
    }

    #[tokio::test]
    async fn create_then_list_round_trips_through_object_store() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = fresh_manager(dir.path(), false).await;
        mgr.note_current_tlog(Uuid::new_v4());
        let snap = mgr
            .create("snap0".to_string(), vec![], Uuid::new_v4(), 0)
            .await
            .unwrap();
        assert_eq!(mgr.list().len(), 1);
        assert_eq!(mgr.list()[0].id, snap.id);
        assert!(mgr.current_tlogs().is_empty());
    }

    #[tokio::test]
    async fn delete_last_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = fresh_manager(dir.path(), false).await;
        mgr.create("only".to_string(), vec![], Uuid::new_v4(), 0)
            .await
            .unwrap();
        let err = mgr.delete("only").await.unwrap_err();
        assert!(matches!(err, SnapshotError::LastSnapshot { .. }));
    }

    #[tokio::test]
    async fn delete_clone_parents_first_snapshot_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = fresh_manager(dir.path(), true).await;
        mgr.create("root".to_string(), vec![], Uuid::new_v4(), 0)
            .await
            .unwrap();
        mgr.create("second".to_string(), vec![], Uuid::new_v4(), 0)
            .await
            .unwrap();
        let err = mgr.delete("root").await.unwrap_err();
        assert!(matches!(err, SnapshotError::CloneParentFirst { .. }));
        mgr.delete("second").await.unwrap();
    }

    #[tokio::test]
    async fn scrub_manager_applies_parent_then_clone() {
        let kv = Arc::new(InMemoryKvStore::new());
        let parent_mds = Arc::new(MetaDataStore::new(
            "parent".to_string(),
            Arc::new(InProcessBackend::new()),
        ));
        let clone_mds = Arc::new(MetaDataStore::new(
            "clone".to_string(),
            Arc::new(InProcessBackend::new()),
        ));
        let old_cl = ClusterLocation::new(1, 0);
        let new_cl = ClusterLocation::new(2, 0);
        let hash = crate::types::ContentHash::of(b"x");
        parent_mds.write(7, old_cl, hash).await.unwrap();
        clone_mds.write(7, old_cl, hash).await.unwrap();

        let scrubber = ScrubManager::new(
            "parent".to_string(),
            kv,
            vec![
                ("parent".to_string(), parent_mds.clone()),
                ("clone".to_string(), clone_mds.clone()),
            ],
        );
        let scrub_id = Uuid::new_v4();
        scrubber
            .apply_scrub_result(
                scrub_id,
                vec![Reloc { ca: 7, old_cl, new_cl, hash }],
                Uuid::new_v4(),
            )
            .await
            .unwrap();

        assert_eq!(parent_mds.read(7).await.unwrap(), Some((new_cl, hash)));
        assert_eq!(clone_mds.read(7).await.unwrap(), Some((new_cl, hash)));
    }
}
