//! Backend-restart support: `BackendRestartAccumulator` walks the clone
//! chain and the cork-delimited snapshot history to work out which TLogs
//! must be replayed, and `replay_tlogs` drives that replay into a fresh
//! `MetaDataStore`. Grounded in original_source's
//! `BackendRestartAccumulator.cpp`, expressed here as a plain value type
//! rather than a stateful visitor.

use crate::{
    error::EngineErrorKind,
    metadata_store::{MetaDataError, MetaDataStore, NSIDMap},
    object_store::{ObjectStore, ObjectStoreError},
    snapshot::Snapshot,
    tlog::{Entry, TLog, TLogError},
    types::{CloneId, NamespaceId, TLogId},
};
use snafu::Snafu;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum RestartError {
    #[snafu(display("object store error during restart: {source}"))]
    ObjectStore { source: ObjectStoreError },
    #[snafu(display("tlog error during restart: {source}"))]
    TLog { source: TLogError },
    #[snafu(display("metadata error during restart: {source}"))]
    MetaData { source: MetaDataError },
    #[snafu(display("cork {cork} is not reachable from any known snapshot"))]
    UnknownCork { cork: Uuid },
}

impl RestartError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            RestartError::ObjectStore { source } => source.kind(),
            RestartError::TLog { .. } => EngineErrorKind::TransientBackend,
            RestartError::MetaData { source } => source.kind(),
            RestartError::UnknownCork { .. } => EngineErrorKind::BadRequest,
        }
    }
}

/// The ordered TLog ids, per clone_id, that lie within a `(start_cork,
/// end_cork]` range — the unit of work a backend restart replays.
#[derive(Debug, Clone, Default)]
pub struct RestartPlan {
    pub by_clone: Vec<(CloneId, Vec<TLogId>)>,
}

/// Walks `self + every ancestor clone` via the `NSIDMap` and, for each,
/// works out which TLog ids fall within `(start_cork, end_cork]` by
/// scanning that clone's snapshot list: every snapshot's `tlog_ids` is
/// already grouped by the cork it was sealed under, so the accumulator
/// just needs to find the two snapshot boundaries and concatenate the
/// TLog ids strictly between them, plus whatever is still open past
/// `end_cork` (the "current tlogs" list).
pub struct BackendRestartAccumulator {
    nsid_map: NSIDMap,
}

impl BackendRestartAccumulator {
    pub fn new(nsid_map: NSIDMap) -> Self {
        Self { nsid_map }
    }

    /// `snapshots_by_clone` gives the ordered snapshot list plus the open
    /// "current tlogs" tail for each clone_id in the chain (own namespace
    /// is always `clone_id == 0`). `start_cork` is the last cork the
    /// caller's local state already reflects (`None` for a cold restart);
    /// `end_cork` is the most recent cork known to the backend.
    pub fn plan(
        &self,
        snapshots_by_clone: &[(CloneId, Vec<Snapshot>, Vec<TLogId>)],
        start_cork: Option<Uuid>,
        end_cork: Option<Uuid>,
    ) -> Result<RestartPlan, RestartError> {
        let mut by_clone = Vec::new();
        for (clone_id, snapshots, current_tlogs) in snapshots_by_clone {
            // Namespace resolution is only needed to validate the clone
            // chain is intact; the TLog ids themselves come from the
            // snapshot list already scoped to that namespace.
            if *clone_id != 0 {
                self.nsid_map
                    .resolve(*clone_id)
                    .map_err(|source| RestartError::MetaData { source })?;
            }

            let mut started = start_cork.is_none();
            let mut tlog_ids = Vec::new();
            for snapshot in snapshots {
                if started {
                    tlog_ids.extend(snapshot.tlog_ids.iter().copied());
                }
                if Some(snapshot.cork) == start_cork {
                    started = true;
                }
                if Some(snapshot.cork) == end_cork {
                    by_clone.push((*clone_id, tlog_ids));
                    tlog_ids = Vec::new();
                    started = false;
                    break;
                }
            }
            if started {
                // end_cork wasn't found among sealed snapshots: it's
                // either the still-open generation, or unknown.
                if end_cork.is_none() {
                    tlog_ids.extend(current_tlogs.iter().copied());
                    by_clone.push((*clone_id, tlog_ids));
                } else if !by_clone.iter().any(|(c, _)| c == clone_id) {
                    return Err(RestartError::UnknownCork {
                        cork: end_cork.expect("checked above"),
                    });
                }
            }
        }
        Ok(RestartPlan { by_clone })
    }
}

/// Replays every `Loc` entry from the given TLog files (in order) into
/// `mds`, advancing the store's cork on each `TLogCRC`. Corrupted
/// trailing bytes past the last `TLogCRC` are dropped per §4.F.
pub async fn replay_tlogs(
    mds: &MetaDataStore,
    object_store: &Arc<dyn ObjectStore>,
    namespace: &NamespaceId,
    local_tlog_dir: &std::path::Path,
    tlog_ids: &[TLogId],
) -> Result<(), RestartError> {
    for tlog_id in tlog_ids {
        let local_path = local_tlog_dir.join(tlog_id.to_string());
        let entries = if local_path.exists() {
            TLog::read_entries(&local_path).map_err(|source| RestartError::TLog { source })?
        } else {
            let object_name = format!("tlog_{tlog_id}");
            let bytes = object_store
                .read_latest(namespace, &object_name)
                .await
                .map_err(|source| RestartError::ObjectStore { source })?;
            crate::tlog::parse_entries(&bytes)
        };

        for entry in crate::tlog::entries_up_to_last_crc(&entries) {
            match entry {
                Entry::Loc { ca, cl, hash } => {
                    mds.write(*ca, *cl, *hash)
                        .await
                        .map_err(|source| RestartError::MetaData { source })?;
                }
                Entry::TLogCRC(_) => {
                    mds.cork(Uuid::new_v4())
                        .await
                        .map_err(|source| RestartError::MetaData { source })?;
                }
                Entry::SCOCRC(_) | Entry::SyncTC => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(tlog_ids: Vec<TLogId>, cork: Uuid) -> Snapshot {
        Snapshot {
            id: Uuid::new_v4(),
            name: "s".to_string(),
            metadata: vec![],
            tlog_ids,
            cork,
            size_at_snapshot: 0,
            state: crate::snapshot::SnapshotState::Complete,
        }
    }

    #[test]
    fn plan_collects_tlogs_between_corks() {
        let cork_a = Uuid::new_v4();
        let cork_b = Uuid::new_v4();
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let snapshots = vec![snapshot(vec![t1], cork_a), snapshot(vec![t2], cork_b)];

        let acc = BackendRestartAccumulator::new(NSIDMap::new());
        let plan = acc
            .plan(&[(0, snapshots, vec![])], Some(cork_a), Some(cork_b))
            .unwrap();
        assert_eq!(plan.by_clone, vec![(0, vec![t2])]);
    }

    #[test]
    fn plan_includes_current_tlogs_when_end_cork_is_open() {
        let cork_a = Uuid::new_v4();
        let t1 = Uuid::new_v4();
        let current = Uuid::new_v4();
        let snapshots = vec![snapshot(vec![t1], cork_a)];

        let acc = BackendRestartAccumulator::new(NSIDMap::new());
        let plan = acc
            .plan(&[(0, snapshots, vec![current])], Some(cork_a), None)
            .unwrap();
        assert_eq!(plan.by_clone, vec![(0, vec![current])]);
    }
}
