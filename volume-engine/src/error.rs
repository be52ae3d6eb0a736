//! Aggregated error taxonomy exposed to front-ends.
//!
//! Every component owns a `snafu`-derived error enum scoped to its own
//! failure modes (`SCOCacheError`, `TLogError`, `FoCError`, ...). This
//! module maps all of them onto the small, stable `EngineErrorKind` that
//! front-ends (FUSE/XMLRPC/NetworkXio, the routing layer) actually need to
//! branch on, so those layers never match on internal per-component
//! variants.

use crate::{
    backend_promoter::PromoterError, foc::FoCError, kv_store::KvStoreError,
    lock::LockError, metadata_store::MetaDataError, object_store::ObjectStoreError,
    sco_cache::SCOCacheError, snapshot::SnapshotError,
};
use snafu::Snafu;

/// Stable, front-end-visible classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    TransientBackend,
    NamespaceMissing,
    ObjectMissing,
    ChecksumMismatch,
    FocUnreachable,
    OutOfSpace,
    Fenced,
    Halted,
    BadRequest,
    Cancelled,
}

/// Top-level engine error. Intra-core components return their own error
/// types; `VolumeEngine` wraps them here.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("sco cache error for volume {volume}: {source}"))]
    ScoCache {
        volume: String,
        source: SCOCacheError,
    },
    #[snafu(display("metadata store error for volume {volume}: {source}"))]
    MetaData {
        volume: String,
        source: MetaDataError,
    },
    #[snafu(display("failover cache error for volume {volume}: {source}"))]
    FailOverCache { volume: String, source: FoCError },
    #[snafu(display("snapshot error for volume {volume}: {source}"))]
    Snapshot {
        volume: String,
        source: SnapshotError,
    },
    #[snafu(display("backend promotion error for volume {volume}: {source}"))]
    Promoter {
        volume: String,
        source: PromoterError,
    },
    #[snafu(display("object store error for volume {volume}: {source}"))]
    ObjectStore {
        volume: String,
        source: ObjectStoreError,
    },
    #[snafu(display("kv store error for volume {volume}: {source}"))]
    KvStore {
        volume: String,
        source: KvStoreError,
    },
    #[snafu(display(
        "owner tag {ours} fenced by newer tag {theirs} for volume {volume}"
    ))]
    Fenced {
        volume: String,
        ours: String,
        theirs: String,
    },
    #[snafu(display("volume {volume} is halted: {reason}"))]
    Halted { volume: String, reason: String },
    #[snafu(display("bad request for volume {volume}: {message}"))]
    BadRequest { volume: String, message: String },
    #[snafu(display("operation on volume {volume} was cancelled"))]
    Cancelled { volume: String },
    #[snafu(display("no mountpoint has room for volume {volume}"))]
    OutOfSpace { volume: String },
    #[snafu(display("heartbeat lock error for volume {volume}: {source}"))]
    Lock { volume: String, source: LockError },
}

impl EngineError {
    /// Collapses the rich internal error into the stable taxonomy that
    /// front-ends are allowed to depend on.
    pub fn kind(&self) -> EngineErrorKind {
        use EngineErrorKind::*;
        match self {
            EngineError::ScoCache { source, .. } => source.kind(),
            EngineError::MetaData { source, .. } => source.kind(),
            EngineError::FailOverCache { source, .. } => source.kind(),
            EngineError::Snapshot { source, .. } => source.kind(),
            EngineError::Promoter { source, .. } => source.kind(),
            EngineError::ObjectStore { source, .. } => source.kind(),
            EngineError::KvStore { .. } => TransientBackend,
            EngineError::Fenced { .. } => Fenced,
            EngineError::Halted { .. } => Halted,
            EngineError::BadRequest { .. } => BadRequest,
            EngineError::Cancelled { .. } => Cancelled,
            EngineError::OutOfSpace { .. } => OutOfSpace,
            EngineError::Lock { source, .. } => source.kind(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
