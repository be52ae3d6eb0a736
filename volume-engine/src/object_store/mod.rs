//! `ObjectStore`: the opaque backend blob store (S3/Alba/local filesystem)
//! the volume engine promotes SCOs and TLogs to. Out of scope per the
//! specification beyond this trait boundary; `local_fs` and `null_io` are
//! reference/test implementations only.

pub mod local_fs;
pub mod null_io;

use crate::error::EngineErrorKind;
use async_trait::async_trait;
use bytes::Bytes;
use snafu::Snafu;
use std::fmt::Debug;

/// Errors surfaced by an `ObjectStore` implementation.
#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum ObjectStoreError {
    #[snafu(display("namespace '{namespace}' does not exist"))]
    NamespaceMissing { namespace: String },
    #[snafu(display("object '{namespace}/{name}' does not exist"))]
    ObjectMissing { namespace: String, name: String },
    #[snafu(display("transient I/O error against '{namespace}/{name}': {message}"))]
    Transient {
        namespace: String,
        name: String,
        message: String,
    },
    #[snafu(display("checksum mismatch reading '{namespace}/{name}'"))]
    ChecksumMismatch { namespace: String, name: String },
    #[snafu(display("stale condition writing '{namespace}/{name}'"))]
    ConditionFailed { namespace: String, name: String },
}

impl ObjectStoreError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            ObjectStoreError::NamespaceMissing { .. } => {
                EngineErrorKind::NamespaceMissing
            }
            ObjectStoreError::ObjectMissing { .. } => {
                EngineErrorKind::ObjectMissing
            }
            ObjectStoreError::Transient { .. } => {
                EngineErrorKind::TransientBackend
            }
            ObjectStoreError::ChecksumMismatch { .. } => {
                EngineErrorKind::ChecksumMismatch
            }
            ObjectStoreError::ConditionFailed { .. } => {
                EngineErrorKind::TransientBackend
            }
        }
    }
}

/// A write-side conditional guard; used to implement the `OwnerTag`
/// fencing rule (5.4: "stale tags are rejected by the backend via
/// conditional writes").
#[derive(Debug, Clone)]
pub enum WriteCondition {
    /// Always write, overwriting any existing object.
    Always,
    /// Only write if the object doesn't exist yet.
    IfAbsent,
    /// Only write if the existing object's tag matches (used for
    /// compare-and-swap style updates of small control objects such as
    /// `volume.cfg`).
    IfTagMatches(String),
}

/// Opaque, eventually-consistent named blob store. One `ObjectStore`
/// instance is shared across all volumes/namespaces; every call is scoped
/// by `namespace`.
#[async_trait]
pub trait ObjectStore: Send + Sync + Debug {
    async fn list_namespaces(&self) -> Result<Vec<String>, ObjectStoreError>;

    async fn create_namespace(
        &self,
        namespace: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn delete_namespace(
        &self,
        namespace: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn list_objects(
        &self,
        namespace: &str,
    ) -> Result<Vec<String>, ObjectStoreError>;

    async fn read(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Bytes, ObjectStoreError>;

    /// Reads a set of byte ranges in one logical call; `insist_on_latest`
    /// forces a re-read against a strongly consistent path if the backend
    /// supports one, `fallback` is consulted if the primary read 404s.
    async fn partial_read(
        &self,
        namespace: &str,
        name: &str,
        slices: &[(u64, u64)],
        insist_on_latest: bool,
    ) -> Result<Vec<Bytes>, ObjectStoreError>;

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Result<(), ObjectStoreError>;

    async fn exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ObjectStoreError>;

    async fn size(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<u64, ObjectStoreError>;

    async fn checksum(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<[u8; 16], ObjectStoreError>;

    /// Removes an object. `may_not_exist` suppresses `ObjectMissing`,
    /// turning the call into an idempotent no-op for already-absent
    /// objects.
    async fn remove(
        &self,
        namespace: &str,
        name: &str,
        may_not_exist: bool,
    ) -> Result<(), ObjectStoreError>;

    /// Reads the object with `insist_on_latest_version` semantics:
    /// implementations that only offer eventual consistency on the plain
    /// `read` path should override this to force a strongly-consistent
    /// read. The default just retries once. Used by the restart algorithm
    /// (§4.L step 1).
    async fn read_latest(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        match self.read(namespace, name).await {
            Err(ObjectStoreError::ObjectMissing { .. }) => {
                self.read(namespace, name).await
            }
            other => other,
        }
    }
}
