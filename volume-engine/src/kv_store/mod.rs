//! `KvStore`: the opaque distributed lock store (Arakoon in the original
//! system; modelled here the way the teacher models its own `etcd`-backed
//! persistent store) used for small metadata, the heartbeat lock and the
//! scrub-manager work queue.

pub mod etcd;
pub mod memory;

use async_trait::async_trait;
use snafu::Snafu;
use std::fmt::Debug;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum KvStoreError {
    #[snafu(display("failed to connect to kv store: {message}"))]
    Connect { message: String },
    #[snafu(display("key '{key}' not found"))]
    MissingKey { key: String },
    #[snafu(display("compare-and-swap on '{key}' lost a race"))]
    CasConflict { key: String },
    #[snafu(display("failed to (de)serialise value for '{key}': {message}"))]
    Codec { key: String, message: String },
    #[snafu(display("kv store operation on '{key}' timed out"))]
    Timeout { key: String },
}

/// Opaque tag returned alongside a value, used for compare-and-swap.
/// Maps to etcd's mod-revision, or an equivalent version counter for other
/// backends.
pub type Tag = i64;

/// Linearizable key/value store. Unlike the teacher's `Store` trait (which
/// takes `&mut self` and is generic over `StoreKey`/`StoreValue`), this
/// trait is object-safe so a single boxed instance can be shared across
/// every volume without per-call monomorphisation.
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Tag), KvStoreError>;

    /// Unconditional set; returns the new tag.
    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        previous_tag: Option<Tag>,
    ) -> Result<Tag, KvStoreError>;

    /// Atomically replaces the value at `key` only if its current tag
    /// equals `expected`. Used by the heartbeat lock and `OwnerTag`
    /// fencing.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Tag,
        value: Vec<u8>,
    ) -> Result<Tag, KvStoreError>;

    async fn delete(&self, key: &str) -> Result<(), KvStoreError>;
}

#[async_trait]
pub trait KvStoreJsonExt: KvStore {
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<(T, Tag), KvStoreError> {
        let (bytes, tag) = self.get(key).await?;
        let value = serde_json::from_slice(&bytes).map_err(|e| {
            KvStoreError::Codec {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok((value, tag))
    }

    async fn set_json<T: serde::Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        previous_tag: Option<Tag>,
    ) -> Result<Tag, KvStoreError> {
        let bytes = serde_json::to_vec(value).map_err(|e| KvStoreError::Codec {
            key: key.to_string(),
            message: e.to_string(),
        })?;
        self.set(key, bytes, previous_tag).await
    }
}

impl<T: KvStore + ?Sized> KvStoreJsonExt for T {}
