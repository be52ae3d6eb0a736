//! Pluggable persistence for `MetaDataStore` pages: in-process, Arakoon
//! (via the generic `KvStore` trait), or a remote MDS with slave rotation.

use super::page::Page;
use crate::{
    kv_store::{KvStore, KvStoreError},
    types::{NamespaceId, PageId},
};
use async_trait::async_trait;
use parking_lot::RwLock;
use snafu::Snafu;
use std::{collections::HashMap, sync::Arc};

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum BackendError {
    #[snafu(display("kv store error: {source}"))]
    KvStore { source: KvStoreError },
    #[snafu(display("codec error decoding page {page}: {message}"))]
    Codec { page: PageId, message: String },
    #[snafu(display(
        "no MDS slave within max_tlogs_behind ({max_tlogs_behind}); furthest behind was {worst_lag}"
    ))]
    SlaveTooFarBehind {
        max_tlogs_behind: u32,
        worst_lag: u32,
    },
}

#[async_trait]
pub trait MetaDataBackend: Send + Sync {
    async fn load_page(
        &self,
        namespace: &str,
        page: PageId,
    ) -> Result<Option<Page>, BackendError>;

    async fn store_page(
        &self,
        namespace: &str,
        page: PageId,
        contents: &Page,
    ) -> Result<(), BackendError>;
}

/// In-process backend: a RocksDB-like embedded store, here a plain
/// in-memory map — adequate for tests and for volumes that never
/// configure a remote metadata backend.
#[derive(Default)]
pub struct InProcessBackend {
    pages: RwLock<HashMap<(NamespaceId, PageId), Page>>,
}

impl InProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetaDataBackend for InProcessBackend {
    async fn load_page(
        &self,
        namespace: &str,
        page: PageId,
    ) -> Result<Option<Page>, BackendError> {
        Ok(self
            .pages
            .read()
            .get(&(namespace.to_string(), page))
            .cloned())
    }

    async fn store_page(
        &self,
        namespace: &str,
        page: PageId,
        contents: &Page,
    ) -> Result<(), BackendError> {
        self.pages
            .write()
            .insert((namespace.to_string(), page), contents.clone());
        Ok(())
    }
}

fn page_key(namespace: &str, page: PageId) -> String {
    format!("mdpage/{namespace}/{page}")
}

/// Arakoon-style backend: pages are serialized and stored as plain values
/// in the cluster-wide `KvStore`. No caching beyond `MetaDataStore`'s own
/// page cache.
pub struct KvStoreBackend {
    kv: Arc<dyn KvStore>,
}

impl KvStoreBackend {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl MetaDataBackend for KvStoreBackend {
    async fn load_page(
        &self,
        namespace: &str,
        page: PageId,
    ) -> Result<Option<Page>, BackendError> {
        match self.kv.get(&page_key(namespace, page)).await {
            Ok((bytes, _tag)) => {
                let decoded: HashMap<u32, (crate::types::ClusterLocation, crate::types::ContentHash)> =
                    serde_json::from_slice(&bytes).map_err(|e| BackendError::Codec {
                        page,
                        message: e.to_string(),
                    })?;
                Ok(Some(Page {
                    entries: decoded,
                }))
            }
            Err(KvStoreError::MissingKey { .. }) => Ok(None),
            Err(source) => Err(BackendError::KvStore { source }),
        }
    }

    async fn store_page(
        &self,
        namespace: &str,
        page: PageId,
        contents: &Page,
    ) -> Result<(), BackendError> {
        let bytes = serde_json::to_vec(&contents.entries).map_err(|e| BackendError::Codec {
            page,
            message: e.to_string(),
        })?;
        let key = page_key(namespace, page);
        let existing_tag = match self.kv.get(&key).await {
            Ok((_, tag)) => Some(tag),
            Err(KvStoreError::MissingKey { .. }) => None,
            Err(source) => return Err(BackendError::KvStore { source }),
        };
        self.kv
            .set(&key, bytes, existing_tag)
            .await
            .map_err(|source| BackendError::KvStore { source })?;
        Ok(())
    }
}

/// One candidate node in an MDS deployment: a master plus zero or more
/// slaves, each reporting how many TLogs behind the master's tail it is.
#[derive(Debug, Clone)]
pub struct MdsNode {
    pub endpoint: String,
    pub tlogs_behind: u32,
}

/// Remote paged metadata server with slave failover. `rotate` picks the
/// best-qualified slave (lowest lag within `max_tlogs_behind`) when the
/// current master is unreachable; the actual page I/O here is delegated
/// to an inner `KvStoreBackend` pointed at whichever node is active,
/// since the wire protocol to a real MDS node is out of scope.
pub struct MdsBackend {
    nodes: RwLock<Vec<MdsNode>>,
    active: RwLock<usize>,
    max_tlogs_behind: u32,
    inner: KvStoreBackend,
}

impl MdsBackend {
    pub fn new(nodes: Vec<MdsNode>, max_tlogs_behind: u32, kv: Arc<dyn KvStore>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            active: RwLock::new(0),
            max_tlogs_behind,
            inner: KvStoreBackend::new(kv),
        }
    }

    /// Rotates to the next node whose lag is within bounds. Fails
    /// `SlaveTooFarBehind` if none qualify.
    pub fn rotate(&self) -> Result<(), BackendError> {
        let nodes = self.nodes.read();
        let best = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.tlogs_behind <= self.max_tlogs_behind)
            .min_by_key(|(_, n)| n.tlogs_behind);
        match best {
            Some((idx, _)) => {
                *self.active.write() = idx;
                Ok(())
            }
            None => {
                let worst_lag = nodes.iter().map(|n| n.tlogs_behind).max().unwrap_or(0);
                Err(BackendError::SlaveTooFarBehind {
                    max_tlogs_behind: self.max_tlogs_behind,
                    worst_lag,
                })
            }
        }
    }
}

#[async_trait]
impl MetaDataBackend for MdsBackend {
    async fn load_page(
        &self,
        namespace: &str,
        page: PageId,
    ) -> Result<Option<Page>, BackendError> {
        self.inner.load_page(namespace, page).await
    }

    async fn store_page(
        &self,
        namespace: &str,
        page: PageId,
        contents: &Page,
    ) -> Result<(), BackendError> {
        self.inner.store_page(namespace, page, contents).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_picks_least_lagging_qualifying_node() {
        let mds = MdsBackend::new(
            vec![
                MdsNode { endpoint: "a".to_string(), tlogs_behind: 50 },
                MdsNode { endpoint: "b".to_string(), tlogs_behind: 5 },
            ],
            10,
            Arc::new(crate::kv_store::memory::InMemoryKvStore::new()),
        );
        mds.rotate().unwrap();
        assert_eq!(*mds.active.read(), 1);
    }

    #[test]
    fn rotate_fails_when_all_slaves_too_far_behind() {
        let mds = MdsBackend::new(
            vec![MdsNode { endpoint: "a".to_string(), tlogs_behind: 50 }],
            10,
            Arc::new(crate::kv_store::memory::InMemoryKvStore::new()),
        );
        let err = mds.rotate().unwrap_err();
        assert!(matches!(err, BackendError::SlaveTooFarBehind { .. }));
    }
}
