//! Component K: the worker pool that promotes closed SCOs and sealed
//! TLogs to the `ObjectStore`, with per-namespace TLog/SCO upload
//! ordering and exponential-backoff retry.

use crate::{
    error::EngineErrorKind,
    object_store::{ObjectStore, ObjectStoreError, WriteCondition},
    sco_cache::{SCOCache, SCOCacheError},
    types::{NamespaceId, ScoNumber, TLogId},
};
use snafu::Snafu;
use std::{sync::Arc, time::Duration};
use tracing::{error, warn};

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum PromoterError {
    #[snafu(display("object store error promoting {namespace}/{object}: {source}"))]
    ObjectStore {
        namespace: String,
        object: String,
        source: ObjectStoreError,
    },
    #[snafu(display("sco cache error promoting {namespace}/{sco}: {source}"))]
    ScoCache {
        namespace: String,
        sco: ScoNumber,
        source: SCOCacheError,
    },
    #[snafu(display("{namespace}/{object} exhausted {attempts} retries"))]
    RetriesExhausted { namespace: String, object: String, attempts: u32 },
}

impl PromoterError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            PromoterError::ObjectStore { source, .. } => source.kind(),
            PromoterError::ScoCache { source, .. } => source.kind(),
            PromoterError::RetriesExhausted { .. } => EngineErrorKind::TransientBackend,
        }
    }
}

/// Backoff schedule for a single work item's retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries_on_error: u32,
    pub retry_interval: Duration,
    pub retry_backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries_on_error: 5,
            retry_interval: Duration::from_millis(200),
            retry_backoff_multiplier: 2.0,
        }
    }
}

/// One unit of promotion work: either a closed SCO or a sealed TLog.
#[derive(Debug, Clone)]
pub enum PromotionItem {
    Sco {
        namespace: NamespaceId,
        sco_number: ScoNumber,
        path: std::path::PathBuf,
        owning_tlog: TLogId,
    },
    TLog {
        namespace: NamespaceId,
        tlog_id: TLogId,
        path: std::path::PathBuf,
        /// SCOs this TLog references; must all be uploaded first.
        depends_on_scos: Vec<ScoNumber>,
    },
}

impl PromotionItem {
    fn namespace(&self) -> &str {
        match self {
            PromotionItem::Sco { namespace, .. } => namespace,
            PromotionItem::TLog { namespace, .. } => namespace,
        }
    }

    fn object_name(&self) -> String {
        match self {
            PromotionItem::Sco { sco_number, .. } => format!("sco_{sco_number}"),
            PromotionItem::TLog { tlog_id, .. } => format!("tlog_{tlog_id}"),
        }
    }
}

/// Tracks, per namespace, which SCOs have already been promoted — lets a
/// TLog item wait until every SCO it depends on is uploaded before it
/// uploads itself (the ordering guarantee in §4.K).
#[derive(Default)]
struct UploadedSet {
    scos: parking_lot::RwLock<std::collections::HashSet<(NamespaceId, ScoNumber)>>,
}

impl UploadedSet {
    fn mark(&self, namespace: &str, sco: ScoNumber) {
        self.scos.write().insert((namespace.to_string(), sco));
    }

    fn all_present(&self, namespace: &str, scos: &[ScoNumber]) -> bool {
        let set = self.scos.read();
        scos.iter().all(|s| set.contains(&(namespace.to_string(), *s)))
    }
}

/// A worker pool pulling promotion items off a bounded queue and writing
/// them to `ObjectStore`. `submit` never blocks the append path directly;
/// `DataStore`'s backpressure throttle (driven by `queue_depth`) is what
/// keeps the queue bounded.
pub struct BackendPromoter {
    tx: async_channel::Sender<PromotionItem>,
    uploaded: Arc<UploadedSet>,
}

impl BackendPromoter {
    pub fn start(
        object_store: Arc<dyn ObjectStore>,
        sco_cache: Arc<SCOCache>,
        worker_count: usize,
        queue_depth: usize,
        policy: RetryPolicy,
    ) -> Self {
        let (tx, rx) = async_channel::bounded(queue_depth);
        let uploaded = Arc::new(UploadedSet::default());
        for worker_id in 0 .. worker_count {
            let rx = rx.clone();
            let object_store = object_store.clone();
            let sco_cache = sco_cache.clone();
            let uploaded = uploaded.clone();
            tokio::spawn(async move {
                run_worker(worker_id, rx, object_store, sco_cache, uploaded, policy).await;
            });
        }
        Self { tx, uploaded }
    }

    /// Queue depth available right now, for `DataStore`'s backpressure
    /// throttle (`non_disposable_scos_factor x scos_per_tlog`).
    pub fn queue_len(&self) -> usize {
        self.tx.len()
    }

    pub async fn submit(&self, item: PromotionItem) -> Result<(), PromoterError> {
        self.tx.send(item).await.map_err(|_| PromoterError::RetriesExhausted {
            namespace: "unknown".to_string(),
            object: "queue closed".to_string(),
            attempts: 0,
        })
    }
}

async fn run_worker(
    worker_id: usize,
    rx: async_channel::Receiver<PromotionItem>,
    object_store: Arc<dyn ObjectStore>,
    sco_cache: Arc<SCOCache>,
    uploaded: Arc<UploadedSet>,
    policy: RetryPolicy,
) {
    while let Ok(item) = rx.recv().await {
        if let PromotionItem::TLog {
            namespace,
            depends_on_scos,
            ..
        } = &item
        {
            while !uploaded.all_present(namespace, depends_on_scos) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
        match promote_with_retry(&item, &object_store, &sco_cache, policy).await {
            Ok(()) => {
                if let PromotionItem::Sco {
                    namespace,
                    sco_number,
                    ..
                } = &item
                {
                    uploaded.mark(namespace, *sco_number);
                }
            }
            Err(e) => error!(worker_id, error = %e, "promotion item exhausted retries"),
        }
    }
}

async fn promote_with_retry(
    item: &PromotionItem,
    object_store: &Arc<dyn ObjectStore>,
    sco_cache: &Arc<SCOCache>,
    policy: RetryPolicy,
) -> Result<(), PromoterError> {
    let namespace = item.namespace().to_string();
    let object = item.object_name();
    let mut delay = policy.retry_interval;
    let mut attempt = 0;
    loop {
        match promote_once(item, object_store, sco_cache).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < policy.retries_on_error => {
                warn!(namespace = %namespace, object = %object, attempt, error = %e, "retrying promotion");
                tokio::time::sleep(delay).await;
                delay = delay.mul_f64(policy.retry_backoff_multiplier);
                attempt += 1;
            }
            Err(_) => {
                return Err(PromoterError::RetriesExhausted {
                    namespace,
                    object,
                    attempts: attempt,
                })
            }
        }
    }
}

async fn promote_once(
    item: &PromotionItem,
    object_store: &Arc<dyn ObjectStore>,
    sco_cache: &Arc<SCOCache>,
) -> Result<(), PromoterError> {
    match item {
        PromotionItem::Sco {
            namespace,
            sco_number,
            path,
            ..
        } => {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                PromoterError::ObjectStore {
                    namespace: namespace.clone(),
                    object: format!("sco_{sco_number}"),
                    source: ObjectStoreError::Transient {
                        namespace: namespace.clone(),
                        name: format!("sco_{sco_number}"),
                        message: e.to_string(),
                    },
                }
            })?;
            object_store
                .write(
                    namespace,
                    &format!("sco_{sco_number}"),
                    bytes.into(),
                    WriteCondition::Always,
                )
                .await
                .map_err(|source| PromoterError::ObjectStore {
                    namespace: namespace.clone(),
                    object: format!("sco_{sco_number}"),
                    source,
                })?;
            sco_cache
                .set_disposable(namespace, *sco_number)
                .map_err(|source| PromoterError::ScoCache {
                    namespace: namespace.clone(),
                    sco: *sco_number,
                    source,
                })?;
            // A newly disposable SCO may push its mountpoint over the
            // trigger gap; check immediately rather than waiting for the
            // next unrelated promotion to stumble into it.
            sco_cache.cleanup();
            Ok(())
        }
        PromotionItem::TLog {
            namespace,
            tlog_id,
            path,
            ..
        } => {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                PromoterError::ObjectStore {
                    namespace: namespace.clone(),
                    object: format!("tlog_{tlog_id}"),
                    source: ObjectStoreError::Transient {
                        namespace: namespace.clone(),
                        name: format!("tlog_{tlog_id}"),
                        message: e.to_string(),
                    },
                }
            })?;
            object_store
                .write(
                    namespace,
                    &format!("tlog_{tlog_id}"),
                    bytes.into(),
                    WriteCondition::Always,
                )
                .await
                .map_err(|source| PromoterError::ObjectStore {
                    namespace: namespace.clone(),
                    object: format!("tlog_{tlog_id}"),
                    source,
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{object_store::local_fs::LocalFsObjectStore, sco_cache::MountPointConfig};

    #[tokio::test]
    async fn sco_promotion_marks_disposable() {
        let dir = tempfile::tempdir().unwrap();
        let os = Arc::new(LocalFsObjectStore::new(dir.path().join("backend")));
        os.create_namespace("ns0").await.unwrap();
        let sco_cache = Arc::new(SCOCache::new(vec![MountPointConfig {
            path: dir.path().join("cache"),
            capacity_bytes: 1 << 20,
            trigger_gap_bytes: 1 << 10,
            backoff_gap_bytes: 1 << 15,
        }]));
        let mut handle = sco_cache.create_sco("ns0", 1, 4096).unwrap();
        handle.write_at(0, b"data").unwrap();
        handle.sync().unwrap();
        sco_cache.close_writing("ns0", 1).unwrap();

        let promoter = BackendPromoter::start(
            os.clone(),
            sco_cache.clone(),
            1,
            8,
            RetryPolicy {
                retries_on_error: 1,
                retry_interval: Duration::from_millis(1),
                retry_backoff_multiplier: 1.0,
            },
        );
        promoter
            .submit(PromotionItem::Sco {
                namespace: "ns0".to_string(),
                sco_number: 1,
                path: handle.path.clone(),
                owning_tlog: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap();

        for _ in 0 .. 50 {
            if sco_cache.state("ns0", 1) == Some(crate::sco_cache::ScoState::ClosedDisposable) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            sco_cache.state("ns0", 1),
            Some(crate::sco_cache::ScoState::ClosedDisposable)
        );
        assert!(os.exists("ns0", "sco_1").await.unwrap());
    }
}
