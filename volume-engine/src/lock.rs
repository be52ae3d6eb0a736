//! `HeartbeatLock`: a CAS state machine over `KvStore` gating
//! `VolumeEngine::open`. A volume may only be opened by one owner at a
//! time; the lock record carries an expiry so a crashed owner's lock is
//! reclaimable without an explicit unlock.

use crate::{
    error::EngineErrorKind,
    kv_store::{KvStore, KvStoreError, Tag},
    types::OwnerTag,
};
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::{sync::Arc, time::Duration};

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum LockError {
    #[snafu(display("lock for {volume} is held by owner {holder} until {expires_at}"))]
    Held {
        volume: String,
        holder: u64,
        expires_at: i64,
    },
    #[snafu(display("lock for {volume} was taken by a newer owner during renewal"))]
    Preempted { volume: String },
    #[snafu(display("kv store error: {source}"))]
    KvStore { source: KvStoreError },
}

impl LockError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            LockError::Held { .. } | LockError::Preempted { .. } => {
                EngineErrorKind::Fenced
            }
            LockError::KvStore { .. } => EngineErrorKind::TransientBackend,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner_tag: u64,
    /// Unix millis; the lock is reclaimable by anyone once this passes.
    expires_at: i64,
    /// Incremented on every successful acquire/renew; purely diagnostic.
    counter: u64,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn lock_key(volume: &str) -> String {
    format!("lock/{volume}")
}

/// A held heartbeat lock. Dropping it doesn't release anything —
/// ownership is purely expiry-based, matching the original
/// `HeartBeatLockCommunicator`'s "renew or let it lapse" model.
pub struct HeartbeatLock {
    volume: String,
    kv: Arc<dyn KvStore>,
    owner_tag: OwnerTag,
    lease: Duration,
    tag: Tag,
}

impl HeartbeatLock {
    /// Attempts to acquire the lock for `volume`. Succeeds if no record
    /// exists, or the existing record has expired, or `owner_tag` is
    /// already the stamped holder (idempotent re-acquire, e.g. a retried
    /// `open` after a transient KvStore timeout).
    pub async fn acquire(
        volume: String,
        kv: Arc<dyn KvStore>,
        owner_tag: OwnerTag,
        lease: Duration,
    ) -> Result<Self, LockError> {
        let key = lock_key(&volume);
        let existing = match kv.get(&key).await {
            Ok((bytes, tag)) => {
                let record: LockRecord = serde_json::from_slice(&bytes).unwrap_or(LockRecord {
                    owner_tag: 0,
                    expires_at: 0,
                    counter: 0,
                });
                Some((record, tag))
            }
            Err(KvStoreError::MissingKey { .. }) => None,
            Err(source) => return Err(LockError::KvStore { source }),
        };

        let now = now_millis();
        let (counter, previous_tag) = match &existing {
            Some((record, _tag))
                if record.expires_at > now && record.owner_tag != owner_tag.0 =>
            {
                return Err(LockError::Held {
                    volume,
                    holder: record.owner_tag,
                    expires_at: record.expires_at,
                });
            }
            Some((record, tag)) => (record.counter + 1, Some(*tag)),
            None => (0, None),
        };

        let record = LockRecord {
            owner_tag: owner_tag.0,
            expires_at: now + lease.as_millis() as i64,
            counter,
        };
        let bytes = serde_json::to_vec(&record).expect("lock record always serializes");
        let new_tag = match previous_tag {
            Some(tag) => kv
                .compare_and_swap(&key, tag, bytes)
                .await
                .map_err(|source| match source {
                    KvStoreError::CasConflict { .. } => LockError::Preempted {
                        volume: volume.clone(),
                    },
                    other => LockError::KvStore { source: other },
                })?,
            None => kv
                .set(&key, bytes, None)
                .await
                .map_err(|source| LockError::KvStore { source })?,
        };

        Ok(Self {
            volume,
            kv,
            owner_tag,
            lease,
            tag: new_tag,
        })
    }

    /// Extends the lease. Fails `Preempted` if a newer owner has already
    /// taken over — the caller should treat this as a fencing signal and
    /// halt (§4.N).
    pub async fn renew(&mut self) -> Result<(), LockError> {
        let key = lock_key(&self.volume);
        let record = LockRecord {
            owner_tag: self.owner_tag.0,
            expires_at: now_millis() + self.lease.as_millis() as i64,
            counter: 0,
        };
        let bytes = serde_json::to_vec(&record).expect("lock record always serializes");
        self.tag = self
            .kv
            .compare_and_swap(&key, self.tag, bytes)
            .await
            .map_err(|source| match source {
                KvStoreError::CasConflict { .. } => LockError::Preempted {
                    volume: self.volume.clone(),
                },
                other => LockError::KvStore { source: other },
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_store::memory::InMemoryKvStore;

    #[tokio::test]
    async fn second_owner_is_rejected_while_lease_live() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let _lock = HeartbeatLock::acquire(
            "vol0".to_string(),
            kv.clone(),
            OwnerTag(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let err = HeartbeatLock::acquire(
            "vol0".to_string(),
            kv,
            OwnerTag(2),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LockError::Held { .. }));
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let _lock = HeartbeatLock::acquire(
            "vol0".to_string(),
            kv.clone(),
            OwnerTag(1),
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        HeartbeatLock::acquire("vol0".to_string(), kv, OwnerTag(2), Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn renew_preserves_ownership() {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let mut lock = HeartbeatLock::acquire(
            "vol0".to_string(),
            kv,
            OwnerTag(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        lock.renew().await.unwrap();
    }
}
