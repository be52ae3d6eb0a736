//! etcd-backed `KvStore`, grounded in the teacher's own `store::etcd::Etcd`
//! client wrapper.

use super::{KvStore, KvStoreError, Tag};
use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, Txn, TxnOp};

/// etcd client. Cheap to clone; `etcd_client::Client` is itself a handle
/// around a shared channel.
#[derive(Clone)]
pub struct EtcdKvStore(Client);

impl std::fmt::Debug for EtcdKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdKvStore").finish()
    }
}

impl EtcdKvStore {
    pub async fn new(endpoint: &str) -> Result<Self, KvStoreError> {
        Ok(Self(Client::connect([endpoint], None).await.map_err(
            |e| KvStoreError::Connect {
                message: e.to_string(),
            },
        )?))
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Tag), KvStoreError> {
        let mut client = self.0.clone();
        let resp = client.get(key, None).await.map_err(|e| KvStoreError::Timeout {
            key: format!("{key}: {e}"),
        })?;
        let kv = resp.kvs().first().ok_or_else(|| KvStoreError::MissingKey {
            key: key.to_string(),
        })?;
        Ok((kv.value().to_vec(), kv.mod_revision()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        _previous_tag: Option<Tag>,
    ) -> Result<Tag, KvStoreError> {
        let mut client = self.0.clone();
        client.put(key, value, None).await.map_err(|e| {
            KvStoreError::Timeout {
                key: format!("{key}: {e}"),
            }
        })?;
        let (_, tag) = self.get(key).await?;
        Ok(tag)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Tag,
        value: Vec<u8>,
    ) -> Result<Tag, KvStoreError> {
        let mut client = self.0.clone();
        let txn = Txn::new()
            .when(vec![Compare::mod_revision(
                key,
                CompareOp::Equal,
                expected,
            )])
            .and_then(vec![TxnOp::put(key, value, None)]);
        let resp =
            client
                .txn(txn)
                .await
                .map_err(|e| KvStoreError::Timeout {
                    key: format!("{key}: {e}"),
                })?;
        if !resp.succeeded() {
            return Err(KvStoreError::CasConflict {
                key: key.to_string(),
            });
        }
        let (_, tag) = self.get(key).await?;
        Ok(tag)
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        let mut client = self.0.clone();
        client
            .delete(key, None)
            .await
            .map(|_| ())
            .map_err(|e| KvStoreError::Timeout {
                key: format!("{key}: {e}"),
            })
    }
}
