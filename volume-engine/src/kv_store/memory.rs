//! In-process `KvStore` used by tests and the scenario harness.

use super::{KvStore, KvStoreError, Tag};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Tag)>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Tag), KvStoreError> {
        self.entries
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| KvStoreError::MissingKey {
                key: key.to_string(),
            })
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        previous_tag: Option<Tag>,
    ) -> Result<Tag, KvStoreError> {
        let mut entries = self.entries.lock();
        if let Some(expected) = previous_tag {
            match entries.get(key) {
                Some((_, tag)) if *tag != expected => {
                    return Err(KvStoreError::CasConflict {
                        key: key.to_string(),
                    })
                }
                None => {
                    return Err(KvStoreError::MissingKey {
                        key: key.to_string(),
                    })
                }
                _ => {}
            }
        }
        let next_tag =
            entries.get(key).map(|(_, t)| t + 1).unwrap_or(1);
        entries.insert(key.to_string(), (value, next_tag));
        Ok(next_tag)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Tag,
        value: Vec<u8>,
    ) -> Result<Tag, KvStoreError> {
        self.set(key, value, Some(expected)).await
    }

    async fn delete(&self, key: &str) -> Result<(), KvStoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cas_rejects_stale_tag() {
        let kv = InMemoryKvStore::new();
        let tag = kv.set("k", b"v1".to_vec(), None).await.unwrap();
        assert_eq!(tag, 1);
        let err = kv
            .compare_and_swap("k", tag + 1, b"v2".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, KvStoreError::CasConflict { .. }));
        let tag2 = kv.compare_and_swap("k", tag, b"v2".to_vec()).await.unwrap();
        assert_eq!(tag2, 2);
    }

    #[tokio::test]
    async fn missing_key_reported() {
        let kv = InMemoryKvStore::new();
        let err = kv.get("nope").await.unwrap_err();
        assert!(matches!(err, KvStoreError::MissingKey { .. }));
    }
}
