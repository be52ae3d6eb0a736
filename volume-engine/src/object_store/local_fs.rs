//! Local-filesystem `ObjectStore`. Not part of the core's scope (the real
//! backend clients are external collaborators); provided so the engine can
//! be exercised end-to-end in tests without S3/Alba.

use super::{ObjectStore, ObjectStoreError, WriteCondition};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct LocalFsObjectStore {
    root: PathBuf,
}

impl LocalFsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn ns_path(&self, namespace: &str) -> PathBuf {
        self.root.join(namespace)
    }

    fn obj_path(&self, namespace: &str, name: &str) -> PathBuf {
        self.ns_path(namespace).join(name)
    }
}

#[async_trait]
impl ObjectStore for LocalFsObjectStore {
    async fn list_namespaces(&self) -> Result<Vec<String>, ObjectStoreError> {
        let mut out = vec![];
        let mut rd = match tokio::fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(_) => return Ok(out),
        };
        while let Ok(Some(entry)) = rd.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    async fn create_namespace(
        &self,
        namespace: &str,
    ) -> Result<(), ObjectStoreError> {
        tokio::fs::create_dir_all(self.ns_path(namespace))
            .await
            .map_err(|e| ObjectStoreError::Transient {
                namespace: namespace.to_string(),
                name: String::new(),
                message: e.to_string(),
            })
    }

    async fn delete_namespace(
        &self,
        namespace: &str,
    ) -> Result<(), ObjectStoreError> {
        match tokio::fs::remove_dir_all(self.ns_path(namespace)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ObjectStoreError::Transient {
                namespace: namespace.to_string(),
                name: String::new(),
                message: e.to_string(),
            }),
        }
    }

    async fn list_objects(
        &self,
        namespace: &str,
    ) -> Result<Vec<String>, ObjectStoreError> {
        let mut out = vec![];
        let mut rd = tokio::fs::read_dir(self.ns_path(namespace))
            .await
            .map_err(|_| ObjectStoreError::NamespaceMissing {
                namespace: namespace.to_string(),
            })?;
        while let Ok(Some(entry)) = rd.next_entry().await {
            if let Some(name) = entry.file_name().to_str() {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    async fn read(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        let path = self.obj_path(namespace, name);
        let mut file = tokio::fs::File::open(&path).await.map_err(|_| {
            ObjectStoreError::ObjectMissing {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        })?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.map_err(|e| {
            ObjectStoreError::Transient {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Bytes::from(buf))
    }

    async fn partial_read(
        &self,
        namespace: &str,
        name: &str,
        slices: &[(u64, u64)],
        _insist_on_latest: bool,
    ) -> Result<Vec<Bytes>, ObjectStoreError> {
        let full = self.read(namespace, name).await?;
        Ok(slices
            .iter()
            .map(|(off, len)| {
                let start = (*off as usize).min(full.len());
                let end = (start + *len as usize).min(full.len());
                full.slice(start .. end)
            })
            .collect())
    }

    async fn write(
        &self,
        namespace: &str,
        name: &str,
        data: Bytes,
        condition: WriteCondition,
    ) -> Result<(), ObjectStoreError> {
        let path = self.obj_path(namespace, name);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if matches!(condition, WriteCondition::IfAbsent) && path.exists() {
            return Err(ObjectStoreError::ConditionFailed {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }
        let tmp = path.with_extension("tmp");
        let mut file =
            tokio::fs::File::create(&tmp).await.map_err(|e| {
                ObjectStoreError::Transient {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                    message: e.to_string(),
                }
            })?;
        file.write_all(&data).await.map_err(|e| {
            ObjectStoreError::Transient {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }
        })?;
        file.sync_all().await.ok();
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            ObjectStoreError::Transient {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }
        })
    }

    async fn exists(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<bool, ObjectStoreError> {
        Ok(Path::new(&self.obj_path(namespace, name)).exists())
    }

    async fn size(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<u64, ObjectStoreError> {
        let meta = tokio::fs::metadata(self.obj_path(namespace, name))
            .await
            .map_err(|_| ObjectStoreError::ObjectMissing {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        Ok(meta.len())
    }

    async fn checksum(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<[u8; 16], ObjectStoreError> {
        let bytes = self.read(namespace, name).await?;
        Ok(md5::compute(&bytes).0)
    }

    async fn remove(
        &self,
        namespace: &str,
        name: &str,
        may_not_exist: bool,
    ) -> Result<(), ObjectStoreError> {
        match tokio::fs::remove_file(self.obj_path(namespace, name)).await {
            Ok(()) => Ok(()),
            Err(e)
                if may_not_exist
                    && e.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ObjectStoreError::ObjectMissing {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            }
            Err(e) => Err(ObjectStoreError::Transient {
                namespace: namespace.to_string(),
                name: name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store.create_namespace("ns0").await.unwrap();
        store
            .write(
                "ns0",
                "tlog_1",
                Bytes::from_static(b"hello"),
                WriteCondition::Always,
            )
            .await
            .unwrap();
        let data = store.read("ns0", "tlog_1").await.unwrap();
        assert_eq!(&data[..], b"hello");
    }

    #[tokio::test]
    async fn missing_object_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store.create_namespace("ns0").await.unwrap();
        let err = store.read("ns0", "nope").await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::ObjectMissing { .. }));
    }

    #[tokio::test]
    async fn if_absent_condition_rejects_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsObjectStore::new(dir.path());
        store.create_namespace("ns0").await.unwrap();
        store
            .write("ns0", "cfg", Bytes::from_static(b"a"), WriteCondition::Always)
            .await
            .unwrap();
        let err = store
            .write(
                "ns0",
                "cfg",
                Bytes::from_static(b"b"),
                WriteCondition::IfAbsent,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ObjectStoreError::ConditionFailed { .. }));
    }
}
