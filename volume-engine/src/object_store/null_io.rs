//! `fs_nullio` test/perf knob: an `ObjectStore` that discards every write
//! and answers every read with zeroes, so the write path can be exercised
//! without real backend I/O cost. Gated behind `VolumeEngineConfig::null_io`.

use super::{ObjectStore, ObjectStoreError, WriteCondition};
use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, Default, Clone, Copy)]
pub struct NullIoObjectStore;

#[async_trait]
impl ObjectStore for NullIoObjectStore {
    async fn list_namespaces(&self) -> Result<Vec<String>, ObjectStoreError> {
        Ok(vec![])
    }

    async fn create_namespace(
        &self,
        _namespace: &str,
    ) -> Result<(), ObjectStoreError> {
        Ok(())
    }

    async fn delete_namespace(
        &self,
        _namespace: &str,
    ) -> Result<(), ObjectStoreError> {
        Ok(())
    }

    async fn list_objects(
        &self,
        _namespace: &str,
    ) -> Result<Vec<String>, ObjectStoreError> {
        Ok(vec![])
    }

    async fn read(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<Bytes, ObjectStoreError> {
        Ok(Bytes::new())
    }

    async fn partial_read(
        &self,
        _namespace: &str,
        _name: &str,
        slices: &[(u64, u64)],
        _insist_on_latest: bool,
    ) -> Result<Vec<Bytes>, ObjectStoreError> {
        Ok(slices
            .iter()
            .map(|(_, len)| Bytes::from(vec![0u8; *len as usize]))
            .collect())
    }

    async fn write(
        &self,
        _namespace: &str,
        _name: &str,
        _data: Bytes,
        _condition: WriteCondition,
    ) -> Result<(), ObjectStoreError> {
        Ok(())
    }

    async fn exists(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<bool, ObjectStoreError> {
        Ok(true)
    }

    async fn size(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<u64, ObjectStoreError> {
        Ok(0)
    }

    async fn checksum(
        &self,
        _namespace: &str,
        _name: &str,
    ) -> Result<[u8; 16], ObjectStoreError> {
        Ok([0u8; 16])
    }

    async fn remove(
        &self,
        _namespace: &str,
        _name: &str,
        _may_not_exist: bool,
    ) -> Result<(), ObjectStoreError> {
        Ok(())
    }
}
