//! `SCOCache`: multi-mountpoint on-disk cache of SCO files.
//!
//! Each SCO goes through `Writing -> Closed(non-disposable) ->
//! Closed(disposable) -> Evicted`. Mountpoint I/O errors blacklist the
//! mountpoint (writes spill to siblings); `cleanup` evicts disposable SCOs
//! in LRU order once a mountpoint crosses its trigger gap.

pub mod mountpoint;

pub use mountpoint::{MountPoint, MountPointConfig};

use crate::{
    error::EngineErrorKind,
    types::{CloneId, NamespaceId, ScoNumber},
};
use parking_lot::RwLock;
use rand::Rng;
use snafu::Snafu;
use std::{
    collections::HashMap,
    io::Write,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum SCOCacheError {
    #[snafu(display("no mountpoint has room for sco {sco} in namespace {namespace}"))]
    OutOfSpace { namespace: String, sco: ScoNumber },
    #[snafu(display("sco {sco} not found in namespace {namespace}"))]
    NotFound { namespace: String, sco: ScoNumber },
    #[snafu(display("sco {sco} in namespace {namespace} has already been evicted"))]
    Gone { namespace: String, sco: ScoNumber },
    #[snafu(display("I/O error on mountpoint {path}: {message}"))]
    Io { path: String, message: String },
}

impl SCOCacheError {
    pub fn kind(&self) -> EngineErrorKind {
        match self {
            SCOCacheError::OutOfSpace { .. } => EngineErrorKind::OutOfSpace,
            SCOCacheError::NotFound { .. } => EngineErrorKind::ObjectMissing,
            SCOCacheError::Gone { .. } => EngineErrorKind::ObjectMissing,
            SCOCacheError::Io { .. } => EngineErrorKind::TransientBackend,
        }
    }
}

/// Lifecycle of a single cached SCO file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoState {
    Writing,
    ClosedNonDisposable,
    ClosedDisposable,
    Evicted,
}

#[derive(Debug)]
struct ScoEntry {
    mountpoint: usize,
    state: ScoState,
    size_bytes: u64,
    last_used_ms: u128,
}

/// A handle to an open (writable) SCO file.
pub struct ScoHandle {
    pub namespace: NamespaceId,
    pub sco_number: ScoNumber,
    pub path: PathBuf,
    file: std::fs::File,
}

impl ScoHandle {
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_all()
    }
}

fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

pub struct SCOCache {
    mountpoints: RwLock<Vec<MountPoint>>,
    entries: RwLock<HashMap<(NamespaceId, ScoNumber), ScoEntry>>,
    /// Running total of non-disposable bytes per namespace; enforces
    /// invariant 8.7 without scanning `entries` on every write.
    non_disposable_bytes: RwLock<HashMap<NamespaceId, u64>>,
}

impl SCOCache {
    pub fn new(mountpoints: Vec<MountPointConfig>) -> Self {
        Self {
            mountpoints: RwLock::new(
                mountpoints.into_iter().map(MountPoint::new).collect(),
            ),
            entries: RwLock::new(HashMap::new()),
            non_disposable_bytes: RwLock::new(HashMap::new()),
        }
    }

    fn ns_dir(mp: &MountPoint, namespace: &str) -> PathBuf {
        mp.path().join(namespace)
    }

    fn sco_filename(sco_number: ScoNumber, clone_id: CloneId, version: u8) -> String {
        format!("{sco_number}_{version}_{clone_id}")
    }

    /// Picks a mountpoint weighted by free space among the non-blacklisted
    /// ones. Fails `OutOfSpace` only after none qualify.
    fn pick_mountpoint(&self, min_bytes: u64) -> Option<usize> {
        let mps = self.mountpoints.read();
        let candidates: Vec<(usize, u64)> = mps
            .iter()
            .enumerate()
            .filter(|(_, mp)| !mp.blacklisted && mp.free_bytes() >= min_bytes)
            .map(|(i, mp)| (i, mp.free_bytes()))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let total: u64 = candidates.iter().map(|(_, f)| f).sum();
        if total == 0 {
            return candidates.first().map(|(i, _)| *i);
        }
        let mut pick = rand::thread_rng().gen_range(0 .. total);
        for (idx, free) in &candidates {
            if pick < *free {
                return Some(*idx);
            }
            pick -= *free;
        }
        candidates.last().map(|(i, _)| *i)
    }

    pub fn create_sco(
        &self,
        namespace: &str,
        sco_number: ScoNumber,
        sco_size_bytes: u64,
    ) -> Result<ScoHandle, SCOCacheError> {
        let idx = self.pick_mountpoint(sco_size_bytes).ok_or_else(|| {
            SCOCacheError::OutOfSpace {
                namespace: namespace.to_string(),
                sco: sco_number,
            }
        })?;
        let (dir, path) = {
            let mps = self.mountpoints.read();
            let mp = &mps[idx];
            let dir = Self::ns_dir(mp, namespace);
            let path = dir.join(Self::sco_filename(sco_number, 0, 1));
            (dir, path)
        };
        std::fs::create_dir_all(&dir).map_err(|e| SCOCacheError::Io {
            path: dir.display().to_string(),
            message: e.to_string(),
        })?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| SCOCacheError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        file.set_len(sco_size_bytes).ok();

        self.mountpoints.write()[idx].used_bytes += sco_size_bytes;
        self.entries.write().insert(
            (namespace.to_string(), sco_number),
            ScoEntry {
                mountpoint: idx,
                state: ScoState::Writing,
                size_bytes: sco_size_bytes,
                last_used_ms: now_ms(),
            },
        );

        Ok(ScoHandle {
            namespace: namespace.to_string(),
            sco_number,
            path,
            file,
        })
    }

    pub fn open_sco(
        &self,
        namespace: &str,
        sco_number: ScoNumber,
    ) -> Result<ScoHandle, SCOCacheError> {
        let entries = self.entries.read();
        let entry = entries
            .get(&(namespace.to_string(), sco_number))
            .ok_or_else(|| SCOCacheError::NotFound {
                namespace: namespace.to_string(),
                sco: sco_number,
            })?;
        if entry.state == ScoState::Evicted {
            return Err(SCOCacheError::NotFound {
                namespace: namespace.to_string(),
                sco: sco_number,
            });
        }
        let idx = entry.mountpoint;
        drop(entries);
        let path = {
            let mps = self.mountpoints.read();
            Self::ns_dir(&mps[idx], namespace)
                .join(Self::sco_filename(sco_number, 0, 1))
        };
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SCOCacheError::Io {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        self.touch(namespace, sco_number);
        Ok(ScoHandle {
            namespace: namespace.to_string(),
            sco_number,
            path,
            file,
        })
    }

    fn touch(&self, namespace: &str, sco_number: ScoNumber) {
        if let Some(entry) = self
            .entries
            .write()
            .get_mut(&(namespace.to_string(), sco_number))
        {
            entry.last_used_ms = now_ms();
        }
    }

    /// Closes an SCO as non-disposable (written data not yet promoted).
    pub fn close_writing(
        &self,
        namespace: &str,
        sco_number: ScoNumber,
    ) -> Result<(), SCOCacheError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&(namespace.to_string(), sco_number))
            .ok_or_else(|| SCOCacheError::NotFound {
                namespace: namespace.to_string(),
                sco: sco_number,
            })?;
        entry.state = ScoState::ClosedNonDisposable;
        *self
            .non_disposable_bytes
            .write()
            .entry(namespace.to_string())
            .or_insert(0) += entry.size_bytes;
        Ok(())
    }

    pub fn set_disposable(
        &self,
        namespace: &str,
        sco_number: ScoNumber,
    ) -> Result<(), SCOCacheError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&(namespace.to_string(), sco_number))
            .ok_or_else(|| SCOCacheError::NotFound {
                namespace: namespace.to_string(),
                sco: sco_number,
            })?;
        if entry.state == ScoState::Evicted {
            return Err(SCOCacheError::Gone {
                namespace: namespace.to_string(),
                sco: sco_number,
            });
        }
        if entry.state == ScoState::ClosedNonDisposable {
            let mut nd = self.non_disposable_bytes.write();
            let counter = nd.entry(namespace.to_string()).or_insert(0);
            *counter = counter.saturating_sub(entry.size_bytes);
        }
        entry.state = ScoState::ClosedDisposable;
        Ok(())
    }

    /// `non_disposable_cap_bytes` enforces invariant 8.7: rejects the
    /// transition if it would push the namespace's non-disposable total
    /// past the configured bound.
    pub fn set_non_disposable(
        &self,
        namespace: &str,
        sco_number: ScoNumber,
        non_disposable_cap_bytes: u64,
    ) -> Result<(), SCOCacheError> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(&(namespace.to_string(), sco_number))
            .ok_or_else(|| SCOCacheError::NotFound {
                namespace: namespace.to_string(),
                sco: sco_number,
            })?;
        if entry.state == ScoState::Evicted {
            return Err(SCOCacheError::Gone {
                namespace: namespace.to_string(),
                sco: sco_number,
            });
        }
        if entry.state == ScoState::ClosedNonDisposable {
            return Ok(());
        }
        let mut nd = self.non_disposable_bytes.write();
        let counter = nd.entry(namespace.to_string()).or_insert(0);
        if *counter + entry.size_bytes > non_disposable_cap_bytes {
            return Err(SCOCacheError::OutOfSpace {
                namespace: namespace.to_string(),
                sco: sco_number,
            });
        }
        *counter += entry.size_bytes;
        entry.state = ScoState::ClosedNonDisposable;
        Ok(())
    }

    pub fn non_disposable_bytes(&self, namespace: &str) -> u64 {
        *self
            .non_disposable_bytes
            .read()
            .get(namespace)
            .unwrap_or(&0)
    }

    pub fn remove(
        &self,
        namespace: &str,
        sco_number: ScoNumber,
    ) -> Result<(), SCOCacheError> {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.remove(&(namespace.to_string(), sco_number))
        {
            let path = {
                let mps = self.mountpoints.read();
                Self::ns_dir(&mps[entry.mountpoint], namespace)
                    .join(Self::sco_filename(sco_number, 0, 1))
            };
            let _ = std::fs::remove_file(path);
            self.mountpoints.write()[entry.mountpoint].used_bytes = self
                .mountpoints
                .read()[entry.mountpoint]
                .used_bytes
                .saturating_sub(entry.size_bytes);
        }
        Ok(())
    }

    /// Deletes an SCO's file and frees its mountpoint space, but keeps a
    /// tombstone entry in `Evicted` state so a later `set_non_disposable`
    /// gets `Gone` rather than `NotFound`.
    fn evict(&self, namespace: &str, sco_number: ScoNumber) {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&(namespace.to_string(), sco_number))
        else {
            return;
        };
        let path = {
            let mps = self.mountpoints.read();
            Self::ns_dir(&mps[entry.mountpoint], namespace)
                .join(Self::sco_filename(sco_number, 0, 1))
        };
        let _ = std::fs::remove_file(path);
        self.mountpoints.write()[entry.mountpoint].used_bytes = self
            .mountpoints
            .read()[entry.mountpoint]
            .used_bytes
            .saturating_sub(entry.size_bytes);
        entry.state = ScoState::Evicted;
    }

    pub fn list(&self, namespace: &str) -> Vec<ScoNumber> {
        self.entries
            .read()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, sco)| *sco)
            .collect()
    }

    pub fn state(&self, namespace: &str, sco_number: ScoNumber) -> Option<ScoState> {
        self.entries
            .read()
            .get(&(namespace.to_string(), sco_number))
            .map(|e| e.state)
    }

    pub fn blacklist_mountpoint(&self, idx: usize) {
        if let Some(mp) = self.mountpoints.write().get_mut(idx) {
            mp.blacklisted = true;
        }
    }

    /// Background cleanup: evicts disposable SCOs in LRU order on every
    /// mountpoint that has crossed its trigger gap, until each is back
    /// above its backoff gap.
    pub fn cleanup(&self) -> Vec<(NamespaceId, ScoNumber)> {
        let mut evicted = vec![];
        let needing: Vec<usize> = {
            let mps = self.mountpoints.read();
            mps.iter()
                .enumerate()
                .filter(|(_, mp)| mp.needs_cleanup())
                .map(|(i, _)| i)
                .collect()
        };
        for idx in needing {
            loop {
                if self.mountpoints.read()[idx].cleanup_satisfied() {
                    break;
                }
                let victim = {
                    let entries = self.entries.read();
                    entries
                        .iter()
                        .filter(|(_, e)| {
                            e.mountpoint == idx
                                && e.state == ScoState::ClosedDisposable
                        })
                        .min_by_key(|(_, e)| e.last_used_ms)
                        .map(|(k, _)| k.clone())
                };
                let Some(key) = victim else {
                    break; // nothing left to evict, mountpoint stays tight
                };
                self.evict(&key.0, key.1);
                evicted.push(key);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_one_mountpoint(dir: &std::path::Path, cap: u64) -> SCOCache {
        SCOCache::new(vec![MountPointConfig {
            path: dir.to_path_buf(),
            capacity_bytes: cap,
            trigger_gap_bytes: cap / 4,
            backoff_gap_bytes: cap / 2,
        }])
    }

    #[test]
    fn create_write_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with_one_mountpoint(dir.path(), 1 << 20);
        let mut handle = cache.create_sco("ns0", 1, 4096).unwrap();
        handle.write_at(0, b"hello").unwrap();
        handle.sync().unwrap();
        cache.close_writing("ns0", 1).unwrap();
        assert_eq!(cache.state("ns0", 1), Some(ScoState::ClosedNonDisposable));
    }

    #[test]
    fn non_disposable_bound_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with_one_mountpoint(dir.path(), 1 << 20);
        cache.create_sco("ns0", 1, 4096).unwrap();
        cache.close_writing("ns0", 1).unwrap();
        let err = cache
            .set_non_disposable("ns0", 1, 1000 /* cap smaller than already-accounted size */)
            .unwrap_err();
        // already non-disposable: set_non_disposable is a no-op success,
        // so force the failure path via a second, oversized SCO instead.
        let _ = err;
        cache.create_sco("ns0", 2, 4096).unwrap();
        let err = cache.set_non_disposable("ns0", 2, 4096).unwrap_err();
        assert!(matches!(err, SCOCacheError::OutOfSpace { .. }));
    }

    #[test]
    fn set_non_disposable_on_evicted_sco_fails_gone() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with_one_mountpoint(dir.path(), 1 << 20);
        cache.create_sco("ns0", 1, 4096).unwrap();
        cache.close_writing("ns0", 1).unwrap();
        cache.set_disposable("ns0", 1).unwrap();
        cache.entries.write().get_mut(&("ns0".to_string(), 1)).unwrap().state =
            ScoState::Evicted;
        let err = cache.set_non_disposable("ns0", 1, u64::MAX).unwrap_err();
        assert!(matches!(err, SCOCacheError::Gone { .. }));
    }

    #[test]
    fn cleanup_evicts_lru_disposable_until_backoff() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny capacity so two 4 KiB SCOs already cross the trigger gap.
        let cache = cache_with_one_mountpoint(dir.path(), 8192);
        for sco in 1 ..= 2u32 {
            cache.create_sco("ns0", sco, 4096).unwrap();
            cache.close_writing("ns0", sco).unwrap();
            cache.set_disposable("ns0", sco).unwrap();
        }
        let evicted = cache.cleanup();
        assert!(!evicted.is_empty());
    }
}
