//! A single SCO cache mountpoint: a directory with a capacity and the
//! trigger/backoff watermarks that drive `SCOCache::cleanup`.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct MountPointConfig {
    pub path: PathBuf,
    pub capacity_bytes: u64,
    /// Cleanup starts once free space drops below this many bytes.
    pub trigger_gap_bytes: u64,
    /// Cleanup runs until free space is back above this many bytes.
    pub backoff_gap_bytes: u64,
}

#[derive(Debug)]
pub struct MountPoint {
    pub(super) cfg: MountPointConfig,
    pub(super) used_bytes: u64,
    pub(super) blacklisted: bool,
}

impl MountPoint {
    pub fn new(cfg: MountPointConfig) -> Self {
        Self {
            cfg,
            used_bytes: 0,
            blacklisted: false,
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.cfg.capacity_bytes.saturating_sub(self.used_bytes)
    }

    pub fn needs_cleanup(&self) -> bool {
        !self.blacklisted && self.free_bytes() < self.cfg.trigger_gap_bytes
    }

    pub fn cleanup_satisfied(&self) -> bool {
        self.free_bytes() >= self.cfg.backoff_gap_bytes
    }

    pub fn path(&self) -> &std::path::Path {
        &self.cfg.path
    }
}
