//! `VolumeEngineConfig`: the CLI/config surface keys from §6, gathered
//! into one builder-constructed struct the way the teacher's
//! `PersistentStoreBuilder` gathers its own connection settings.

use crate::types::{DEFAULT_CLUSTERS_PER_SCO, DEFAULT_CLUSTER_SIZE, DEFAULT_SCOS_PER_TLOG};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaDataBackendKind {
    InProcess,
    Arakoon,
    Mds,
}

#[derive(Debug, Clone)]
pub struct VolumeEngineConfig {
    pub cluster_size: u32,
    pub clusters_per_sco: u32,
    pub scos_per_tlog: u32,
    pub open_scos_per_volume: u32,
    pub non_disposable_cap_bytes: u64,

    pub metadata_backend: MetaDataBackendKind,
    pub max_tlogs_behind: u32,

    pub foc_enabled: bool,
    pub foc_synchronous: bool,
    pub foc_queue_depth: usize,
    pub ignore_foc_if_unreachable: bool,

    pub promoter_worker_count: usize,
    pub promoter_queue_depth: usize,
    pub retries_on_error: u32,
    pub retry_interval: Duration,
    pub retry_backoff_multiplier: f64,
    pub non_disposable_scos_factor: u32,

    pub blacklist_secs: u64,
    pub max_conns_per_endpoint: usize,
    pub acquire_timeout: Duration,

    pub degraded_error_threshold: usize,
    pub degraded_window: Duration,

    pub heartbeat_lease: Duration,
}

impl Default for VolumeEngineConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl VolumeEngineConfig {
    pub fn builder() -> VolumeEngineConfigBuilder {
        VolumeEngineConfigBuilder::new()
    }
}

/// Builder with the teacher's construction style: every field has a
/// sensible default, `with_*` setters mutate in place and return `Self`.
pub struct VolumeEngineConfigBuilder {
    cluster_size: u32,
    clusters_per_sco: u32,
    scos_per_tlog: u32,
    open_scos_per_volume: u32,
    non_disposable_cap_bytes: u64,
    metadata_backend: MetaDataBackendKind,
    max_tlogs_behind: u32,
    foc_enabled: bool,
    foc_synchronous: bool,
    foc_queue_depth: usize,
    ignore_foc_if_unreachable: bool,
    promoter_worker_count: usize,
    promoter_queue_depth: usize,
    retries_on_error: u32,
    retry_interval: Duration,
    retry_backoff_multiplier: f64,
    non_disposable_scos_factor: u32,
    blacklist_secs: u64,
    max_conns_per_endpoint: usize,
    acquire_timeout: Duration,
    degraded_error_threshold: usize,
    degraded_window: Duration,
    heartbeat_lease: Duration,
}

impl Default for VolumeEngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VolumeEngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            cluster_size: DEFAULT_CLUSTER_SIZE,
            clusters_per_sco: DEFAULT_CLUSTERS_PER_SCO,
            scos_per_tlog: DEFAULT_SCOS_PER_TLOG,
            open_scos_per_volume: 4,
            non_disposable_cap_bytes: 1 << 30,
            metadata_backend: MetaDataBackendKind::InProcess,
            max_tlogs_behind: 5,
            foc_enabled: true,
            foc_synchronous: true,
            foc_queue_depth: 1024,
            ignore_foc_if_unreachable: false,
            promoter_worker_count: 4,
            promoter_queue_depth: 256,
            retries_on_error: 5,
            retry_interval: Duration::from_millis(200),
            retry_backoff_multiplier: 2.0,
            non_disposable_scos_factor: 3,
            blacklist_secs: 300,
            max_conns_per_endpoint: 10,
            acquire_timeout: Duration::from_secs(5),
            degraded_error_threshold: 3,
            degraded_window: Duration::from_secs(30),
            heartbeat_lease: Duration::from_secs(30),
        }
    }

    pub fn with_cluster_size(mut self, v: u32) -> Self {
        self.cluster_size = v;
        self
    }

    pub fn with_clusters_per_sco(mut self, v: u32) -> Self {
        self.clusters_per_sco = v;
        self
    }

    pub fn with_scos_per_tlog(mut self, v: u32) -> Self {
        self.scos_per_tlog = v;
        self
    }

    pub fn with_open_scos_per_volume(mut self, v: u32) -> Self {
        self.open_scos_per_volume = v;
        self
    }

    pub fn with_non_disposable_cap_bytes(mut self, v: u64) -> Self {
        self.non_disposable_cap_bytes = v;
        self
    }

    pub fn with_metadata_backend(mut self, v: MetaDataBackendKind) -> Self {
        self.metadata_backend = v;
        self
    }

    pub fn with_foc_enabled(mut self, v: bool) -> Self {
        self.foc_enabled = v;
        self
    }

    pub fn with_foc_synchronous(mut self, v: bool) -> Self {
        self.foc_synchronous = v;
        self
    }

    pub fn with_ignore_foc_if_unreachable(mut self, v: bool) -> Self {
        self.ignore_foc_if_unreachable = v;
        self
    }

    pub fn with_promoter_worker_count(mut self, v: usize) -> Self {
        self.promoter_worker_count = v;
        self
    }

    pub fn with_retries_on_error(mut self, v: u32) -> Self {
        self.retries_on_error = v;
        self
    }

    pub fn build(self) -> VolumeEngineConfig {
        VolumeEngineConfig {
            cluster_size: self.cluster_size,
            clusters_per_sco: self.clusters_per_sco,
            scos_per_tlog: self.scos_per_tlog,
            open_scos_per_volume: self.open_scos_per_volume,
            non_disposable_cap_bytes: self.non_disposable_cap_bytes,
            metadata_backend: self.metadata_backend,
            max_tlogs_behind: self.max_tlogs_behind,
            foc_enabled: self.foc_enabled,
            foc_synchronous: self.foc_synchronous,
            foc_queue_depth: self.foc_queue_depth,
            ignore_foc_if_unreachable: self.ignore_foc_if_unreachable,
            promoter_worker_count: self.promoter_worker_count,
            promoter_queue_depth: self.promoter_queue_depth,
            retries_on_error: self.retries_on_error,
            retry_interval: self.retry_interval,
            retry_backoff_multiplier: self.retry_backoff_multiplier,
            non_disposable_scos_factor: self.non_disposable_scos_factor,
            blacklist_secs: self.blacklist_secs,
            max_conns_per_endpoint: self.max_conns_per_endpoint,
            acquire_timeout: self.acquire_timeout,
            degraded_error_threshold: self.degraded_error_threshold,
            degraded_window: self.degraded_window,
            heartbeat_lease: self.heartbeat_lease,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let cfg = VolumeEngineConfig::builder()
            .with_cluster_size(8192)
            .with_promoter_worker_count(8)
            .build();
        assert_eq!(cfg.cluster_size, 8192);
        assert_eq!(cfg.promoter_worker_count, 8);
        assert_eq!(cfg.scos_per_tlog, DEFAULT_SCOS_PER_TLOG);
    }
}
