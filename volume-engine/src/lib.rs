//! Per-volume write path: cluster/SCO/TLog layout, metadata store,
//! failover-cache replication, backend promotion, snapshotting/cloning,
//! restart/recovery and scrub application.

pub mod backend_promoter;
pub mod config;
pub mod connection_pool;
pub mod data_store;
pub mod error;
pub mod foc;
pub mod health;
pub mod kv_store;
pub mod lock;
pub mod metadata_store;
pub mod object_store;
pub mod restart;
pub mod sco_cache;
pub mod snapshot;
pub mod tlog;
pub mod types;
pub mod volume_engine;

pub use error::{EngineError, EngineErrorKind, EngineResult};
pub use volume_engine::{EngineState, VolumeConfig, VolumeEngine};
