//! Volume engine node binary: opens a single volume against a configured
//! `ObjectStore`/`KvStore` backend and serves it until signalled to stop.

use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use volume_engine::{
    config::VolumeEngineConfig,
    kv_store::memory::InMemoryKvStore,
    object_store::local_fs::LocalFsObjectStore,
    sco_cache::{MountPointConfig, SCOCache},
    VolumeEngine,
};

#[derive(Debug, Parser)]
#[command(name = "volume-engine", about = "Per-volume write-path engine")]
struct CliArgs {
    /// Namespace this node is responsible for.
    #[arg(long, env = "VE_NAMESPACE")]
    namespace: String,

    /// Local path TLogs are written under.
    #[arg(long, env = "VE_TLOG_PATH")]
    tlog_path: PathBuf,

    /// Local SCO cache mount point.
    #[arg(long, env = "VE_SCOCACHE_MOUNT_POINT")]
    scocache_mount_point: PathBuf,

    /// Local filesystem root standing in for the backend ObjectStore.
    #[arg(long, env = "VE_BACKEND_PATH")]
    backend_path: PathBuf,

    /// Optional FailOverCache server address (host:port).
    #[arg(long, env = "VE_FOC_ADDR")]
    foc_addr: Option<String>,

    #[arg(long, default_value_t = 4096)]
    default_cluster_size: u32,

    #[arg(long, default_value_t = 4)]
    open_scos_per_volume: u32,

    /// Nominal volume size in bytes.
    #[arg(long, default_value_t = 1 << 40)]
    size: u64,
}

fn init_tracing() {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter("info").init();
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();
    let args = CliArgs::parse();

    let object_store = Arc::new(LocalFsObjectStore::new(args.backend_path));
    let kv_store = Arc::new(InMemoryKvStore::new());
    let sco_cache = Arc::new(SCOCache::new(vec![MountPointConfig {
        path: args.scocache_mount_point,
        capacity_bytes: 1 << 34,
        trigger_gap_bytes: 1 << 30,
        backoff_gap_bytes: 1 << 31,
    }]));

    let cfg = VolumeEngineConfig::builder()
        .with_cluster_size(args.default_cluster_size)
        .with_open_scos_per_volume(args.open_scos_per_volume)
        .build();

    if object_store.list_namespaces().await.map(|ns| !ns.contains(&args.namespace)).unwrap_or(true) {
        if let Err(e) = VolumeEngine::create(
            uuid::Uuid::new_v4(),
            args.namespace.clone(),
            args.size,
            cfg.clone(),
            object_store.clone(),
            kv_store.clone(),
            None,
        )
        .await
        {
            tracing::error!(error = %e, "failed to create volume");
            return std::process::ExitCode::from(1);
        }
    }

    let engine = match VolumeEngine::open(
        args.namespace,
        args.tlog_path,
        cfg,
        object_store,
        kv_store,
        sco_cache,
        args.foc_addr,
    )
    .await
    {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "failed to open volume");
            return std::process::ExitCode::from(1);
        }
    };

    tracing::info!(owner_tag = %engine.owner_tag(), "volume engine ready");
    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutting down");
    std::process::ExitCode::SUCCESS
}
