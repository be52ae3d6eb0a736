//! Standalone FailOverCache server. Exit codes: `0` clean stop, `1`
//! unexpected error, `3` transport error (bind/accept failure).

use clap::Parser;
use volume_engine::foc::FailOverCacheServer;

#[derive(Debug, Parser)]
#[command(name = "failovercache-server", about = "Standalone FailOverCache server")]
struct CliArgs {
    #[arg(long, default_value = "0.0.0.0:10200", env = "FOC_BIND_ADDR")]
    bind_addr: String,
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

    let server = FailOverCacheServer::new();
    tracing::info!(bind_addr = %args.bind_addr, "starting failovercache-server");
    match server.serve(&args.bind_addr).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "failovercache-server transport error");
            std::process::ExitCode::from(3)
        }
    }
}
