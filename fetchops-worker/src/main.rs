use std::sync::Arc;

use clap::Parser;
use fetchops_worker::{AppState, CacheFetcher, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "fetchops-worker")]
struct WorkerArgs {
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind_address: String,
    /// Directory fetched resources are copied into.
    #[arg(long, default_value = "cache")]
    cache_dir: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = WorkerArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(cache_dir = %args.cache_dir, "worker starting on {}", args.bind_address);
    let state = AppState::new(Arc::new(CacheFetcher::new(&args.cache_dir)));
    if let Err(err) = serve(listener, state).await {
        warn!("worker server exited: {}", err);
    }
}
