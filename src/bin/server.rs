//! EmberKV server binary.

use clap::Parser;
use emberkv::{Config, Engine, Server};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "emberkv-server", about = "EmberKV key-value store server")]
struct Args {
    /// TCP port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory for data storage
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Max MemStore size in bytes before rotation
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    memstore_size: usize,

    /// Compaction interval in seconds
    #[arg(long, default_value_t = 300)]
    compaction_interval_secs: u64,

    /// WAL sync interval in milliseconds
    #[arg(long, default_value_t = 100)]
    wal_sync_interval_ms: u64,
}

#[tokio::main]
async fn main() -> emberkv::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    tracing::info!(
        port = args.port,
        data_dir = %args.data_dir.display(),
        memstore_size = args.memstore_size,
        "starting emberkv"
    );

    let config = Config::new(args.data_dir)
        .memstore_max_size(args.memstore_size)
        .compaction_interval(Duration::from_secs(args.compaction_interval_secs))
        .wal_sync_interval(Duration::from_millis(args.wal_sync_interval_ms));

    let engine = Engine::open(config)?;
    let server = Server::bind(("0.0.0.0", args.port), engine.clone()).await?;
    let shutdown = server.shutdown_handle();
    let server_task = tokio::spawn(server.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    let _ = shutdown.send(());
    server_task.await??;
    engine.close().await?;

    tracing::info!("shutdown complete");
    Ok(())
}
