use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chunk_drop::config::{ClientConfig, Config, ServerConfig};
use chunk_drop::coordinator::{SessionSettings, TransferCoordinator};
use chunk_drop::http::{serve_http, HttpRegistrar};
use chunk_drop::store::{MemoryStore, SessionStore};
use chunk_drop::{ChunkReceiver, ChunkStore, ClientTransferManager, TransferError};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (TOML format)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the registration endpoint and the chunk receiver
    Server,
    /// Send a file to a server, resuming any earlier partial transfer
    Client {
        /// Path to the file to transfer
        #[arg(short, long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load_or_create(&cli.config)?;

    match cli.command {
        Commands::Server => run_server(config.server).await?,
        Commands::Client { file } => run_client(config.client, file).await?,
    }

    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<(), TransferError> {
    info!(
        "Starting server: registration on {}, chunks on {}, output in {}",
        config.http_bind(),
        config.tcp_bind(),
        config.output_directory
    );

    let chunks = ChunkStore::new(config.output_directory.clone());
    tokio::fs::create_dir_all(chunks.root()).await?;

    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let coordinator = TransferCoordinator::new(store, chunks, SessionSettings::from(&config));

    let http_listener = TcpListener::bind(config.http_bind()).await?;
    let data_listener = TcpListener::bind(config.tcp_bind()).await?;
    let receiver = Arc::new(ChunkReceiver::from_config(coordinator.clone(), &config));

    tokio::select! {
        result = serve_http(http_listener, coordinator) => result?,
        result = receiver.accept_loop(data_listener) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
    }

    Ok(())
}

async fn run_client(config: ClientConfig, file_path: PathBuf) -> Result<(), TransferError> {
    if !file_path.exists() {
        return Err(TransferError::FileNotFound(file_path));
    }

    info!("Starting client transfer of file: {}", file_path.display());

    let registrar = Arc::new(HttpRegistrar::from_config(&config)?);
    let multi_progress = MultiProgress::new();
    let mut client_manager =
        ClientTransferManager::new(file_path, Arc::new(config), registrar, multi_progress).await?;

    let result = client_manager.run_transfer().await;

    if let Some(pb) = client_manager.progress_bar.take() {
        match &result {
            Ok(summary) => pb.finish_with_message(format!(
                "✅ Transfer complete ({:.2} MB/s)",
                summary.throughput_mbps()
            )),
            Err(_) => pb.abandon_with_message("❌ Transfer failed".to_string()),
        }
    }

    let summary = result?;
    info!(
        "Sent {} of {} chunks ({} bytes) in {} round(s), {:.2?}; content hash {}",
        summary.chunks_sent,
        summary.chunk_count,
        summary.bytes_sent,
        summary.rounds,
        summary.elapsed,
        summary.content_hash
    );
    Ok(())
}
