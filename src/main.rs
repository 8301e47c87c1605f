use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use lfscache::{Server, SigningKey};
use n0_error::{Result, StdResultExt};
use tokio::net::TcpListener;
use tracing::info;

/// Caching reverse proxy for Git LFS object transfers.
#[derive(Parser)]
struct Cli {
    /// HTTP listen address.
    #[clap(long, default_value = "0.0.0.0:8080")]
    http_addr: String,
    /// Upstream LFS server URL.
    #[clap(long)]
    url: String,
    /// Cache directory, created if missing.
    #[clap(long, default_value = "./lfs-cache")]
    directory: PathBuf,
    /// File holding a 64-byte raw signing key. Instances sharing a key
    /// accept each other's rewritten URLs; without one a random per-process
    /// key is generated.
    #[clap(long)]
    key_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let key = match &cli.key_file {
        Some(path) => SigningKey::from_file(path).std_context("failed to load signing key")?,
        None => SigningKey::generate(),
    };

    let server = Arc::new(Server::new(&cli.url, &cli.directory, key)?);
    let listener = TcpListener::bind(&cli.http_addr).await?;
    info!(addr = %listener.local_addr()?, upstream = %cli.url, "listening");

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}
