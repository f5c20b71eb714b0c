//! Basalt storage node daemon.

use basalt::config::BasaltConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "basaltd", about = "Basalt extent store node", version)]
struct Args {
    /// Path to a JSON configuration file; defaults to the built-in
    /// development configuration.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the node ID.
    #[arg(long)]
    node_id: Option<u64>,

    /// Override the listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the data directories (repeatable).
    #[arg(long = "data-dir")]
    data_dirs: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> basalt::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BasaltConfig::from_file(path)?,
        None => BasaltConfig::development(),
    };
    if let Some(node_id) = args.node_id {
        config.node.id = node_id;
    }
    if let Some(listen) = args.listen {
        config.node.listen_addr = listen;
    }
    if !args.data_dirs.is_empty() {
        config.node.data_dirs = args.data_dirs;
    }
    config.validate()?;

    basalt::run(config).await
}
