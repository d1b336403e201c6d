use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use murmur::{Node, NodeConfig};

#[derive(Parser)]
#[command(author, version, about = "Gossip overlay node over UDP")]
struct Cli {
    /// UDP port to listen on.
    #[arg(short, long)]
    port: Option<u16>,

    /// User name this node announces and signs as.
    #[arg(short, long)]
    name: Option<String>,

    /// TOML config file. Flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable multicast peer discovery.
    #[arg(long, default_value_t = false)]
    no_discovery: bool,

    /// Peers to contact at startup.
    #[arg(long = "peer")]
    peers: Vec<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(port) = cli.port {
        config.listen_addr.set_port(port);
    }
    if let Some(name) = cli.name {
        config.name = name;
    }
    if config.key_path.is_none() {
        config.key_path = Some(PathBuf::from(format!("{}.keys.json", config.name)));
    }
    if cli.no_discovery {
        config.discovery.enabled = false;
    }

    let node = Node::bind(config).await.context("failed to start node")?;
    for peer in cli.peers {
        node.add_peer(peer).await?;
    }
    node.announce().await?;

    tokio::signal::ctrl_c().await?;
    info!("interrupted, shutting down");
    node.shutdown().await;
    Ok(())
}
