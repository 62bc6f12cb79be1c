//! Mini-Node CLI Application
//!
//! Runs a sync node over TCP.

use clap::{Parser, Subcommand};
use mini_node::chain::MemoryChain;
use mini_node::network::{PeerId, TcpTransport};
use mini_node::{Node, NodeConfig, NodeEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(name = "mini-node")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Peer networking and fast sync node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the node
    Start {
        /// JSON config file; flags override its values
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Seed nodes as <id>@<host>:<port> (comma-separated)
        #[arg(long)]
        bootnodes: Option<String>,

        /// Peers needed before syncing starts
        #[arg(long)]
        min_peers: Option<usize>,

        /// Pool capacity
        #[arg(long)]
        max_peers: Option<usize>,

        /// Pre-generate the local chain up to this height
        #[arg(long, default_value = "0")]
        height: u64,

        /// Node id as 64 hex chars (random if omitted)
        #[arg(long)]
        id: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            config,
            port,
            bootnodes,
            min_peers,
            max_peers,
            height,
            id,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path)?,
                None => NodeConfig::default(),
            };
            if let Some(port) = port {
                node_config.port = port;
            }
            if let Some(bootnodes) = bootnodes {
                node_config.bootnodes = bootnodes
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            if let Some(min_peers) = min_peers {
                node_config.min_peers = min_peers;
            }
            if let Some(max_peers) = max_peers {
                node_config.max_peers = max_peers;
            }
            let id = match id {
                Some(hex) => PeerId::from_hex(&hex).ok_or("Invalid node id")?,
                None => PeerId::random(),
            };

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(node_config, id, height))?;
        }
    }

    Ok(())
}

async fn run_node(config: NodeConfig, id: PeerId, height: u64) -> Result<(), mini_node::Error> {
    let chain = MemoryChain::with_height(height).with_network_id(config.network_id);
    let node = Node::builder(config)
        .transport(Arc::new(TcpTransport::new(id)))
        .chain(Arc::new(chain))
        .build()?;

    println!("🌐 Starting node {}...", id.to_hex());
    let mut events = node.subscribe();
    node.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\n📴 Shutting down node...");
                break;
            }
            event = events.recv() => match event {
                Ok(NodeEvent::Listening { transport, url }) => {
                    println!("✅ Listening on {} ({})", url, transport);
                }
                Ok(NodeEvent::Synchronized { height }) => {
                    println!("⛓️  Synchronized to height {}", height);
                }
                Ok(NodeEvent::Error(e)) => {
                    log::error!("{}", e);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Missed {} node events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    node.stop().await;
    node.close().await?;
    Ok(())
}
