//! Mini-Node: peer networking and fast sync for a block chain
//!
//! This crate provides the networking core of a chain node:
//! - Pluggable transports (TCP, in-process) with capability negotiation
//! - Per-protocol sessions with status exchange and range requests
//! - A bounded peer pool with banning of misbehaving peers
//! - Fast sync against the heaviest peer with pipelined block fetching
//!
//! # Example
//!
//! ```rust,no_run
//! use mini_node::chain::MemoryChain;
//! use mini_node::network::{PeerId, TcpTransport};
//! use mini_node::{Node, NodeConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::builder(NodeConfig::default())
//!     .transport(Arc::new(TcpTransport::new(PeerId::random())))
//!     .chain(Arc::new(MemoryChain::new()))
//!     .build()?;
//!
//! node.start().await?;
//! // ... sync runs in the background
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod chain;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod service;
pub mod sync;

// Re-export commonly used types
pub use chain::{Block, BlockHeader, Chain, ChainError, MemoryChain};
pub use config::{ConfigError, NodeConfig};
pub use error::{Error, Result};
pub use network::{Peer, PeerId, PeerPool, Server, ServerEvent};
pub use node::{Node, NodeBuilder, NodeEvent};
pub use service::SyncService;
pub use sync::{BlockFetcher, Synchronizer};
