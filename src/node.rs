//! Node
//!
//! A node is one server plus the sync service running on top of it. It is
//! assembled with a [`NodeBuilder`] and reports what happens through
//! [`NodeEvent`]s.

use crate::chain::{Chain, MemoryChain};
use crate::config::{ConfigError, NodeConfig};
use crate::network::pool::PeerPool;
use crate::network::server::Server;
use crate::network::transport::Transport;
use crate::service::SyncService;
use crate::sync::Synchronizer;
use crate::Error;
use std::sync::Arc;
use tokio::sync::broadcast;

const NODE_EVENT_BUFFER: usize = 256;

/// Things a running node reports
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The transport accepts connections at `url`
    Listening { transport: String, url: String },
    /// A sync round imported blocks up to `height`
    Synchronized { height: u64 },
    Error(Arc<Error>),
}

/// Assembles a [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    transport: Option<Arc<dyn Transport>>,
    chain: Option<Arc<dyn Chain>>,
    rng_seed: Option<u64>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            transport: None,
            chain: None,
            rng_seed: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn chain(mut self, chain: Arc<dyn Chain>) -> Self {
        self.chain = Some(chain);
        self
    }

    /// Seed the pool's idle-peer selection
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<Node, ConfigError> {
        let transport = self.transport.ok_or(ConfigError::MissingTransport)?;
        self.config.validate()?;

        let chain: Arc<dyn Chain> = match self.chain {
            Some(chain) => chain,
            None => Arc::new(MemoryChain::new().with_network_id(self.config.network_id)),
        };
        let server = Server::new(self.config.server_config()?, transport);
        let pool = match self.rng_seed {
            Some(seed) => PeerPool::with_seed(self.config.max_peers, seed),
            None => PeerPool::new(self.config.max_peers),
        };
        let (events, _) = broadcast::channel(NODE_EVENT_BUFFER);
        let service = SyncService::new(
            server.clone(),
            pool,
            chain,
            self.config.sync_config(),
            self.config.timeout(),
            events.clone(),
        );

        Ok(Node {
            config: self.config,
            server,
            service,
            events,
        })
    }
}

/// A networked sync node
pub struct Node {
    config: NodeConfig,
    server: Server,
    service: SyncService,
    events: broadcast::Sender<NodeEvent>,
}

impl Node {
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn pool(&self) -> &PeerPool {
        self.service.pool()
    }

    pub fn chain(&self) -> &Arc<dyn Chain> {
        self.service.chain()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        self.service.synchronizer()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.service.is_running()
    }

    /// Returns false if already open
    pub fn open(&self) -> Result<bool, Error> {
        let opened = self.service.open()?;
        if opened {
            log::info!(
                "Opened node {} on {}",
                self.server.local_id(),
                self.server.transport_name()
            );
        }
        Ok(opened)
    }

    /// Open if needed, then start serving and syncing
    pub async fn start(&self) -> Result<bool, Error> {
        self.open()?;
        self.service.start().await
    }

    /// Returns false if not running
    pub async fn stop(&self) -> bool {
        self.service.stop().await
    }

    pub async fn close(&self) -> Result<bool, Error> {
        self.service.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::memory::{MemoryNetwork, MemoryTransport};
    use crate::network::peer::PeerId;
    use std::time::Duration;

    #[test]
    fn test_missing_transport() {
        let result = Node::builder(NodeConfig::default()).build();
        assert!(matches!(result, Err(ConfigError::MissingTransport)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = NodeConfig {
            max_peers: 0,
            ..NodeConfig::default()
        };
        let transport = MemoryTransport::new(MemoryNetwork::new(), "a", PeerId::from_name("a"));
        let result = Node::builder(config).transport(Arc::new(transport)).build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let transport = MemoryTransport::new(MemoryNetwork::new(), "a", PeerId::from_name("a"));
        let node = Node::builder(NodeConfig::default())
            .transport(Arc::new(transport))
            .build()
            .unwrap();
        let mut events = node.subscribe();

        assert!(node.start().await.unwrap());
        assert!(!node.start().await.unwrap());
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            NodeEvent::Listening { transport, url } => {
                assert_eq!(transport, "memory");
                assert!(url.starts_with("memory://"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(node.chain().blocks().height, 0);

        assert!(node.stop().await);
        assert!(!node.stop().await);
        assert!(node.close().await.unwrap());
        assert!(!node.close().await.unwrap());
    }
}
