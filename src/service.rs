//! Sync service
//!
//! Glues the server, the peer pool, the chain and the synchronizer together:
//! server events feed the pool, pool messages are answered from the chain,
//! and the synchronizer runs while the service is started.

use crate::chain::{Chain, ChainError};
use crate::network::message::{SyncMessage, MAX_HEADERS_PER_REQUEST};
use crate::network::peer::{Peer, PeerId};
use crate::network::pool::{PeerPool, PoolEvent, PoolMessage};
use crate::network::protocol::{ProtocolError, SyncProtocol};
use crate::network::server::{Server, ServerEvent};
use crate::node::NodeEvent;
use crate::sync::{SyncConfig, Synchronizer};
use crate::Error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Requests a single peer may have waiting before it counts as misbehaving
const PEER_REQUEST_QUEUE: usize = 64;

#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    server: Server,
    pool: PeerPool,
    chain: Arc<dyn Chain>,
    synchronizer: Synchronizer,
    events: broadcast::Sender<NodeEvent>,
    timeout: Duration,
    opened: AtomicBool,
    running: AtomicBool,
    closed: Mutex<CancellationToken>,
}

struct Worker {
    peer: Arc<Peer>,
    requests: mpsc::Sender<SyncMessage>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SyncService {
    pub fn new(
        server: Server,
        pool: PeerPool,
        chain: Arc<dyn Chain>,
        config: SyncConfig,
        timeout: Duration,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        let synchronizer = Synchronizer::new(pool.clone(), chain.clone(), config, events.clone());
        Self {
            inner: Arc::new(ServiceInner {
                server,
                pool,
                chain,
                synchronizer,
                events,
                timeout,
                opened: AtomicBool::new(false),
                running: AtomicBool::new(false),
                closed: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        "sync"
    }

    pub fn pool(&self) -> &PeerPool {
        &self.inner.pool
    }

    pub fn chain(&self) -> &Arc<dyn Chain> {
        &self.inner.chain
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.inner.synchronizer
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Register the sync protocol, open pool and chain, and start routing
    /// server events. Returns false if already open.
    pub fn open(&self) -> Result<bool, Error> {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let protocol = SyncProtocol::new(self.inner.chain.clone(), self.inner.timeout);
        self.inner.server.add_protocols(vec![Arc::new(protocol)])?;
        self.inner.pool.open();
        self.inner.synchronizer.open()?;

        let closed = CancellationToken::new();
        *lock(&self.inner.closed) = closed.clone();

        match self.inner.server.take_events() {
            Some(events) => {
                tokio::spawn(self.clone().dispatch(events, closed.clone()));
            }
            None => log::warn!("Server events already taken, pool will not be fed"),
        }
        match self.inner.pool.take_messages() {
            Some(messages) => {
                tokio::spawn(self.clone().serve(messages, closed));
            }
            None => log::warn!("Pool messages already taken, requests will not be served"),
        }
        Ok(true)
    }

    /// Start the server and the sync loop. Returns false if already running.
    pub async fn start(&self) -> Result<bool, Error> {
        if !self.inner.opened.load(Ordering::SeqCst) {
            self.open()?;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(e) = self.inner.server.start().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        self.inner.synchronizer.start();
        log::info!("Started {} service", self.name());
        Ok(true)
    }

    /// Stop the sync loop and the server. Returns false if not running.
    pub async fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.inner.synchronizer.stop().await;
        self.inner.server.stop().await;
        log::info!("Stopped {} service", self.name());
        true
    }

    /// Stop, then release pool and chain. Returns false if not open.
    pub async fn close(&self) -> Result<bool, Error> {
        self.stop().await;
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        lock(&self.inner.closed).cancel();
        self.inner.pool.close();
        self.inner.chain.close()?;
        Ok(true)
    }

    async fn dispatch(self, mut events: mpsc::Receiver<ServerEvent>, closed: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = closed.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ServerEvent::Connected(peer) => {
                    self.inner.pool.connected(peer);
                }
                ServerEvent::Disconnected { peer, reason } => {
                    log::debug!("Peer {} disconnected: {}", peer.id(), reason);
                    self.inner.pool.disconnected(&peer);
                }
                ServerEvent::PeerError { peer, error } => {
                    self.inner.pool.peer_error(&peer, error);
                }
                ServerEvent::Listening { transport, url } => {
                    let _ = self
                        .inner
                        .events
                        .send(NodeEvent::Listening { transport, url });
                }
                ServerEvent::Error(e) => {
                    log::warn!("Server error: {}", e);
                    let _ = self.inner.events.send(NodeEvent::Error(Arc::new(e.into())));
                }
            }
        }
    }

    /// Hand each member's requests to a worker of its own so a peer that
    /// stops reading only stalls itself.
    async fn serve(self, mut messages: mpsc::Receiver<PoolMessage>, closed: CancellationToken) {
        let mut pool_events = self.inner.pool.subscribe();
        let mut workers: HashMap<PeerId, Worker> = HashMap::new();
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                event = pool_events.recv() => match event {
                    Ok(PoolEvent::Removed(peer)) => {
                        if workers.get(&peer.id()).is_some_and(|w| Arc::ptr_eq(&w.peer, &peer)) {
                            workers.remove(&peer.id());
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let pool = &self.inner.pool;
                        workers.retain(|id, _| pool.contains(id));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                message = messages.recv() => match message {
                    Some(message) => self.queue(&mut workers, message),
                    None => break,
                },
            }
        }
    }

    fn queue(&self, workers: &mut HashMap<PeerId, Worker>, message: PoolMessage) {
        let PoolMessage { peer, message, .. } = message;
        let id = peer.id();
        let stale = workers
            .get(&id)
            .map_or(true, |w| !Arc::ptr_eq(&w.peer, &peer) || w.requests.is_closed());
        if stale {
            let (requests, requests_rx) = mpsc::channel(PEER_REQUEST_QUEUE);
            tokio::spawn(self.clone().work(peer.clone(), requests_rx));
            workers.insert(
                id,
                Worker {
                    peer: peer.clone(),
                    requests,
                },
            );
        }

        let Some(worker) = workers.get(&id) else {
            return;
        };
        if let Err(e) = worker.requests.try_send(message) {
            workers.remove(&id);
            if let mpsc::error::TrySendError::Full(_) = e {
                self.inner.pool.peer_error(&peer, "too many pending requests");
            }
        }
    }

    async fn work(self, peer: Arc<Peer>, mut requests: mpsc::Receiver<SyncMessage>) {
        while let Some(message) = requests.recv().await {
            match tokio::time::timeout(self.inner.timeout, self.handle(&peer, message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log::warn!("Failed to handle message from {}: {}", peer.id(), e),
                Err(_) => {
                    self.inner.pool.peer_error(&peer, "response not accepted in time");
                    break;
                }
            }
        }
    }

    /// Answer one request from a pool member
    async fn handle(&self, peer: &Arc<Peer>, message: SyncMessage) -> Result<(), ProtocolError> {
        let Some(session) = peer.sync() else {
            return Ok(());
        };

        match message {
            SyncMessage::GetBlockHeaders {
                id,
                block,
                max,
                skip,
                reverse,
            } => {
                let max = max.min(MAX_HEADERS_PER_REQUEST) as usize;
                let headers = match self.inner.chain.get_headers(&block, max, skip, reverse) {
                    Err(ChainError::NotFound(_)) => Vec::new(),
                    other => other?,
                };
                session
                    .send(&SyncMessage::BlockHeaders { id, headers })
                    .await
            }
            SyncMessage::GetBlocks {
                id,
                block,
                max,
                skip,
                reverse,
            } => {
                let max = max.min(MAX_HEADERS_PER_REQUEST) as usize;
                let blocks = match self.inner.chain.get_blocks(&block, max, skip, reverse) {
                    Err(ChainError::NotFound(_)) => Vec::new(),
                    other => other?,
                };
                session.send(&SyncMessage::Blocks { id, blocks }).await
            }
            SyncMessage::NewBlockHashes(announcements) => {
                self.inner.synchronizer.announced(&announcements, peer);
                Ok(())
            }
            other => {
                log::debug!("Unexpected {} from {}", other.type_name(), peer.id());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{BlockRef, MemoryChain};
    use crate::network::memory::{MemoryNetwork, MemoryTransport};
    use crate::network::protocol::{Capability, Protocol, SYNC_PROTOCOL};
    use crate::network::server::ServerConfig;
    use crate::network::test_utils::sync_peer;
    use crate::network::transport::TransportSession;

    const TIMEOUT: Duration = Duration::from_millis(300);

    fn service(chain: Arc<MemoryChain>) -> SyncService {
        let transport = MemoryTransport::new(MemoryNetwork::new(), "svc", PeerId::from_name("svc"));
        let server = Server::new(ServerConfig::default(), Arc::new(transport));
        let (events, _) = broadcast::channel(16);
        SyncService::new(
            server,
            PeerPool::with_seed(25, 1),
            chain,
            SyncConfig::default(),
            TIMEOUT,
            events,
        )
    }

    /// A member whose remote end sends requests but never reads answers
    async fn unread_peer(name: &str) -> (Arc<Peer>, TransportSession) {
        let id = PeerId::from_name(name);
        let (local, remote) = TransportSession::pair(Capability::new(SYNC_PROTOCOL, 1));
        let status = SyncProtocol::new(Arc::new(MemoryChain::new()), TIMEOUT).status();
        remote
            .sender
            .send(SyncMessage::Status(status).to_bytes().unwrap())
            .await
            .unwrap();

        let (events, events_rx) = mpsc::channel(64);
        let protocol = SyncProtocol::new(Arc::new(MemoryChain::new()), TIMEOUT);
        let session = protocol.bind(id, local, events).await.unwrap();
        let peer = Peer::new(id, name, 30303, "memory")
            .with_session(session)
            .with_events(events_rx);
        (Arc::new(peer), remote)
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_starve_others() {
        let service = service(Arc::new(MemoryChain::with_height(10)));
        assert!(service.open().unwrap());

        let (slow, remote) = unread_peer("slow").await;
        assert!(service.pool().connected(slow));
        let TransportSession {
            sender,
            receiver: _unread,
            ..
        } = remote;
        tokio::spawn(async move {
            for id in 0..400 {
                let request = SyncMessage::GetBlocks {
                    id,
                    block: BlockRef::Number(0),
                    max: 1,
                    skip: 0,
                    reverse: false,
                };
                if sender.send(request.to_bytes().unwrap()).await.is_err() {
                    break;
                }
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let (fast, fast_remote) = sync_peer("fast").await;
        assert!(service.pool().connected(fast));
        let headers = tokio::time::timeout(
            Duration::from_secs(2),
            fast_remote.get_block_headers(BlockRef::Number(0), 1, 0, false),
        )
        .await
        .expect("fast peer starved")
        .unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].number, 0);
    }

    #[tokio::test]
    async fn test_responses_capped_per_request() {
        let service = service(Arc::new(MemoryChain::with_height(300)));
        service.open().unwrap();

        let (peer, remote) = sync_peer("reader").await;
        assert!(service.pool().connected(peer));

        let blocks = remote
            .get_blocks(BlockRef::Number(0), 500, 0, false)
            .await
            .unwrap();
        assert_eq!(blocks.len() as u64, MAX_HEADERS_PER_REQUEST);
        assert_eq!(blocks[0].number(), 0);

        let headers = remote
            .get_block_headers(BlockRef::Number(1), 1000, 0, false)
            .await
            .unwrap();
        assert_eq!(headers.len() as u64, MAX_HEADERS_PER_REQUEST);
        assert_eq!(headers[191].number, 192);
    }

    #[tokio::test]
    async fn test_unknown_start_block_answers_empty() {
        let service = service(Arc::new(MemoryChain::with_height(5)));
        service.open().unwrap();

        let (peer, remote) = sync_peer("asker").await;
        assert!(service.pool().connected(peer));

        let unknown = BlockRef::Hash("ee".repeat(32));
        let headers = remote
            .get_block_headers(unknown.clone(), 3, 0, false)
            .await
            .unwrap();
        assert!(headers.is_empty());
        let blocks = remote.get_blocks(unknown, 3, 0, false).await.unwrap();
        assert!(blocks.is_empty());
    }
}
