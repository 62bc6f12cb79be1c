//! Network server
//!
//! Turns transport signals into bound peers. The server owns the protocol
//! registry and the ban list, binds every negotiated session of a new
//! connection and only then reports the peer as connected.

use crate::network::ban::{BanList, DEFAULT_BAN_DURATION};
use crate::network::peer::{Peer, PeerId, PEER_EVENT_BUFFER};
use crate::network::protocol::{Protocol, ProtocolError, ProtocolRegistry};
use crate::network::transport::{
    DisconnectReason, SeedNode, Transport, TransportError, TransportEvent, TransportPeer,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock as StdRwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// Buffered transport signals
const TRANSPORT_EVENT_BUFFER: usize = 1024;

/// Buffered server events
const SERVER_EVENT_BUFFER: usize = 1024;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Failed to bind peer {peer}: {source}")]
    Bind {
        peer: PeerId,
        #[source]
        source: ProtocolError,
    },
    #[error("Peer {0} is banned")]
    Banned(PeerId),
    #[error("Cannot add protocols after the server has been started")]
    AlreadyStarted,
    #[error("Server not started")]
    NotStarted,
}

impl ServerError {
    /// Network churn that is not worth surfacing
    pub fn is_benign(&self) -> bool {
        match self {
            ServerError::Transport(e) => e.is_benign(),
            ServerError::Protocol(e) | ServerError::Bind { source: e, .. } => e.is_benign(),
            _ => false,
        }
    }
}

/// Signals emitted by the server
#[derive(Debug)]
pub enum ServerEvent {
    Listening { transport: String, url: String },
    Connected(Arc<Peer>),
    Disconnected { peer: Arc<Peer>, reason: String },
    PeerError { peer: Arc<Peer>, error: ServerError },
    Error(ServerError),
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Nodes to contact on start
    pub bootnodes: Vec<SeedNode>,
    /// Ban duration used when none is given
    pub ban_duration: Duration,
    /// Capacity of the server event queue
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 30303,
            bootnodes: Vec::new(),
            ban_duration: DEFAULT_BAN_DURATION,
            event_buffer: SERVER_EVENT_BUFFER,
        }
    }
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    transport: Arc<dyn Transport>,
    protocols: StdRwLock<ProtocolRegistry>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    /// Peers whose sessions are still being bound
    connecting: Mutex<HashMap<PeerId, (u64, CancellationToken)>>,
    attempts: AtomicU64,
    bans: BanList,
    events: mpsc::Sender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ServerEvent>>>,
    started: AtomicBool,
    shutdown: Mutex<CancellationToken>,
}

/// Accepts and dials peers over one transport
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: ServerConfig, transport: Arc<dyn Transport>) -> Self {
        let (events, events_rx) = mpsc::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(ServerInner {
                config,
                transport,
                protocols: StdRwLock::new(ProtocolRegistry::new()),
                peers: RwLock::new(HashMap::new()),
                connecting: Mutex::new(HashMap::new()),
                attempts: AtomicU64::new(0),
                bans: BanList::new(),
                events,
                events_rx: Mutex::new(Some(events_rx)),
                started: AtomicBool::new(false),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ServerInner>) -> Self {
        Self { inner }
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }

    pub fn local_id(&self) -> PeerId {
        self.inner.transport.local_id()
    }

    pub fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Take the server event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<ServerEvent>> {
        lock(&self.inner.events_rx).take()
    }

    /// Register protocols. Must happen before [`Server::start`].
    pub fn add_protocols(&self, protocols: Vec<Arc<dyn Protocol>>) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::AlreadyStarted);
        }
        let mut registry = self.inner.protocols.write().unwrap_or_else(|e| e.into_inner());
        for protocol in protocols {
            let name = protocol.descriptor().name.clone();
            if !registry.register(protocol) {
                log::warn!("Protocol {} already registered", name);
            }
        }
        Ok(())
    }

    pub fn protocols(&self) -> ProtocolRegistry {
        self.inner
            .protocols
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open protocols, start the transport and contact the bootnodes.
    /// Returns false if already started.
    pub async fn start(&self) -> Result<bool, ServerError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let registry = self.protocols();
        for protocol in registry.iter() {
            if let Err(e) = protocol.open() {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        let shutdown = CancellationToken::new();
        *lock(&self.inner.shutdown) = shutdown.clone();

        let (tx, rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);
        if let Err(e) = self
            .inner
            .transport
            .listen(self.inner.config.port, registry.capabilities(), tx)
            .await
        {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        tokio::spawn(self.clone().run(rx, shutdown));

        for seed in self.inner.config.bootnodes.clone() {
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.inner.transport.bootstrap(seed).await {
                    server.report(e.into(), None).await;
                }
            });
        }

        log::info!("Started {} server.", self.transport_name());
        Ok(true)
    }

    /// Stop the event loop, close live peers and the transport.
    /// Returns false if not running.
    pub async fn stop(&self) -> bool {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            return false;
        }
        lock(&self.inner.shutdown).cancel();
        for (_, (_, token)) in lock(&self.inner.connecting).drain() {
            token.cancel();
        }

        let mut peers = self.inner.peers.write().await;
        for (_, peer) in peers.drain() {
            peer.close();
        }
        drop(peers);

        self.inner.transport.close();
        log::info!("Stopped {} server.", self.transport_name());
        true
    }

    /// Dial a peer unless it is banned
    pub async fn connect(&self, id: PeerId, host: &str, port: u16) -> Result<(), ServerError> {
        if !self.is_running() {
            return Err(ServerError::NotStarted);
        }
        if self.inner.bans.is_banned(&id) {
            return Err(ServerError::Banned(id));
        }
        self.inner
            .transport
            .connect(id, host.to_string(), port)
            .await?;
        Ok(())
    }

    pub fn disconnect(&self, id: PeerId, reason: DisconnectReason) {
        self.inner.transport.disconnect(id, reason);
    }

    /// Refuse `id` for `duration` (default ban duration if `None`) and drop
    /// any live connection with it. Returns false if not running.
    pub fn ban(&self, id: PeerId, duration: Option<Duration>) -> bool {
        if !self.is_running() {
            return false;
        }
        let duration = duration.unwrap_or(self.inner.config.ban_duration);
        self.inner.bans.ban(id, duration);
        self.inner.transport.ban(id, duration);
        if let Some((_, token)) = lock(&self.inner.connecting).remove(&id) {
            token.cancel();
        }
        self.inner
            .transport
            .disconnect(id, DisconnectReason::UselessPeer);
        log::debug!("Banned {} for {:?}", id, duration);
        true
    }

    pub fn is_banned(&self, id: &PeerId) -> bool {
        self.inner.bans.is_banned(id)
    }

    pub async fn peer(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.inner.peers.read().await.get(id).cloned()
    }

    pub async fn peers(&self) -> Vec<Arc<Peer>> {
        self.inner.peers.read().await.values().cloned().collect()
    }

    async fn run(self, mut rx: mpsc::Receiver<TransportEvent>, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                TransportEvent::Listening { url } => {
                    log::info!("Listening on {}", url);
                    self.emit(ServerEvent::Listening {
                        transport: self.transport_name().to_string(),
                        url,
                    })
                    .await;
                }
                TransportEvent::PeerAdded(peer) => self.peer_added(peer),
                TransportEvent::PeerRemoved { id, reason } => self.peer_removed(id, reason).await,
                TransportEvent::PeerError { id, error } => {
                    let peer = match id {
                        Some(id) => self.peer(&id).await,
                        None => None,
                    };
                    self.report(error.into(), peer).await;
                }
            }
        }
        log::debug!("{} server event loop stopped", self.transport_name());
    }

    fn peer_added(&self, remote: TransportPeer) {
        let id = remote.id;
        if self.inner.bans.is_banned(&id) {
            log::debug!("Rejected banned peer {}", id);
            self.inner
                .transport
                .disconnect(id, DisconnectReason::UselessPeer);
            return;
        }

        let attempt = self.inner.attempts.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        if let Some((_, previous)) = lock(&self.inner.connecting).insert(id, (attempt, token.clone()))
        {
            previous.cancel();
        }

        let server = self.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = token.cancelled() => None,
                result = server.accept(remote) => Some(result),
            };

            match result {
                None => log::debug!("Dropped {} while binding protocols", id),
                Some(Ok(peer)) => server.admit(peer, attempt, &token).await,
                Some(Err(e)) => {
                    server.forget_attempt(id, attempt);
                    server
                        .inner
                        .transport
                        .disconnect(id, DisconnectReason::SubprotocolError);
                    server.report(e, None).await;
                }
            }
        });
    }

    /// Bind every negotiated session of a new connection
    async fn accept(&self, remote: TransportPeer) -> Result<Arc<Peer>, ServerError> {
        let id = remote.id;
        let registry = self.protocols();
        let agreed = registry.negotiate(&remote.capabilities);
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_BUFFER);

        let binds: Vec<_> = remote
            .sessions
            .into_iter()
            .filter_map(|session| {
                if !agreed.contains(&session.capability) {
                    log::debug!("Ignoring {} session from {}", session.capability, id);
                    return None;
                }
                let protocol = registry.resolve(&session.capability)?.clone();
                let events = events_tx.clone();
                Some(async move {
                    let required = protocol.descriptor().required;
                    let name = protocol.descriptor().name.clone();
                    (name, required, protocol.bind(id, session, events).await)
                })
            })
            .collect();
        drop(events_tx);

        let mut peer = Peer::new(id, remote.host, remote.port, self.transport_name())
            .inbound(remote.inbound)
            .with_server(Arc::downgrade(&self.inner));

        for (name, required, result) in futures::future::join_all(binds).await {
            match result {
                Ok(session) => peer = peer.with_session(session),
                Err(source) if required => return Err(ServerError::Bind { peer: id, source }),
                Err(e) => log::debug!("Optional protocol {} failed for {}: {}", name, id, e),
            }
        }

        if let Some(missing) = registry.required().find(|name| !peer.understands(name)) {
            return Err(ServerError::Bind {
                peer: id,
                source: ProtocolError::NotNegotiated(missing.to_string()),
            });
        }

        Ok(Arc::new(peer.with_events(events_rx)))
    }

    async fn admit(&self, peer: Arc<Peer>, attempt: u64, token: &CancellationToken) {
        let id = peer.id();
        let permit = self.reserve().await;
        // Sending under the registry lock orders Connected before any Disconnected
        let mut peers = self.inner.peers.write().await;
        self.forget_attempt(id, attempt);
        if token.is_cancelled() {
            peer.close();
            log::debug!("Dropped {} while binding protocols", id);
            return;
        }
        if peers.contains_key(&id) {
            peer.close();
            log::debug!("Ignoring duplicate connection from {}", id);
            return;
        }
        peers.insert(id, peer.clone());
        log::info!("Peer connected: {}", peer);
        if let Some(permit) = permit {
            permit.send(ServerEvent::Connected(peer));
        }
    }

    async fn peer_removed(&self, id: PeerId, reason: DisconnectReason) {
        if let Some((_, token)) = lock(&self.inner.connecting).remove(&id) {
            token.cancel();
        }
        let permit = self.reserve().await;
        let mut peers = self.inner.peers.write().await;
        if let Some(peer) = peers.remove(&id) {
            peer.close();
            log::info!("Peer disconnected ({}): {}", reason, peer);
            if let Some(permit) = permit {
                permit.send(ServerEvent::Disconnected {
                    peer,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn forget_attempt(&self, id: PeerId, attempt: u64) {
        let mut connecting = lock(&self.inner.connecting);
        if matches!(connecting.get(&id), Some((a, _)) if *a == attempt) {
            connecting.remove(&id);
        }
    }

    /// Route an error: benign ones are dropped, the rest become events
    async fn report(&self, error: ServerError, peer: Option<Arc<Peer>>) {
        if error.is_benign() {
            log::debug!("Ignored network error: {}", error);
            return;
        }
        match peer {
            Some(peer) => self.emit(ServerEvent::PeerError { peer, error }).await,
            None => self.emit(ServerEvent::Error(error)).await,
        }
    }

    /// Room for one event, taken before any registry lock. None when nobody
    /// listens.
    async fn reserve(&self) -> Option<mpsc::Permit<'_, ServerEvent>> {
        let permit = self.inner.events.reserve().await.ok();
        if permit.is_none() {
            log::debug!("Server event dropped, no listener");
        }
        permit
    }

    async fn emit(&self, event: ServerEvent) {
        if self.inner.events.send(event).await.is_err() {
            log::debug!("Server event dropped, no listener");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Chain, MemoryChain};
    use crate::network::memory::{MemoryNetwork, MemoryTransport};
    use crate::network::protocol::{SyncProtocol, SYNC_PROTOCOL};

    fn server(network: &MemoryNetwork, name: &str, chain: Arc<dyn Chain>) -> Server {
        server_with(network, name, chain, ServerConfig::default()).0
    }

    fn server_with(
        network: &MemoryNetwork,
        name: &str,
        chain: Arc<dyn Chain>,
        config: ServerConfig,
    ) -> (Server, MemoryTransport) {
        let transport = MemoryTransport::new(network.clone(), name, PeerId::from_name(name));
        let server = Server::new(config, Arc::new(transport.clone()));
        server
            .add_protocols(vec![Arc::new(SyncProtocol::new(
                chain,
                Duration::from_millis(500),
            ))])
            .unwrap();
        (server, transport)
    }

    async fn next_event(rx: &mut mpsc::Receiver<ServerEvent>) -> ServerEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for server event")
            .expect("event channel closed")
    }

    async fn next_connected(rx: &mut mpsc::Receiver<ServerEvent>) -> Arc<Peer> {
        loop {
            if let ServerEvent::Connected(peer) = next_event(rx).await {
                return peer;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_binds_sync_protocol() {
        let network = MemoryNetwork::new();
        let local = server(&network, "local", Arc::new(MemoryChain::new()));
        let remote = server(&network, "remote", Arc::new(MemoryChain::with_height(4)));
        let mut local_events = local.take_events().unwrap();
        let mut remote_events = remote.take_events().unwrap();

        local.start().await.unwrap();
        remote.start().await.unwrap();
        assert!(matches!(
            next_event(&mut local_events).await,
            ServerEvent::Listening { .. }
        ));

        local
            .connect(PeerId::from_name("remote"), "remote", 30303)
            .await
            .unwrap();

        let peer = next_connected(&mut local_events).await;
        assert_eq!(peer.id(), PeerId::from_name("remote"));
        assert!(!peer.is_inbound());
        assert!(peer.understands(SYNC_PROTOCOL));
        assert_eq!(peer.sync().unwrap().status().total_difficulty, 5 * 131_072);
        assert!(peer.server().is_some());

        let inbound = next_connected(&mut remote_events).await;
        assert!(inbound.is_inbound());
        assert_eq!(local.peers().await.len(), 1);

        local.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_reports_reason() {
        let network = MemoryNetwork::new();
        let local = server(&network, "local", Arc::new(MemoryChain::new()));
        let remote = server(&network, "remote", Arc::new(MemoryChain::new()));
        let mut local_events = local.take_events().unwrap();

        local.start().await.unwrap();
        remote.start().await.unwrap();
        local
            .connect(PeerId::from_name("remote"), "remote", 30303)
            .await
            .unwrap();
        let peer = next_connected(&mut local_events).await;

        local.disconnect(peer.id(), DisconnectReason::ClientQuitting);
        loop {
            if let ServerEvent::Disconnected { peer: gone, reason } =
                next_event(&mut local_events).await
            {
                assert_eq!(gone.id(), peer.id());
                assert_eq!(reason, "client quitting");
                break;
            }
        }
        assert!(peer.sync().unwrap().is_closed());
        assert!(local.peer(&peer.id()).await.is_none());

        local.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn test_ban_rejects_reconnect() {
        let network = MemoryNetwork::new();
        let local = server(&network, "local", Arc::new(MemoryChain::new()));
        let remote = server(&network, "remote", Arc::new(MemoryChain::new()));
        let mut local_events = local.take_events().unwrap();
        let remote_id = PeerId::from_name("remote");

        assert!(!local.ban(remote_id, None), "ban needs a running server");

        local.start().await.unwrap();
        remote.start().await.unwrap();
        local.connect(remote_id, "remote", 30303).await.unwrap();
        next_connected(&mut local_events).await;

        assert!(local.ban(remote_id, Some(Duration::from_millis(200))));
        assert!(local.is_banned(&remote_id));
        loop {
            if let ServerEvent::Disconnected { .. } = next_event(&mut local_events).await {
                break;
            }
        }

        let refused = local.connect(remote_id, "remote", 30303).await;
        assert!(matches!(refused, Err(ServerError::Banned(_))));

        // Inbound attempts from the banned identity are dropped before binding
        remote
            .connect(PeerId::from_name("local"), "local", 30303)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(local.peers().await.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!local.is_banned(&remote_id));
        local.connect(remote_id, "remote", 30303).await.unwrap();
        next_connected(&mut local_events).await;

        local.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn test_network_mismatch_is_swallowed() {
        let network = MemoryNetwork::new();
        let local = server(&network, "local", Arc::new(MemoryChain::new()));
        let remote = server(
            &network,
            "remote",
            Arc::new(MemoryChain::new().with_network_id(7)),
        );
        let mut local_events = local.take_events().unwrap();

        local.start().await.unwrap();
        remote.start().await.unwrap();
        local
            .connect(PeerId::from_name("remote"), "remote", 30303)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(local.peers().await.is_empty());
        while let Ok(event) = local_events.try_recv() {
            assert!(
                matches!(event, ServerEvent::Listening { .. }),
                "unexpected {:?}",
                event
            );
        }

        local.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn test_missing_required_protocol() {
        let network = MemoryNetwork::new();
        let local = server(&network, "local", Arc::new(MemoryChain::new()));
        // Remote speaks no protocols at all
        let bare = Server::new(
            ServerConfig::default(),
            Arc::new(MemoryTransport::new(
                network.clone(),
                "bare",
                PeerId::from_name("bare"),
            )),
        );
        let mut local_events = local.take_events().unwrap();

        local.start().await.unwrap();
        bare.start().await.unwrap();
        local
            .connect(PeerId::from_name("bare"), "bare", 30303)
            .await
            .unwrap();

        loop {
            match next_event(&mut local_events).await {
                ServerEvent::Error(ServerError::Bind { peer, source }) => {
                    assert_eq!(peer, PeerId::from_name("bare"));
                    assert!(matches!(source, ProtocolError::NotNegotiated(_)));
                    break;
                }
                ServerEvent::Connected(_) => panic!("peer without sync protocol admitted"),
                _ => {}
            }
        }

        local.stop().await;
        bare.stop().await;
    }

    #[tokio::test]
    async fn test_add_protocols_after_start() {
        let network = MemoryNetwork::new();
        let local = server(&network, "local", Arc::new(MemoryChain::new()));
        local.start().await.unwrap();
        assert!(!local.start().await.unwrap());

        let late = local.add_protocols(vec![]);
        assert!(matches!(late, Err(ServerError::AlreadyStarted)));

        assert!(local.stop().await);
        assert!(!local.stop().await);
    }

    #[tokio::test]
    async fn test_transport_errors_classified() {
        let network = MemoryNetwork::new();
        let (local, transport) = server_with(
            &network,
            "local",
            Arc::new(MemoryChain::new()),
            ServerConfig::default(),
        );
        let remote = server(&network, "remote", Arc::new(MemoryChain::new()));
        let mut events = local.take_events().unwrap();
        let remote_id = PeerId::from_name("remote");

        local.start().await.unwrap();
        remote.start().await.unwrap();
        local.connect(remote_id, "remote", 30303).await.unwrap();
        next_connected(&mut events).await;

        transport.inject_error(Some(remote_id), TransportError::ConnectionReset);
        transport.inject_error(Some(remote_id), TransportError::UnknownEndpoint("x".into()));
        transport.inject_error(None, TransportError::NotListening);

        match next_event(&mut events).await {
            ServerEvent::PeerError { peer, error } => {
                assert_eq!(peer.id(), remote_id);
                assert!(matches!(
                    error,
                    ServerError::Transport(TransportError::UnknownEndpoint(_))
                ));
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut events).await {
            ServerEvent::Error(ServerError::Transport(TransportError::NotListening)) => {}
            other => panic!("unexpected {:?}", other),
        }

        transport.inject_error(None, TransportError::BrokenPipe);
        let quiet = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(quiet.is_err(), "benign error surfaced");

        local.stop().await;
        remote.stop().await;
    }

    #[tokio::test]
    async fn test_full_event_queue_does_not_block_lookups() {
        let network = MemoryNetwork::new();
        // Room for Listening and Connected only
        let config = ServerConfig {
            event_buffer: 2,
            ..ServerConfig::default()
        };
        let (local, _) = server_with(&network, "local", Arc::new(MemoryChain::new()), config);
        let remote = server(&network, "remote", Arc::new(MemoryChain::new()));
        let mut events = local.take_events().unwrap();
        let remote_id = PeerId::from_name("remote");

        local.start().await.unwrap();
        remote.start().await.unwrap();
        local.connect(remote_id, "remote", 30303).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while local.peer(&remote_id).await.is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        // The removal waits for queue space; lookups must not wait with it
        remote.disconnect(PeerId::from_name("local"), DisconnectReason::ClientQuitting);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let peers = tokio::time::timeout(Duration::from_secs(1), local.peers()).await;
        assert!(peers.is_ok(), "registry lookup blocked by a full event queue");

        assert!(matches!(next_event(&mut events).await, ServerEvent::Listening { .. }));
        assert!(matches!(next_event(&mut events).await, ServerEvent::Connected(_)));
        match next_event(&mut events).await {
            ServerEvent::Disconnected { peer, .. } => assert_eq!(peer.id(), remote_id),
            other => panic!("unexpected {:?}", other),
        }
        assert!(local.peer(&remote_id).await.is_none());

        local.stop().await;
        remote.stop().await;
    }
}
