//! Peer pool
//!
//! The bounded set of connected peers the node works with. The pool is fed by
//! server connect/disconnect signals, forwards peer messages to whoever owns
//! the message queue, and bans peers that misbehave.

use crate::network::message::SyncMessage;
use crate::network::peer::{Peer, PeerEvent, PeerId};
use crate::network::transport::DisconnectReason;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

const EVENT_CHANNEL_SIZE: usize = 256;
const MESSAGE_QUEUE_SIZE: usize = 1024;

/// Default pool capacity
pub const DEFAULT_MAX_PEERS: usize = 25;

/// Membership changes
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Added(Arc<Peer>),
    Removed(Arc<Peer>),
    Banned(Arc<Peer>),
}

/// A message received from a pool member
#[derive(Debug)]
pub struct PoolMessage {
    pub peer: Arc<Peer>,
    pub protocol: String,
    pub message: SyncMessage,
}

#[derive(Clone)]
pub struct PeerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_peers: usize,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    opened: AtomicBool,
    rng: Mutex<StdRng>,
    events: broadcast::Sender<PoolEvent>,
    messages: mpsc::Sender<PoolMessage>,
    messages_rx: Mutex<Option<mpsc::Receiver<PoolMessage>>>,
}

impl PeerPool {
    pub fn new(max_peers: usize) -> Self {
        Self::with_rng(max_peers, StdRng::from_entropy())
    }

    /// Pool with a deterministic idle-peer selection
    pub fn with_seed(max_peers: usize, seed: u64) -> Self {
        Self::with_rng(max_peers, StdRng::seed_from_u64(seed))
    }

    fn with_rng(max_peers: usize, rng: StdRng) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let (messages, messages_rx) = mpsc::channel(MESSAGE_QUEUE_SIZE);
        Self {
            inner: Arc::new(PoolInner {
                max_peers,
                peers: RwLock::new(HashMap::new()),
                opened: AtomicBool::new(false),
                rng: Mutex::new(rng),
                events,
                messages,
                messages_rx: Mutex::new(Some(messages_rx)),
            }),
        }
    }

    /// Returns false if already open
    pub fn open(&self) -> bool {
        !self.inner.opened.swap(true, Ordering::SeqCst)
    }

    /// Forget every member. Returns false if not open.
    pub fn close(&self) -> bool {
        if !self.inner.opened.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.write().clear();
        true
    }

    pub fn is_open(&self) -> bool {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn max_peers(&self) -> usize {
        self.inner.max_peers
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// Take the member message queue. Only the first caller gets it.
    pub fn take_messages(&self) -> Option<mpsc::Receiver<PoolMessage>> {
        self.inner
            .messages_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.inner.peers.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PeerId, Arc<Peer>>> {
        self.inner.peers.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.read().values().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.read().contains_key(id)
    }

    /// True if this exact peer object is the member for its id
    fn is_member(&self, peer: &Arc<Peer>) -> bool {
        self.read()
            .get(&peer.id())
            .is_some_and(|member| Arc::ptr_eq(member, peer))
    }

    /// A random idle member matching `filter`
    pub fn idle(&self, filter: impl Fn(&Peer) -> bool) -> Option<Arc<Peer>> {
        let mut candidates: Vec<Arc<Peer>> = self
            .read()
            .values()
            .filter(|p| p.is_idle() && filter(p))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Map order is arbitrary; sort so a seeded rng is reproducible
        candidates.sort_by_key(|p| p.id());
        let index = self
            .inner
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0..candidates.len());
        Some(candidates.swap_remove(index))
    }

    /// Admit a peer. No-op when closed, full, or the id is already present.
    pub fn add(&self, peer: Arc<Peer>) -> bool {
        if !self.is_open() {
            return false;
        }
        {
            let mut peers = self.write();
            if peers.len() >= self.inner.max_peers || peers.contains_key(&peer.id()) {
                return false;
            }
            peers.insert(peer.id(), peer.clone());
        }
        log::debug!("Pool added peer {}", peer);
        let _ = self.inner.events.send(PoolEvent::Added(peer));
        true
    }

    /// Remove a member by id. Absent ids are a no-op.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let removed = self.write().remove(&peer.id());
        match removed {
            Some(member) => {
                log::debug!("Pool removed peer {}", member);
                let _ = self.inner.events.send(PoolEvent::Removed(member));
                true
            }
            None => false,
        }
    }

    /// A peer finished binding on the server
    pub fn connected(&self, peer: Arc<Peer>) -> bool {
        let full = self.size() >= self.inner.max_peers;
        if !self.add(peer.clone()) {
            if full && !self.contains(&peer.id()) {
                log::debug!("Pool full, dropping {}", peer);
                if let Some(server) = peer.server() {
                    server.disconnect(peer.id(), DisconnectReason::TooManyPeers);
                }
            }
            return false;
        }

        if let Some(events) = peer.take_events() {
            tokio::spawn(self.clone().forward(peer, events));
        }
        true
    }

    /// A peer went away on the server
    pub fn disconnected(&self, peer: &Arc<Peer>) -> bool {
        self.remove(peer)
    }

    /// Ban a peer through its server and drop it from the pool. Peers whose
    /// server is gone are ignored.
    pub fn ban(&self, peer: &Arc<Peer>, duration: Option<Duration>) -> bool {
        let Some(server) = peer.server() else {
            return false;
        };
        if !server.ban(peer.id(), duration) {
            return false;
        }
        self.remove(peer);
        log::debug!("Banned peer {}", peer);
        let _ = self.inner.events.send(PoolEvent::Banned(peer.clone()));
        true
    }

    /// Misbehaviour reported for `peer`; members get banned
    pub fn peer_error(&self, peer: &Arc<Peer>, error: impl fmt::Display) -> bool {
        if !self.is_member(peer) {
            return false;
        }
        log::warn!("Peer error from {}: {}", peer, error);
        self.ban(peer, None)
    }

    async fn forward(self, peer: Arc<Peer>, mut events: mpsc::Receiver<PeerEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_member(&peer) {
                break;
            }
            match event {
                PeerEvent::Message { protocol, message } => {
                    let message = PoolMessage {
                        peer: peer.clone(),
                        protocol,
                        message,
                    };
                    if self.inner.messages.send(message).await.is_err() {
                        log::debug!("No message listener, dropping message from {}", peer);
                    }
                }
                PeerEvent::Error { protocol, error } => {
                    self.peer_error(&peer, format!("{}: {}", protocol, error));
                }
            }
        }
    }
}

impl Default for PeerPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PEERS)
    }
}
