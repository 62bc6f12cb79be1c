//! Fast synchronizer
//!
//! Periodically picks the peer with the heaviest chain and downloads the
//! blocks between the local tip and that peer's best block.

use crate::chain::{short_hash, BlockHash, BlockHeader, BlockRef, Chain, ChainError};
use crate::node::NodeEvent;
use crate::network::peer::{Peer, PeerId};
use crate::network::pool::{PeerPool, PoolEvent};
use crate::network::protocol::ProtocolError;
use crate::sync::fetcher::{BlockFetcher, FetchError, FetcherConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Without enough peers, sync anyway after this many intervals
pub const FORCE_SYNC_INTERVALS: u32 = 30;

/// Synchronizer errors
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Peer {0} has no sync session")]
    NoSession(PeerId),
    #[error("Peer {0} did not return its best header")]
    MissingHeader(PeerId),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Synchronizer tuning
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Peers needed before syncing without force
    pub min_peers: usize,
    /// Pause between sync rounds
    pub interval: Duration,
    pub fetcher: FetcherConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_peers: 3,
            interval: Duration::from_secs(1),
            fetcher: FetcherConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct Synchronizer {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    pool: PeerPool,
    chain: Arc<dyn Chain>,
    config: SyncConfig,
    events: broadcast::Sender<NodeEvent>,
    opened: AtomicBool,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    task: Mutex<Option<JoinHandle<()>>>,
    started_at: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Marks a peer busy until dropped
struct Busy(Arc<Peer>);

impl Busy {
    fn new(peer: Arc<Peer>) -> Self {
        peer.set_idle(false);
        Self(peer)
    }
}

impl Drop for Busy {
    fn drop(&mut self) {
        self.0.set_idle(true);
    }
}

impl Synchronizer {
    pub fn new(
        pool: PeerPool,
        chain: Arc<dyn Chain>,
        config: SyncConfig,
        events: broadcast::Sender<NodeEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                pool,
                chain,
                config,
                events,
                opened: AtomicBool::new(false),
                running: AtomicBool::new(false),
                cancel: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
                started_at: Mutex::new(Instant::now()),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Open the chain and start watching the pool for sync peers.
    /// Returns false if already open.
    pub fn open(&self) -> Result<bool, SyncError> {
        if self.inner.opened.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.chain.open()?;
        let blocks = self.inner.chain.blocks();
        log::info!(
            "Latest local block: number={} td={} hash={}",
            blocks.height,
            blocks.td,
            short_hash(&blocks.latest.hash())
        );

        let mut added = self.inner.pool.subscribe();
        tokio::spawn(async move {
            loop {
                match added.recv().await {
                    Ok(PoolEvent::Added(peer)) if syncable(&peer) => {
                        log::info!("Found sync peer: {}", peer)
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(true)
    }

    /// Most suitable peer to sync with. Below `min_peers` nothing is
    /// returned unless `force` is set.
    pub fn best(&self, force: bool) -> Option<Arc<Peer>> {
        let mut peers: Vec<Arc<Peer>> = self
            .inner
            .pool
            .peers()
            .into_iter()
            .filter(|p| syncable(p))
            .collect();
        if peers.len() < self.inner.config.min_peers && !force {
            return None;
        }
        peers.sort_by_key(|p| p.id());

        let local_td = self.inner.chain.blocks().td;
        let mut best: Option<(Arc<Peer>, u128)> = None;
        for peer in peers {
            let Some(td) = peer.sync().map(|s| s.status().total_difficulty) else {
                continue;
            };
            let better = match &best {
                None => td >= local_td,
                Some((_, best_td)) => td > *best_td,
            };
            if better {
                best = Some((peer, td));
            }
        }
        best.map(|(peer, _)| peer)
    }

    /// Header of the peer's advertised best block
    pub async fn latest(&self, peer: &Peer) -> Result<BlockHeader, SyncError> {
        let session = peer.sync().ok_or(SyncError::NoSession(peer.id()))?;
        let best = session.status().best_hash.clone();
        let headers = session
            .get_block_headers(BlockRef::Hash(best), 1, 0, false)
            .await?;
        headers
            .into_iter()
            .next()
            .ok_or(SyncError::MissingHeader(peer.id()))
    }

    /// Download everything `peer` has beyond our tip. Returns true if
    /// blocks were imported.
    pub async fn sync_with_peer(&self, peer: Option<Arc<Peer>>) -> Result<bool, SyncError> {
        let Some(peer) = peer else {
            return Ok(false);
        };
        let height = self.latest(&peer).await?.number;
        let local = self.inner.chain.blocks().height;
        if height <= local {
            return Ok(false);
        }

        let first = local + 1;
        let count = height - local;
        log::debug!(
            "Syncing with {} from {} ({} blocks)",
            peer.id(),
            first,
            count
        );

        let _busy = Busy::new(peer.clone());
        let cancel = lock(&self.inner.cancel).clone();
        let fetcher = BlockFetcher::new(
            peer,
            self.inner.chain.clone(),
            first,
            count,
            self.inner.config.fetcher.clone(),
        )?
        .cancelled_by(&cancel);
        fetcher.fetch().await?;
        Ok(true)
    }

    /// One sync round against the best peer
    pub async fn sync(&self) -> Result<bool, SyncError> {
        let deadline = self.inner.config.interval * FORCE_SYNC_INTERVALS;
        let force = lock(&self.inner.started_at).elapsed() >= deadline;
        let peer = self.best(force);
        self.sync_with_peer(peer).await
    }

    /// Log block announcements from a peer
    pub fn announced(&self, announcements: &[(BlockHash, u64)], peer: &Peer) {
        let Some((hash, number)) = announcements.last() else {
            return;
        };
        log::info!(
            "New block hashes received: count={} number={} hash={} peer={}",
            announcements.len(),
            number,
            short_hash(hash),
            peer.id()
        );
    }

    /// Start the sync loop. Returns false if already running.
    pub fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let cancel = CancellationToken::new();
        *lock(&self.inner.cancel) = cancel.clone();
        *lock(&self.inner.started_at) = Instant::now();

        let sync = self.clone();
        let task = tokio::spawn(async move { sync.run(cancel).await });
        *lock(&self.inner.task) = Some(task);
        log::debug!("Synchronizer started");
        true
    }

    async fn run(self, cancel: CancellationToken) {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sync() => result,
            };

            match result {
                Ok(true) => {
                    let height = self.inner.chain.blocks().height;
                    log::info!("Synchronized height={}", height);
                    let _ = self.inner.events.send(NodeEvent::Synchronized { height });
                }
                Ok(false) => {}
                Err(SyncError::Fetch(FetchError::Cancelled)) => break,
                Err(e) => {
                    log::warn!("Sync round failed: {}", e);
                    let _ = self
                        .inner
                        .events
                        .send(NodeEvent::Error(Arc::new(e.into())));
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.config.interval) => {}
            }
        }
        log::debug!("Synchronizer stopped");
    }

    /// Stop the loop and wait for it. Returns false if not running.
    pub async fn stop(&self) -> bool {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return false;
        }
        lock(&self.inner.cancel).cancel();
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        true
    }
}

fn syncable(peer: &Peer) -> bool {
    peer.sync().is_some()
}
