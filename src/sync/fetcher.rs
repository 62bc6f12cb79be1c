//! Block fetcher
//!
//! Retrieves a contiguous block range from one peer. The range is split into
//! batches, a bounded number of batch requests are in flight at once, and
//! batches are written to the chain strictly in order.

use crate::chain::{short_hash, Block, BlockRef, Chain, ChainError};
use crate::network::message::MAX_HEADERS_PER_REQUEST;
use crate::network::peer::{Peer, PeerId};
use crate::network::protocol::ProtocolError;
use crate::network::session::ProtocolSession;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const FETCHED_CHANNEL_SIZE: usize = 64;

/// Fetcher errors
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Empty block range")]
    EmptyRange,
    #[error("Peer {0} does not support the sync protocol")]
    UnsupportedPeer(PeerId),
    #[error("Invalid batch at {first}: {reason}")]
    InvalidBatch { first: u64, reason: String },
    #[error("Batch at {first} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        first: u64,
        attempts: usize,
        #[source]
        source: Box<FetchError>,
    },
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
    #[error("Fetch cancelled")]
    Cancelled,
}

/// Fetcher tuning
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Blocks per request, at most `MAX_HEADERS_PER_REQUEST`
    pub max_per_request: u64,
    /// Requests in flight at once
    pub max_outstanding: usize,
    /// Requests per batch before giving up
    pub attempts: usize,
    /// Pause between attempts
    pub interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_per_request: 128,
            max_outstanding: 4,
            attempts: 3,
            interval: Duration::from_secs(1),
        }
    }
}

/// Fetches `[first, first + count)` from a single peer
pub struct BlockFetcher {
    peer: Arc<Peer>,
    session: Arc<ProtocolSession>,
    chain: Arc<dyn Chain>,
    first: u64,
    count: u64,
    config: FetcherConfig,
    cancel: CancellationToken,
    attempts: AtomicUsize,
    fetched: broadcast::Sender<Arc<Vec<Block>>>,
}

impl BlockFetcher {
    pub fn new(
        peer: Arc<Peer>,
        chain: Arc<dyn Chain>,
        first: u64,
        count: u64,
        config: FetcherConfig,
    ) -> Result<Self, FetchError> {
        if count == 0 {
            return Err(FetchError::EmptyRange);
        }
        let session = peer
            .sync()
            .cloned()
            .ok_or(FetchError::UnsupportedPeer(peer.id()))?;
        let (fetched, _) = broadcast::channel(FETCHED_CHANNEL_SIZE);

        Ok(Self {
            peer,
            session,
            chain,
            first,
            count,
            config,
            cancel: CancellationToken::new(),
            attempts: AtomicUsize::new(0),
            fetched,
        })
    }

    /// Tie the fetcher's lifetime to `parent`: cancelling it destroys the
    /// fetcher.
    pub fn cancelled_by(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn first(&self) -> u64 {
        self.first
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Requests issued so far, retries included
    pub fn attempts_made(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Batches as they are written to the chain
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<Block>>> {
        self.fetched.subscribe()
    }

    /// Abandon the fetch. No further batches are requested or written.
    pub fn destroy(&self) {
        self.cancel.cancel();
    }

    /// Split the range into `(start, count)` batches. Peers never answer
    /// more than `MAX_HEADERS_PER_REQUEST` blocks, so no batch asks for more.
    fn batches(&self) -> Vec<(u64, u64)> {
        let step = self
            .config
            .max_per_request
            .clamp(1, MAX_HEADERS_PER_REQUEST);
        let end = self.first + self.count;
        let mut batches = Vec::new();
        let mut start = self.first;
        while start < end {
            let n = step.min(end - start);
            batches.push((start, n));
            start += n;
        }
        batches
    }

    /// Run until every batch is written. Returns the number of blocks
    /// imported.
    pub async fn fetch(&self) -> Result<u64, FetchError> {
        log::debug!(
            "Fetching blocks {}..{} from {}",
            self.first,
            self.first + self.count - 1,
            self.peer
        );

        let mut batches = stream::iter(self.batches())
            .map(|(start, n)| self.request(start, n))
            .buffered(self.config.max_outstanding.max(1));

        let mut imported = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                next = batches.next() => next,
            };
            let Some(result) = next else {
                break;
            };
            let blocks = result?;
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            self.chain.put_blocks(&blocks)?;
            imported += blocks.len() as u64;
            if let Some(last) = blocks.last() {
                log::info!(
                    "Imported blocks count={} number={} hash={} peer={}",
                    blocks.len(),
                    last.number(),
                    short_hash(&last.hash()),
                    self.peer.id()
                );
            }
            let _ = self.fetched.send(Arc::new(blocks));
        }
        Ok(imported)
    }

    /// One batch with retries
    async fn request(&self, start: u64, n: u64) -> Result<Vec<Block>, FetchError> {
        let attempts = self.config.attempts.max(1);
        let mut last = FetchError::EmptyRange;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(self.config.interval) => {}
                }
            }
            if self.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            self.attempts.fetch_add(1, Ordering::SeqCst);
            let result = match self
                .session
                .get_blocks(BlockRef::Number(start), n, 0, false)
                .await
            {
                Ok(blocks) => check_batch(start, n, &blocks).map(|_| blocks),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok(blocks) => return Ok(blocks),
                Err(e) => {
                    log::debug!(
                        "Batch {} attempt {}/{} from {} failed: {}",
                        start,
                        attempt,
                        attempts,
                        self.peer.id(),
                        e
                    );
                    let gone = matches!(e, FetchError::Protocol(ProtocolError::Disconnected));
                    last = e;
                    if gone {
                        break;
                    }
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            first: start,
            attempts,
            source: Box::new(last),
        })
    }
}

/// A batch must be exactly `[start, start + n)` in order
fn check_batch(start: u64, n: u64, blocks: &[Block]) -> Result<(), FetchError> {
    let invalid = |reason: String| FetchError::InvalidBatch {
        first: start,
        reason,
    };
    let Some(first) = blocks.first() else {
        return Err(invalid("empty response".into()));
    };
    if first.number() != start {
        return Err(invalid(format!("starts at {}", first.number())));
    }
    if let Some(pair) = blocks
        .windows(2)
        .find(|w| w[1].number() != w[0].number() + 1)
    {
        return Err(invalid(format!(
            "gap between {} and {}",
            pair[0].number(),
            pair[1].number()
        )));
    }
    if blocks.len() as u64 != n {
        return Err(invalid(format!("{} of {} blocks", blocks.len(), n)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MemoryChain;
    use crate::network::test_utils::{served_peer, Responder};

    fn config() -> FetcherConfig {
        FetcherConfig {
            max_per_request: 8,
            max_outstanding: 3,
            attempts: 3,
            interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_fetch_range_in_order() {
        let remote = Arc::new(MemoryChain::with_height(50));
        let (peer, requests) =
            served_peer("honest", remote.clone(), Responder::Honest, Duration::from_secs(1)).await;
        let local = Arc::new(MemoryChain::new());

        let fetcher = BlockFetcher::new(peer, local.clone(), 1, 50, config()).unwrap();
        let mut fetched = fetcher.subscribe();
        assert_eq!(fetcher.fetch().await.unwrap(), 50);

        assert_eq!(local.blocks().height, 50);
        assert_eq!(local.blocks().latest.hash(), remote.blocks().latest.hash());
        // 50 blocks in batches of 8
        assert_eq!(requests.load(Ordering::SeqCst), 7);
        assert_eq!(fetcher.attempts_made(), 7);

        let mut next_first = 1;
        while let Ok(batch) = fetched.try_recv() {
            assert_eq!(batch[0].number(), next_first);
            next_first += batch.len() as u64;
        }
        assert_eq!(next_first, 51);
    }

    #[tokio::test]
    async fn test_batches_never_exceed_peer_cap() {
        let remote = Arc::new(MemoryChain::with_height(300));
        let (peer, requests) =
            served_peer("capped", remote.clone(), Responder::Honest, Duration::from_secs(1)).await;
        let local = Arc::new(MemoryChain::new());

        let mut cfg = config();
        cfg.max_per_request = 256;
        cfg.attempts = 1;
        let fetcher = BlockFetcher::new(peer, local.clone(), 1, 300, cfg).unwrap();

        assert_eq!(fetcher.fetch().await.unwrap(), 300);
        assert_eq!(local.blocks().height, 300);
        // 192 + 108
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_range_and_unsupported_peer() {
        let (peer, _) = served_peer(
            "p",
            Arc::new(MemoryChain::new()),
            Responder::Honest,
            Duration::from_secs(1),
        )
        .await;
        let chain: Arc<dyn Chain> = Arc::new(MemoryChain::new());

        let empty = BlockFetcher::new(peer, chain.clone(), 1, 0, config());
        assert!(matches!(empty, Err(FetchError::EmptyRange)));

        let bare = Arc::new(Peer::new(PeerId::from_name("bare"), "h", 1, "memory"));
        let unsupported = BlockFetcher::new(bare, chain, 1, 5, config());
        assert!(matches!(unsupported, Err(FetchError::UnsupportedPeer(_))));
    }

    #[tokio::test]
    async fn test_retries_recover() {
        let remote = Arc::new(MemoryChain::with_height(4));
        let (peer, requests) = served_peer(
            "flaky",
            remote,
            Responder::Flaky(2),
            Duration::from_millis(30),
        )
        .await;
        let local = Arc::new(MemoryChain::new());

        let fetcher = BlockFetcher::new(peer, local.clone(), 1, 4, config()).unwrap();
        assert_eq!(fetcher.fetch().await.unwrap(), 4);
        assert_eq!(requests.load(Ordering::SeqCst), 3);
        assert_eq!(local.blocks().height, 4);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let remote = Arc::new(MemoryChain::with_height(4));
        let (peer, requests) =
            served_peer("short", remote, Responder::Short, Duration::from_secs(1)).await;
        let local = Arc::new(MemoryChain::new());

        let fetcher = BlockFetcher::new(peer, local.clone(), 1, 4, config()).unwrap();
        match fetcher.fetch().await {
            Err(FetchError::RetriesExhausted {
                first,
                attempts,
                source,
            }) => {
                assert_eq!(first, 1);
                assert_eq!(attempts, 3);
                assert!(matches!(*source, FetchError::InvalidBatch { .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(requests.load(Ordering::SeqCst), 3);
        assert_eq!(fetcher.attempts_made(), 3);
        assert_eq!(local.blocks().height, 0);
    }

    #[tokio::test]
    async fn test_partial_progress_kept() {
        // Remote only has 10 of the 20 requested blocks
        let remote = Arc::new(MemoryChain::with_height(10));
        let (peer, _) =
            served_peer("partial", remote, Responder::Honest, Duration::from_secs(1)).await;
        let local = Arc::new(MemoryChain::new());

        let mut cfg = config();
        cfg.max_per_request = 5;
        cfg.attempts = 1;
        let fetcher = BlockFetcher::new(peer, local.clone(), 1, 20, cfg).unwrap();

        assert!(matches!(
            fetcher.fetch().await,
            Err(FetchError::RetriesExhausted { first: 11, .. })
        ));
        assert_eq!(local.blocks().height, 10);
    }

    #[tokio::test]
    async fn test_destroy_cancels_fetch() {
        let remote = Arc::new(MemoryChain::with_height(4));
        let (peer, _) =
            served_peer("silent", remote, Responder::Silent, Duration::from_secs(10)).await;
        let local = Arc::new(MemoryChain::new());

        let parent = CancellationToken::new();
        let fetcher = Arc::new(
            BlockFetcher::new(peer, local.clone(), 1, 4, config())
                .unwrap()
                .cancelled_by(&parent),
        );
        let running = fetcher.clone();
        let task = tokio::spawn(async move { running.fetch().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(FetchError::Cancelled)));
        assert_eq!(local.blocks().height, 0);

        // A destroyed fetcher stays destroyed
        fetcher.destroy();
        assert!(matches!(fetcher.fetch().await, Err(FetchError::Cancelled)));
    }

    #[test]
    fn test_check_batch() {
        let chain = MemoryChain::with_height(5);
        let blocks = chain.get_blocks(&BlockRef::Number(2), 3, 0, false).unwrap();

        assert!(check_batch(2, 3, &blocks).is_ok());
        assert!(check_batch(1, 3, &blocks).is_err());
        assert!(check_batch(2, 4, &blocks).is_err());
        assert!(check_batch(2, 0, &[]).is_err());

        let gapped = chain.get_blocks(&BlockRef::Number(1), 3, 1, false).unwrap();
        assert!(check_batch(1, 3, &gapped).is_err());
    }
}
