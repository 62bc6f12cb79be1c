//! Bound protocol sessions
//!
//! A [`ProtocolSession`] wraps one negotiated transport session after the
//! status exchange. A reader task matches responses to outstanding requests
//! by id and forwards everything else to the owning peer's event queue.

use crate::chain::{Block, BlockHeader, BlockRef};
use crate::network::message::{Status, SyncMessage};
use crate::network::peer::{PeerEvent, PeerId};
use crate::network::protocol::ProtocolError;
use crate::network::transport::TransportSession;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<SyncMessage>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// One protocol bound on one peer connection
pub struct ProtocolSession {
    name: String,
    version: u32,
    peer: PeerId,
    status: Status,
    bound_at: Instant,
    sender: mpsc::Sender<Bytes>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
    closed: CancellationToken,
}

impl ProtocolSession {
    /// Send our status, wait for the remote one, then start the reader.
    pub async fn establish(
        peer: PeerId,
        session: TransportSession,
        local: Status,
        timeout: Duration,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Self, ProtocolError> {
        let TransportSession {
            capability,
            sender,
            mut receiver,
        } = session;

        sender
            .send(SyncMessage::Status(local).to_bytes()?)
            .await
            .map_err(|_| ProtocolError::Disconnected)?;

        let payload = match tokio::time::timeout(timeout, receiver.recv()).await {
            Err(_) => return Err(ProtocolError::StatusTimeout(timeout)),
            Ok(None) => return Err(ProtocolError::Disconnected),
            Ok(Some(payload)) => payload,
        };
        let status = match SyncMessage::from_bytes(&payload)? {
            SyncMessage::Status(status) => status,
            other => return Err(ProtocolError::Unexpected(other.type_name())),
        };

        log::debug!(
            "Bound {} with {}: td={} best={}",
            capability,
            peer,
            status.total_difficulty,
            crate::chain::short_hash(&status.best_hash)
        );

        let session = Self {
            name: capability.name,
            version: capability.version,
            peer,
            status,
            bound_at: Instant::now(),
            sender,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            timeout,
            closed: CancellationToken::new(),
        };
        session.spawn_reader(receiver, events);
        Ok(session)
    }

    fn spawn_reader(&self, mut receiver: mpsc::Receiver<Bytes>, events: mpsc::Sender<PeerEvent>) {
        let name = self.name.clone();
        let peer = self.peer;
        let pending = self.pending.clone();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = closed.cancelled() => break,
                    payload = receiver.recv() => match payload {
                        Some(payload) => payload,
                        None => break,
                    },
                };

                let event = match SyncMessage::from_bytes(&payload) {
                    Ok(message) => {
                        if let Some(id) = message.response_id() {
                            let waiter = lock(&pending).remove(&id);
                            match waiter {
                                Some(waiter) => {
                                    let _ = waiter.send(message);
                                }
                                None => log::debug!(
                                    "Dropping unsolicited {} #{} from {}",
                                    message.type_name(),
                                    id,
                                    peer
                                ),
                            }
                            continue;
                        }
                        if let SyncMessage::Status(_) = message {
                            log::debug!("Ignoring repeated status from {}", peer);
                            continue;
                        }
                        PeerEvent::Message {
                            protocol: name.clone(),
                            message,
                        }
                    }
                    Err(e) => PeerEvent::Error {
                        protocol: name.clone(),
                        error: ProtocolError::Malformed(e.to_string()),
                    },
                };

                if events.send(event).await.is_err() {
                    log::debug!("No listener for {} events from {}", name, peer);
                }
            }

            closed.cancel();
            // Dropping the waiters fails every outstanding request
            lock(&pending).clear();
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Status received when the session was bound
    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn bound_at(&self) -> Instant {
        self.bound_at
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop the reader; outstanding and future requests fail
    pub fn close(&self) {
        self.closed.cancel();
        lock(&self.pending).clear();
    }

    /// Send a message without waiting for an answer
    pub async fn send(&self, message: &SyncMessage) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Disconnected);
        }
        let payload = message.to_bytes()?;
        self.sender
            .send(payload)
            .await
            .map_err(|_| ProtocolError::Disconnected)
    }

    /// Re-announce our status. The remote keeps the one from binding.
    pub async fn send_status(&self, status: Status) -> Result<(), ProtocolError> {
        self.send(&SyncMessage::Status(status)).await
    }

    async fn request(
        &self,
        build: impl FnOnce(u64) -> SyncMessage,
    ) -> Result<SyncMessage, ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Disconnected);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.send(&build(id)).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::Disconnected),
            response = tokio::time::timeout(self.timeout, rx) => match response {
                Ok(Ok(message)) => Ok(message),
                Ok(Err(_)) => Err(ProtocolError::Disconnected),
                Err(_) => Err(ProtocolError::Timeout(self.timeout)),
            },
        };
        if result.is_err() {
            lock(&self.pending).remove(&id);
        }
        result
    }

    /// Fetch headers starting at `block`
    pub async fn get_block_headers(
        &self,
        block: BlockRef,
        max: u64,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, ProtocolError> {
        let response = self
            .request(|id| SyncMessage::GetBlockHeaders {
                id,
                block,
                max,
                skip,
                reverse,
            })
            .await?;
        match response {
            SyncMessage::BlockHeaders { headers, .. } => Ok(headers),
            other => Err(ProtocolError::Unexpected(other.type_name())),
        }
    }

    /// Fetch full blocks starting at `block`
    pub async fn get_blocks(
        &self,
        block: BlockRef,
        max: u64,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<Block>, ProtocolError> {
        let response = self
            .request(|id| SyncMessage::GetBlocks {
                id,
                block,
                max,
                skip,
                reverse,
            })
            .await?;
        match response {
            SyncMessage::Blocks { blocks, .. } => Ok(blocks),
            other => Err(ProtocolError::Unexpected(other.type_name())),
        }
    }
}

impl Drop for ProtocolSession {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}
