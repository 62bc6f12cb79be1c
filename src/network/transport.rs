//! Transport collaborator
//!
//! A transport owns connection establishment and the handshake. By the time
//! it reports a peer it has already negotiated one [`TransportSession`] per
//! shared capability; the server only binds protocols on top of those.

use crate::network::peer::PeerId;
use crate::network::protocol::Capability;
use bytes::Bytes;
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Buffered frames per session direction
pub const SESSION_BUFFER: usize = 256;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection reset")]
    ConnectionReset,
    #[error("Broken pipe")]
    BrokenPipe,
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("NetworkId mismatch: {local} / {remote}")]
    NetworkIdMismatch { local: u64, remote: u64 },
    #[error("Genesis block mismatch")]
    GenesisMismatch,
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Unknown endpoint: {0}")]
    UnknownEndpoint(String),
    #[error("Transport not listening")]
    NotListening,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Errors that are part of normal network churn. They are swallowed at
    /// the server boundary instead of being reported as node errors.
    pub fn is_benign(&self) -> bool {
        match self {
            TransportError::ConnectionReset
            | TransportError::BrokenPipe
            | TransportError::Timeout(_)
            | TransportError::NetworkIdMismatch { .. }
            | TransportError::GenesisMismatch
            | TransportError::HandshakeFailed(_)
            | TransportError::MalformedFrame(_) => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::InvalidData
            ),
            TransportError::UnknownEndpoint(_) | TransportError::NotListening => false,
        }
    }
}

/// Why a peer went away, with devp2p-style codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Requested = 0x00,
    NetworkError = 0x01,
    ProtocolError = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    ClientQuitting = 0x08,
    Timeout = 0x0b,
    SubprotocolError = 0x10,
}

impl DisconnectReason {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(DisconnectReason::Requested),
            0x01 => Some(DisconnectReason::NetworkError),
            0x02 => Some(DisconnectReason::ProtocolError),
            0x03 => Some(DisconnectReason::UselessPeer),
            0x04 => Some(DisconnectReason::TooManyPeers),
            0x05 => Some(DisconnectReason::AlreadyConnected),
            0x08 => Some(DisconnectReason::ClientQuitting),
            0x0b => Some(DisconnectReason::Timeout),
            0x10 => Some(DisconnectReason::SubprotocolError),
            _ => None,
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::Requested => "disconnect requested",
            DisconnectReason::NetworkError => "network error",
            DisconnectReason::ProtocolError => "breach of protocol",
            DisconnectReason::UselessPeer => "useless peer",
            DisconnectReason::TooManyPeers => "too many peers",
            DisconnectReason::AlreadyConnected => "already connected",
            DisconnectReason::ClientQuitting => "client quitting",
            DisconnectReason::Timeout => "ping timeout",
            DisconnectReason::SubprotocolError => "subprotocol error",
        };
        f.write_str(text)
    }
}

/// One negotiated sub-protocol channel between two peers
pub struct TransportSession {
    /// The capability both sides agreed on
    pub capability: Capability,
    /// Outgoing payloads
    pub sender: mpsc::Sender<Bytes>,
    /// Incoming payloads, FIFO as received
    pub receiver: mpsc::Receiver<Bytes>,
}

impl TransportSession {
    /// Two connected session ends sharing `capability`
    pub fn pair(capability: Capability) -> (TransportSession, TransportSession) {
        let (a_tx, a_rx) = mpsc::channel(SESSION_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(SESSION_BUFFER);
        (
            TransportSession {
                capability: capability.clone(),
                sender: a_tx,
                receiver: b_rx,
            },
            TransportSession {
                capability,
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("capability", &self.capability)
            .finish()
    }
}

/// A freshly handshaken remote peer
#[derive(Debug)]
pub struct TransportPeer {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub inbound: bool,
    /// Everything the remote advertised
    pub capabilities: Vec<Capability>,
    /// Sessions for the capabilities both sides share
    pub sessions: Vec<TransportSession>,
}

/// Signals emitted by a transport
#[derive(Debug)]
pub enum TransportEvent {
    Listening { url: String },
    PeerAdded(TransportPeer),
    PeerRemoved { id: PeerId, reason: DisconnectReason },
    PeerError { id: Option<PeerId>, error: TransportError },
}

/// Well-known node to connect to on startup
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SeedNode {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
}

impl SeedNode {
    /// Parse `<hex id>@<host>:<port>`
    pub fn parse(s: &str) -> Option<Self> {
        let (id, addr) = s.trim().split_once('@')?;
        let (host, port) = addr.rsplit_once(':')?;
        Some(Self {
            id: PeerId::from_hex(id)?,
            host: host.to_string(),
            port: port.parse().ok()?,
        })
    }
}

/// Connection layer under the server
pub trait Transport: Send + Sync {
    /// Short transport name, e.g. "tcp"
    fn name(&self) -> &str;

    /// Local node identity
    fn local_id(&self) -> PeerId;

    /// Start accepting peers, advertising `capabilities`, and report
    /// everything through `events`.
    fn listen(
        &self,
        port: u16,
        capabilities: Vec<Capability>,
        events: mpsc::Sender<TransportEvent>,
    ) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Dial a peer. Success is reported as a `PeerAdded` event.
    fn connect(&self, id: PeerId, host: String, port: u16)
        -> BoxFuture<'_, Result<(), TransportError>>;

    /// Contact a seed node
    fn bootstrap(&self, seed: SeedNode) -> BoxFuture<'_, Result<(), TransportError>> {
        self.connect(seed.id, seed.host, seed.port)
    }

    /// Drop the connection to a peer; reported as `PeerRemoved`
    fn disconnect(&self, id: PeerId, reason: DisconnectReason);

    /// Ask discovery not to hand out this identity for a while
    fn ban(&self, _id: PeerId, _duration: Duration) {}

    /// Stop listening and drop every connection
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_benign_classification() {
        assert!(TransportError::ConnectionReset.is_benign());
        assert!(TransportError::GenesisMismatch.is_benign());
        assert!(TransportError::HandshakeFailed("bad auth".into()).is_benign());
        assert!(TransportError::Io(std::io::ErrorKind::BrokenPipe.into()).is_benign());

        assert!(!TransportError::NotListening.is_benign());
        assert!(!TransportError::Io(std::io::ErrorKind::PermissionDenied.into()).is_benign());
    }

    #[test]
    fn test_disconnect_reason_codes() {
        let reason = DisconnectReason::TooManyPeers;
        assert_eq!(DisconnectReason::from_code(reason.code()), Some(reason));
        assert_eq!(reason.to_string(), "too many peers");
        assert_eq!(DisconnectReason::from_code(0x7f), None);
    }

    #[test]
    fn test_parse_seed_node() {
        let id = PeerId::from_name("seed");
        let seed = SeedNode::parse(&format!("{}@127.0.0.1:30303", id.to_hex())).unwrap();

        assert_eq!(seed.id, id);
        assert_eq!(seed.host, "127.0.0.1");
        assert_eq!(seed.port, 30303);
        assert!(SeedNode::parse("127.0.0.1:30303").is_none());
    }

    #[tokio::test]
    async fn test_session_pair() {
        let capability = Capability::new("sync", 1);
        let (a, mut b) = TransportSession::pair(capability);

        a.sender.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(b.receiver.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }
}
