//! Peers
//!
//! A [`Peer`] is one remote node connection together with the protocol
//! sessions bound on it. Peers are only constructed once every required
//! session is bound, so anything holding an `Arc<Peer>` can talk to it.

use crate::network::message::SyncMessage;
use crate::network::protocol::{ProtocolError, SYNC_PROTOCOL};
use crate::network::server::{Server, ServerInner};
use crate::network::session::ProtocolSession;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// Buffered events per peer
pub const PEER_EVENT_BUFFER: usize = 256;

/// Opaque network identity of a node
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Deterministic id derived from a name
    pub fn from_name(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Something a bound session reported
#[derive(Debug)]
pub enum PeerEvent {
    /// Request or announcement, tagged with the protocol it arrived on
    Message {
        protocol: String,
        message: SyncMessage,
    },
    /// Misbehaviour on a session
    Error {
        protocol: String,
        error: ProtocolError,
    },
}

/// A connected remote node
pub struct Peer {
    id: PeerId,
    host: String,
    port: u16,
    inbound: bool,
    transport: String,
    sessions: HashMap<String, Arc<ProtocolSession>>,
    idle: AtomicBool,
    events: Mutex<Option<mpsc::Receiver<PeerEvent>>>,
    server: Weak<ServerInner>,
}

impl Peer {
    pub fn new(id: PeerId, host: impl Into<String>, port: u16, transport: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            inbound: false,
            transport: transport.into(),
            sessions: HashMap::new(),
            idle: AtomicBool::new(true),
            events: Mutex::new(None),
            server: Weak::new(),
        }
    }

    pub fn inbound(mut self, inbound: bool) -> Self {
        self.inbound = inbound;
        self
    }

    /// Attach a bound session. Sessions are keyed by protocol name.
    pub fn with_session(mut self, session: ProtocolSession) -> Self {
        self.sessions
            .insert(session.name().to_string(), Arc::new(session));
        self
    }

    /// Receiver for events of all bound sessions
    pub fn with_events(self, events: mpsc::Receiver<PeerEvent>) -> Self {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = Some(events);
        self
    }

    pub(crate) fn with_server(mut self, server: Weak<ServerInner>) -> Self {
        self.server = server;
        self
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Release);
    }

    /// True once a session for `protocol` is bound
    pub fn understands(&self, protocol: &str) -> bool {
        self.sessions.contains_key(protocol)
    }

    pub fn session(&self, protocol: &str) -> Option<&Arc<ProtocolSession>> {
        self.sessions.get(protocol)
    }

    /// The chain sync session, if bound
    pub fn sync(&self) -> Option<&Arc<ProtocolSession>> {
        self.session(SYNC_PROTOCOL)
    }

    pub fn protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.sessions.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Take the event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<PeerEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    /// The server that accepted this peer, while it is alive
    pub fn server(&self) -> Option<Server> {
        self.server.upgrade().map(Server::from_inner)
    }

    /// Close every session; in-flight requests fail
    pub fn close(&self) {
        for session in self.sessions.values() {
            session.close();
        }
    }

    /// Full-id rendering for debug logs
    pub fn describe(&self, full_id: bool) -> String {
        let id = if full_id {
            self.id.to_hex()
        } else {
            self.id.to_string()
        };
        let mut out = format!(
            "id={} address={} transport={}",
            id,
            self.address(),
            self.transport
        );
        let protocols = self.protocols();
        if !protocols.is_empty() {
            out.push_str(&format!(" protocols={}", protocols.join(",")));
        }
        if self.inbound {
            out.push_str(" inbound=true");
        }
        out
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe(false))
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("address", &self.address())
            .field("inbound", &self.inbound)
            .field("protocols", &self.protocols())
            .finish()
    }
}
