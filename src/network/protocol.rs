//! Sub-protocol descriptors and binding
//!
//! Protocols are resolved by their declared name through an explicit
//! [`ProtocolRegistry`]; a transport session is only ever bound by the
//! protocol registered under its capability name.

use crate::chain::{BlockHash, Chain, ChainError};
use crate::network::message::{Status, SYNC_PROTOCOL_VERSION};
use crate::network::peer::{PeerEvent, PeerId};
use crate::network::session::ProtocolSession;
use crate::network::transport::TransportSession;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Name of the chain sync protocol
pub const SYNC_PROTOCOL: &str = "sync";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    #[error("No status received within {0:?}")]
    StatusTimeout(Duration),
    #[error("Peer disconnected")]
    Disconnected,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unexpected message: {0}")]
    Unexpected(&'static str),
    #[error("NetworkId mismatch: local {local}, remote {remote}")]
    NetworkIdMismatch { local: u64, remote: u64 },
    #[error("Genesis block mismatch: local {local}, remote {remote}")]
    GenesisMismatch { local: BlockHash, remote: BlockHash },
    #[error("Required protocol not negotiated: {0}")]
    NotNegotiated(String),
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),
}

impl ProtocolError {
    /// Handshake-stage failures that only mean "not a peer for us"
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ProtocolError::StatusTimeout(_)
                | ProtocolError::NetworkIdMismatch { .. }
                | ProtocolError::GenesisMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        ProtocolError::Malformed(e.to_string())
    }
}

/// A protocol name and version pair, as advertised during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub version: u32,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Declared identity of a protocol
#[derive(Debug, Clone)]
pub struct ProtocolDescriptor {
    pub name: String,
    /// Accepted versions
    pub versions: Vec<u32>,
    /// Peers that cannot bind this protocol are not accepted
    pub required: bool,
}

impl ProtocolDescriptor {
    pub fn accepts(&self, capability: &Capability) -> bool {
        capability.name == self.name && self.versions.contains(&capability.version)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = Capability> + '_ {
        self.versions
            .iter()
            .map(move |v| Capability::new(self.name.clone(), *v))
    }
}

/// A sub-protocol that can be bound on top of a transport session
pub trait Protocol: Send + Sync {
    fn descriptor(&self) -> &ProtocolDescriptor;

    /// Prepare the protocol before the server starts
    fn open(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Exchange status over `session` and start delivering its messages to
    /// `events`.
    fn bind(
        &self,
        peer: PeerId,
        session: TransportSession,
        events: mpsc::Sender<PeerEvent>,
    ) -> BoxFuture<'_, Result<ProtocolSession, ProtocolError>>;
}

/// Protocols configured on a server, keyed by declared name
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    protocols: Vec<Arc<dyn Protocol>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a protocol. Returns false if the name is already taken.
    pub fn register(&mut self, protocol: Arc<dyn Protocol>) -> bool {
        if self.get(&protocol.descriptor().name).is_some() {
            return false;
        }
        self.protocols.push(protocol);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Protocol>> {
        self.protocols.iter().find(|p| p.descriptor().name == name)
    }

    /// The protocol that should bind a session for `capability`
    pub fn resolve(&self, capability: &Capability) -> Option<&Arc<dyn Protocol>> {
        self.get(&capability.name)
            .filter(|p| p.descriptor().accepts(capability))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Protocol>> {
        self.protocols.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.protocols.is_empty()
    }

    /// Everything this node advertises
    pub fn capabilities(&self) -> Vec<Capability> {
        self.protocols
            .iter()
            .flat_map(|p| p.descriptor().capabilities().collect::<Vec<_>>())
            .collect()
    }

    /// Intersection of `remote` with our protocols, highest shared version
    /// per protocol name.
    pub fn negotiate(&self, remote: &[Capability]) -> Vec<Capability> {
        let mut best: HashMap<&str, u32> = HashMap::new();
        for capability in remote {
            if let Some(protocol) = self.resolve(capability) {
                let name = protocol.descriptor().name.as_str();
                let entry = best.entry(name).or_insert(capability.version);
                *entry = (*entry).max(capability.version);
            }
        }
        self.protocols
            .iter()
            .filter_map(|p| {
                let name = p.descriptor().name.as_str();
                best.get(name).map(|v| Capability::new(name, *v))
            })
            .collect()
    }

    /// Names of required protocols
    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.protocols
            .iter()
            .map(|p| p.descriptor())
            .filter(|d| d.required)
            .map(|d| d.name.as_str())
    }
}

/// The chain sync protocol: status exchange plus header/block range requests
pub struct SyncProtocol {
    descriptor: ProtocolDescriptor,
    chain: Arc<dyn Chain>,
    timeout: Duration,
}

impl SyncProtocol {
    pub fn new(chain: Arc<dyn Chain>, timeout: Duration) -> Self {
        Self {
            descriptor: ProtocolDescriptor {
                name: SYNC_PROTOCOL.to_string(),
                versions: vec![SYNC_PROTOCOL_VERSION],
                required: true,
            },
            chain,
            timeout,
        }
    }

    /// Our current status, taken from the full-block tip
    pub fn status(&self) -> Status {
        let blocks = self.chain.blocks();
        Status {
            protocol_version: SYNC_PROTOCOL_VERSION,
            network_id: self.chain.network_id(),
            total_difficulty: blocks.td,
            best_hash: blocks.latest.hash(),
            genesis_hash: self.chain.genesis_hash(),
        }
    }

    fn check(&self, local: &Status, remote: &Status) -> Result<(), ProtocolError> {
        if local.network_id != remote.network_id {
            return Err(ProtocolError::NetworkIdMismatch {
                local: local.network_id,
                remote: remote.network_id,
            });
        }
        if local.genesis_hash != remote.genesis_hash {
            return Err(ProtocolError::GenesisMismatch {
                local: local.genesis_hash.clone(),
                remote: remote.genesis_hash.clone(),
            });
        }
        Ok(())
    }
}

impl Protocol for SyncProtocol {
    fn descriptor(&self) -> &ProtocolDescriptor {
        &self.descriptor
    }

    fn open(&self) -> Result<(), ProtocolError> {
        self.chain.open()?;
        Ok(())
    }

    fn bind(
        &self,
        peer: PeerId,
        session: TransportSession,
        events: mpsc::Sender<PeerEvent>,
    ) -> BoxFuture<'_, Result<ProtocolSession, ProtocolError>> {
        async move {
            let local = self.status();
            let bound =
                ProtocolSession::establish(peer, session, local.clone(), self.timeout, events)
                    .await?;
            if let Err(e) = self.check(&local, bound.status()) {
                bound.close();
                return Err(e);
            }
            Ok(bound)
        }
        .boxed()
    }
}
