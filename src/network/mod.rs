//! P2P Networking module
//!
//! Provides the connection side of the node.
//!
//! # Features
//! - Pluggable transports (TCP, in-process)
//! - Capability negotiation and per-protocol sessions
//! - Chain status exchange and range requests
//! - Bounded peer pool with banning

pub mod ban;
pub mod memory;
pub mod message;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;
pub mod tcp;
pub mod transport;

pub use ban::{BanList, DEFAULT_BAN_DURATION};
pub use memory::{MemoryNetwork, MemoryTransport};
pub use message::{Status, SyncMessage, MAX_HEADERS_PER_REQUEST, SYNC_PROTOCOL_VERSION};
pub use peer::{Peer, PeerEvent, PeerId};
pub use pool::{PeerPool, PoolEvent, PoolMessage, DEFAULT_MAX_PEERS};
pub use protocol::{
    Capability, Protocol, ProtocolDescriptor, ProtocolError, ProtocolRegistry, SyncProtocol,
    SYNC_PROTOCOL,
};
pub use server::{Server, ServerConfig, ServerError, ServerEvent};
pub use session::ProtocolSession;
pub use tcp::TcpTransport;
pub use transport::{
    DisconnectReason, SeedNode, Transport, TransportError, TransportEvent, TransportPeer,
    TransportSession,
};
