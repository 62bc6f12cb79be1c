//! Sync protocol messages
//!
//! Payloads travel inside a transport session as JSON. Requests carry an id
//! that the matching response echoes back.

use crate::chain::{Block, BlockHash, BlockHeader, BlockRef};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Sync protocol version spoken by this node
pub const SYNC_PROTOCOL_VERSION: u32 = 1;

/// Largest number of headers or blocks served for one request
pub const MAX_HEADERS_PER_REQUEST: u64 = 192;

/// Chain status exchanged once when a session is bound
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub protocol_version: u32,
    pub network_id: u64,
    pub total_difficulty: u128,
    pub best_hash: BlockHash,
    pub genesis_hash: BlockHash,
}

/// Messages of the sync protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Chain status, sent first by both sides
    Status(Status),

    /// Request headers
    GetBlockHeaders {
        id: u64,
        block: BlockRef,
        max: u64,
        skip: u64,
        reverse: bool,
    },

    /// Response with headers
    BlockHeaders { id: u64, headers: Vec<BlockHeader> },

    /// Request full blocks
    GetBlocks {
        id: u64,
        block: BlockRef,
        max: u64,
        skip: u64,
        reverse: bool,
    },

    /// Response with full blocks
    Blocks { id: u64, blocks: Vec<Block> },

    /// Announce new blocks as (hash, number)
    NewBlockHashes(Vec<(BlockHash, u64)>),
}

impl SyncMessage {
    /// Serialize message to a payload
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize message from a payload
    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Id of a response message, `None` for requests and announcements
    pub fn response_id(&self) -> Option<u64> {
        match self {
            SyncMessage::BlockHeaders { id, .. } | SyncMessage::Blocks { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Get message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            SyncMessage::Status(_) => "Status",
            SyncMessage::GetBlockHeaders { .. } => "GetBlockHeaders",
            SyncMessage::BlockHeaders { .. } => "BlockHeaders",
            SyncMessage::GetBlocks { .. } => "GetBlocks",
            SyncMessage::Blocks { .. } => "Blocks",
            SyncMessage::NewBlockHashes(_) => "NewBlockHashes",
        }
    }
}
