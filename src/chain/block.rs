//! Block and header types exchanged by the sync protocol
//!
//! Hashes are double SHA-256 over the header fields, hex encoded.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Difficulty assigned to generated blocks
pub const DEFAULT_DIFFICULTY: u64 = 131_072;

/// Genesis timestamp (2024-01-01T00:00:00Z)
pub const GENESIS_TIMESTAMP: i64 = 1_704_067_200;

/// Seconds between generated blocks
pub const BLOCK_TIME_SECS: i64 = 15;

/// Hex encoded block hash
pub type BlockHash = String;

/// Hash of an empty transaction list / missing parent
pub fn zero_hash() -> BlockHash {
    "0".repeat(64)
}

/// Double SHA-256, hex encoded
pub fn double_sha256_hex(data: &[u8]) -> String {
    let first = Sha256::digest(data);
    hex::encode(Sha256::digest(first))
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number (height)
    pub number: u64,
    /// Hash of the parent header
    pub parent_hash: BlockHash,
    /// Hash over the block's transactions
    pub transactions_root: BlockHash,
    /// Block creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Proof-of-work difficulty of this block
    pub difficulty: u64,
    /// Proof-of-work nonce
    pub nonce: u64,
}

impl BlockHeader {
    /// The fixed genesis header shared by every node on a network
    pub fn genesis() -> Self {
        Self {
            number: 0,
            parent_hash: zero_hash(),
            transactions_root: zero_hash(),
            timestamp: DateTime::from_timestamp(GENESIS_TIMESTAMP, 0).unwrap_or_default(),
            difficulty: DEFAULT_DIFFICULTY,
            nonce: 0,
        }
    }

    /// Calculate the hash of the header
    pub fn hash(&self) -> BlockHash {
        let data = format!(
            "{}{}{}{}{}{}",
            self.number,
            self.parent_hash,
            self.transactions_root,
            self.timestamp.timestamp(),
            self.difficulty,
            self.nonce
        );
        double_sha256_hex(data.as_bytes())
    }
}

/// A full block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Opaque, hex encoded transaction payloads
    pub transactions: Vec<String>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<String>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn genesis() -> Self {
        Self::new(BlockHeader::genesis(), Vec::new())
    }

    /// Deterministic child of `parent`: same input always yields the same block
    pub fn child_of(parent: &BlockHeader) -> Self {
        let header = BlockHeader {
            number: parent.number + 1,
            parent_hash: parent.hash(),
            transactions_root: zero_hash(),
            timestamp: parent.timestamp + chrono::Duration::seconds(BLOCK_TIME_SECS),
            difficulty: DEFAULT_DIFFICULTY,
            nonce: parent.number + 1,
        };
        Self::new(header, Vec::new())
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Reference to a block by number or by hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockRef {
    Number(u64),
    Hash(BlockHash),
}

impl std::fmt::Display for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockRef::Number(n) => write!(f, "#{}", n),
            BlockRef::Hash(h) => write!(f, "{}", short_hash(h)),
        }
    }
}

/// First 8 characters of a hash, for logging
pub fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_genesis_is_stable() {
        assert_eq!(BlockHeader::genesis().hash(), BlockHeader::genesis().hash());
        assert_eq!(BlockHeader::genesis().number, 0);
    }

    #[test]
    fn test_child_links_to_parent() {
        let genesis = Block::genesis();
        let child = Block::child_of(&genesis.header);

        assert_eq!(child.number(), 1);
        assert_eq!(child.header.parent_hash, genesis.hash());
        assert_ne!(child.hash(), genesis.hash());
        assert_eq!(child, Block::child_of(&genesis.header));
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("abcdef0123456789"), "abcdef01");
        assert_eq!(short_hash("abc"), "abc");
    }
}
