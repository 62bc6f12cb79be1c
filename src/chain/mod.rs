//! Chain collaborator
//!
//! The synchronizer only needs a narrow view of the local chain: its tip,
//! total difficulty, range reads and append-only writes. Anything that can
//! provide those (a database-backed chain, or [`MemoryChain`]) plugs in
//! through the [`Chain`] trait.

pub mod block;
pub mod memory;

pub use block::{
    short_hash, zero_hash, Block, BlockHash, BlockHeader, BlockRef, DEFAULT_DIFFICULTY,
};
pub use memory::{MemoryChain, DEFAULT_NETWORK_ID};

use thiserror::Error;

/// Chain errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Block not found: {0}")]
    NotFound(String),
    #[error("Invalid parent for block {number}: expected {expected}, got {actual}")]
    InvalidParent {
        number: u64,
        expected: String,
        actual: String,
    },
    #[error("Block {number} does not extend chain at height {height}")]
    NonContiguous { number: u64, height: u64 },
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Point-in-time view of one of the chain's tips
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    /// Latest header of this tip
    pub latest: BlockHeader,
    /// Height of `latest`
    pub height: u64,
    /// Total difficulty up to and including `latest`
    pub td: u128,
}

/// Local chain as seen by the networking core
///
/// Headers and full blocks are tracked independently: a header-only import
/// advances [`Chain::headers`] but not [`Chain::blocks`].
pub trait Chain: Send + Sync {
    /// Open the underlying store. Returns false if it was already open.
    fn open(&self) -> Result<bool, ChainError>;

    /// Close the underlying store. Returns false if it was not open.
    fn close(&self) -> Result<bool, ChainError>;

    fn network_id(&self) -> u64;

    fn genesis_hash(&self) -> BlockHash;

    fn latest_header(&self) -> Result<BlockHeader, ChainError>;

    fn latest_block(&self) -> Result<Block, ChainError>;

    /// Total difficulty of the block with the given hash
    fn total_difficulty(&self, hash: &str) -> Result<u128, ChainError>;

    /// Up to `max` blocks starting at `start`, stepping `skip + 1` numbers
    /// at a time, descending when `reverse` is set.
    fn get_blocks(
        &self,
        start: &BlockRef,
        max: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<Block>, ChainError>;

    fn get_headers(
        &self,
        start: &BlockRef,
        max: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        let blocks = self.get_blocks(start, max, skip, reverse)?;
        Ok(blocks.into_iter().map(|b| b.header).collect())
    }

    /// Append blocks. Parent linkage is checked here, not by callers.
    fn put_blocks(&self, blocks: &[Block]) -> Result<(), ChainError>;

    /// Append headers without bodies
    fn put_headers(&self, headers: &[BlockHeader]) -> Result<(), ChainError>;

    /// Header tip
    fn headers(&self) -> ChainSnapshot;

    /// Full-block tip
    fn blocks(&self) -> ChainSnapshot;
}
