//! In-memory chain
//!
//! Keeps a canonical header list and a canonical block list (a prefix of the
//! header list). Used by tests and by the binary when no database is wired in.

use crate::chain::{Block, BlockHash, BlockHeader, BlockRef, Chain, ChainError, ChainSnapshot};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Network id used when none is configured
pub const DEFAULT_NETWORK_ID: u64 = 1;

struct ChainState {
    opened: bool,
    headers: Vec<BlockHeader>,
    blocks: Vec<Block>,
    /// hash -> number, for headers on the canonical list
    numbers: HashMap<BlockHash, u64>,
    /// hash -> total difficulty
    tds: HashMap<BlockHash, u128>,
}

impl ChainState {
    fn new() -> Self {
        let genesis = Block::genesis();
        let hash = genesis.hash();
        let mut numbers = HashMap::new();
        numbers.insert(hash.clone(), 0);
        let mut tds = HashMap::new();
        tds.insert(hash, genesis.header.difficulty as u128);

        Self {
            opened: false,
            headers: vec![genesis.header.clone()],
            blocks: vec![genesis],
            numbers,
            tds,
        }
    }

    fn td_of(&self, header: &BlockHeader) -> u128 {
        self.tds.get(&header.hash()).copied().unwrap_or(0)
    }

    fn resolve(&self, start: &BlockRef) -> Result<u64, ChainError> {
        match start {
            BlockRef::Number(n) => Ok(*n),
            BlockRef::Hash(h) => self
                .numbers
                .get(h)
                .copied()
                .ok_or_else(|| ChainError::NotFound(h.clone())),
        }
    }

    /// Numbers visited by a (start, max, skip, reverse) query, bounded by `len`
    fn walk(start: u64, max: usize, skip: u64, reverse: bool, len: usize) -> Vec<u64> {
        let step = skip.saturating_add(1);
        let mut numbers = Vec::new();
        let mut current = Some(start);
        while let Some(n) = current {
            if numbers.len() >= max || n >= len as u64 {
                break;
            }
            numbers.push(n);
            current = if reverse {
                n.checked_sub(step)
            } else {
                n.checked_add(step)
            };
        }
        numbers
    }

    /// Append `header` to the header list, replacing a conflicting suffix.
    /// Nothing is dropped unless the header links to its parent.
    fn push_header(&mut self, header: &BlockHeader) -> Result<bool, ChainError> {
        let number = header.number;
        let hash = header.hash();
        let len = self.headers.len() as u64;

        if number < len && self.headers[number as usize].hash() == hash {
            return Ok(false);
        }
        if number > len {
            return Err(ChainError::NonContiguous {
                number,
                height: len - 1,
            });
        }
        if number == 0 {
            return Err(ChainError::InvalidParent {
                number,
                expected: self.headers[0].hash(),
                actual: hash,
            });
        }

        let parent_hash = self.headers[number as usize - 1].hash();
        if header.parent_hash != parent_hash {
            return Err(ChainError::InvalidParent {
                number,
                expected: parent_hash,
                actual: header.parent_hash.clone(),
            });
        }

        if number < len {
            for dropped in self.headers.drain(number as usize..) {
                self.numbers.remove(&dropped.hash());
            }
            self.blocks.truncate(number as usize);
        }

        let parent = &self.headers[number as usize - 1];
        let td = self.td_of(parent) + header.difficulty as u128;
        self.tds.insert(hash.clone(), td);
        self.numbers.insert(hash, number);
        self.headers.push(header.clone());
        Ok(true)
    }
}

/// Chain held entirely in memory
pub struct MemoryChain {
    network_id: u64,
    genesis_hash: BlockHash,
    state: RwLock<ChainState>,
}

impl MemoryChain {
    /// A chain containing only the genesis block
    pub fn new() -> Self {
        Self {
            network_id: DEFAULT_NETWORK_ID,
            genesis_hash: BlockHeader::genesis().hash(),
            state: RwLock::new(ChainState::new()),
        }
    }

    /// A chain with `height` deterministic blocks on top of genesis.
    ///
    /// Two chains generated with the same height are identical, so a shorter
    /// one can always be extended with blocks from a longer one.
    pub fn with_height(height: u64) -> Self {
        let chain = Self::new();
        {
            let mut state = chain.write();
            for _ in 0..height {
                let parent = state.blocks[state.blocks.len() - 1].header.clone();
                let block = Block::child_of(&parent);
                // Generated blocks always extend the tip
                if state.push_header(&block.header).is_ok() {
                    state.blocks.push(block);
                }
            }
        }
        chain
    }

    /// Use a different network id
    pub fn with_network_id(mut self, network_id: u64) -> Self {
        self.network_id = network_id;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ChainState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self) {
        let mut state = self.write();
        if !state.opened {
            state.opened = true;
        }
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Chain for MemoryChain {
    fn open(&self) -> Result<bool, ChainError> {
        let mut state = self.write();
        if state.opened {
            return Ok(false);
        }
        state.opened = true;
        Ok(true)
    }

    fn close(&self) -> Result<bool, ChainError> {
        let mut state = self.write();
        if !state.opened {
            return Ok(false);
        }
        state.opened = false;
        Ok(true)
    }

    fn network_id(&self) -> u64 {
        self.network_id
    }

    fn genesis_hash(&self) -> BlockHash {
        self.genesis_hash.clone()
    }

    fn latest_header(&self) -> Result<BlockHeader, ChainError> {
        self.ensure_open();
        let state = self.read();
        state
            .headers
            .last()
            .cloned()
            .ok_or_else(|| ChainError::NotFound("latest header".to_string()))
    }

    fn latest_block(&self) -> Result<Block, ChainError> {
        self.ensure_open();
        let state = self.read();
        state
            .blocks
            .last()
            .cloned()
            .ok_or_else(|| ChainError::NotFound("latest block".to_string()))
    }

    fn total_difficulty(&self, hash: &str) -> Result<u128, ChainError> {
        self.ensure_open();
        let state = self.read();
        state
            .tds
            .get(hash)
            .copied()
            .ok_or_else(|| ChainError::NotFound(hash.to_string()))
    }

    fn get_blocks(
        &self,
        start: &BlockRef,
        max: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<Block>, ChainError> {
        self.ensure_open();
        let state = self.read();
        let first = state.resolve(start)?;
        let numbers = ChainState::walk(first, max, skip, reverse, state.blocks.len());
        Ok(numbers
            .into_iter()
            .map(|n| state.blocks[n as usize].clone())
            .collect())
    }

    fn get_headers(
        &self,
        start: &BlockRef,
        max: usize,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        self.ensure_open();
        let state = self.read();
        let first = state.resolve(start)?;
        let numbers = ChainState::walk(first, max, skip, reverse, state.headers.len());
        Ok(numbers
            .into_iter()
            .map(|n| state.headers[n as usize].clone())
            .collect())
    }

    fn put_blocks(&self, blocks: &[Block]) -> Result<(), ChainError> {
        self.ensure_open();
        let mut state = self.write();
        for block in blocks {
            let number = block.number();
            let have = state.blocks.len() as u64;
            if number < have && state.blocks[number as usize].hash() == block.hash() {
                continue;
            }
            if number > have {
                return Err(ChainError::NonContiguous {
                    number,
                    height: have - 1,
                });
            }
            state.push_header(&block.header)?;
            state.blocks.truncate(number as usize);
            state.blocks.push(block.clone());
        }
        Ok(())
    }

    fn put_headers(&self, headers: &[BlockHeader]) -> Result<(), ChainError> {
        self.ensure_open();
        let mut state = self.write();
        for header in headers {
            state.push_header(header)?;
        }
        Ok(())
    }

    fn headers(&self) -> ChainSnapshot {
        let state = self.read();
        let latest = state.headers[state.headers.len() - 1].clone();
        ChainSnapshot {
            height: latest.number,
            td: state.td_of(&latest),
            latest,
        }
    }

    fn blocks(&self) -> ChainSnapshot {
        let state = self.read();
        let latest = state.blocks[state.blocks.len() - 1].header.clone();
        ChainSnapshot {
            height: latest.number,
            td: state.td_of(&latest),
            latest,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_chain() {
        let chain = MemoryChain::with_height(10);
        let snapshot = chain.blocks();

        assert_eq!(snapshot.height, 10);
        assert_eq!(snapshot.td, 11 * crate::chain::DEFAULT_DIFFICULTY as u128);
        assert_eq!(chain.headers().height, 10);
        assert_eq!(
            chain.total_difficulty(&snapshot.latest.hash()).unwrap(),
            snapshot.td
        );
    }

    #[test]
    fn test_get_blocks_skip_and_reverse() {
        let chain = MemoryChain::with_height(20);

        let forward = chain.get_blocks(&BlockRef::Number(2), 4, 1, false).unwrap();
        let numbers: Vec<u64> = forward.iter().map(|b| b.number()).collect();
        assert_eq!(numbers, vec![2, 4, 6, 8]);

        let backward = chain.get_blocks(&BlockRef::Number(3), 10, 0, true).unwrap();
        let numbers: Vec<u64> = backward.iter().map(|b| b.number()).collect();
        assert_eq!(numbers, vec![3, 2, 1, 0]);

        let past_tip = chain.get_blocks(&BlockRef::Number(25), 5, 0, false).unwrap();
        assert!(past_tip.is_empty());
    }

    #[test]
    fn test_get_headers_by_hash() {
        let chain = MemoryChain::with_height(5);
        let tip = chain.latest_header().unwrap();

        let headers = chain
            .get_headers(&BlockRef::Hash(tip.hash()), 1, 0, false)
            .unwrap();
        assert_eq!(headers, vec![tip]);

        let missing = chain.get_headers(&BlockRef::Hash("ff".repeat(32)), 1, 0, false);
        assert!(matches!(missing, Err(ChainError::NotFound(_))));
    }

    #[test]
    fn test_put_blocks_extends_chain() {
        let source = MemoryChain::with_height(8);
        let target = MemoryChain::new();

        let blocks = source.get_blocks(&BlockRef::Number(1), 8, 0, false).unwrap();
        target.put_blocks(&blocks[..4]).unwrap();
        assert_eq!(target.blocks().height, 4);

        // Re-importing a known prefix is harmless
        target.put_blocks(&blocks).unwrap();
        assert_eq!(target.blocks().height, 8);
        assert_eq!(target.blocks().td, source.blocks().td);
    }

    #[test]
    fn test_put_blocks_rejects_gap() {
        let source = MemoryChain::with_height(5);
        let target = MemoryChain::new();

        let blocks = source.get_blocks(&BlockRef::Number(3), 2, 0, false).unwrap();
        let result = target.put_blocks(&blocks);
        assert!(matches!(result, Err(ChainError::NonContiguous { .. })));
        assert_eq!(target.blocks().height, 0);
    }

    #[test]
    fn test_put_blocks_rejects_bad_parent() {
        let target = MemoryChain::new();
        let mut block = Block::child_of(&BlockHeader::genesis());
        block.header.parent_hash = "ab".repeat(32);

        let result = target.put_blocks(&[block]);
        assert!(matches!(result, Err(ChainError::InvalidParent { .. })));
    }

    #[test]
    fn test_rejected_block_below_tip_keeps_history() {
        let chain = MemoryChain::with_height(5);
        let tip = chain.blocks().latest;

        let mut block = chain
            .get_blocks(&BlockRef::Number(3), 1, 0, false)
            .unwrap()
            .remove(0);
        block.header.parent_hash = "cd".repeat(32);
        block.header.nonce += 1;

        let result = chain.put_blocks(&[block]);
        assert!(matches!(result, Err(ChainError::InvalidParent { number: 3, .. })));
        assert_eq!(chain.blocks().height, 5);
        assert_eq!(chain.headers().height, 5);
        assert_eq!(chain.blocks().latest, tip);
    }

    #[test]
    fn test_linked_fork_replaces_suffix() {
        let chain = MemoryChain::with_height(5);
        let parent = chain.get_headers(&BlockRef::Number(2), 1, 0, false).unwrap();

        let mut fork = Block::child_of(&parent[0]);
        fork.header.nonce += 1;
        chain.put_blocks(&[fork.clone()]).unwrap();

        assert_eq!(chain.blocks().height, 3);
        assert_eq!(chain.headers().height, 3);
        assert_eq!(chain.blocks().latest.hash(), fork.hash());
    }

    #[test]
    fn test_headers_advance_independently() {
        let source = MemoryChain::with_height(6);
        let target = MemoryChain::new();

        let headers = source.get_headers(&BlockRef::Number(1), 6, 0, false).unwrap();
        target.put_headers(&headers).unwrap();

        assert_eq!(target.headers().height, 6);
        assert_eq!(target.blocks().height, 0);
    }

    #[test]
    fn test_open_close() {
        let chain = MemoryChain::new();
        assert!(chain.open().unwrap());
        assert!(!chain.open().unwrap());
        assert!(chain.close().unwrap());
        assert!(!chain.close().unwrap());
    }
}
