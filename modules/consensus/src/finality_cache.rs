//! Finalized blocks that do not connect to the local tip (yet).
//!
//! Blocks land here when they arrive ahead of the tip, on a competing
//! branch, or after being rolled back. Fork choice reads the cache to find
//! a better chain. Banned hashes are tracked alongside so that a branch
//! containing one is never chosen and the same bad block is rejected
//! cheaply the second time.

use std::collections::{BTreeMap, HashMap};

use meridian_common::{Block, BlockHash};
use tracing::debug;

#[derive(Default)]
pub struct FinalityCache {
    /// Blocks by height, then hash
    blocks: BTreeMap<u64, HashMap<BlockHash, Block>>,
    /// Banned hashes and the height they claimed
    banned: HashMap<BlockHash, u64>,
}

impl FinalityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache a block. Returns false if it was already present.
    pub fn insert(&mut self, block: Block) -> bool {
        let at_height = self.blocks.entry(block.index).or_default();
        if at_height.contains_key(&block.hash) {
            return false;
        }
        debug!(block = block.index, hash = %block.hash.short(), "Caching block");
        at_height.insert(block.hash, block);
        true
    }

    pub fn get(&self, height: u64, hash: &BlockHash) -> Option<&Block> {
        self.blocks.get(&height).and_then(|blocks| blocks.get(hash))
    }

    pub fn contains(&self, height: u64, hash: &BlockHash) -> bool {
        self.get(height, hash).is_some()
    }

    /// All cached blocks at one height, in no particular order
    pub fn at_height(&self, height: u64) -> impl Iterator<Item = &Block> {
        self.blocks.get(&height).into_iter().flat_map(|blocks| blocks.values())
    }

    /// Cached blocks strictly above `height`, lowest first
    pub fn blocks_above(&self, height: u64) -> Vec<&Block> {
        self.blocks
            .range(height.saturating_add(1)..)
            .flat_map(|(_, blocks)| blocks.values())
            .collect()
    }

    pub fn remove(&mut self, height: u64, hash: &BlockHash) -> Option<Block> {
        let at_height = self.blocks.get_mut(&height)?;
        let removed = at_height.remove(hash);
        if at_height.is_empty() {
            self.blocks.remove(&height);
        }
        removed
    }

    pub fn ban(&mut self, height: u64, hash: BlockHash) {
        self.banned.insert(hash, height);
    }

    pub fn is_banned(&self, hash: &BlockHash) -> bool {
        self.banned.contains_key(hash)
    }

    /// Forget blocks and bans below `cutoff`
    pub fn prune_below(&mut self, cutoff: u64) {
        let kept = self.blocks.split_off(&cutoff);
        let dropped: usize = self.blocks.values().map(HashMap::len).sum();
        self.blocks = kept;
        self.banned.retain(|_, height| *height >= cutoff);
        if dropped > 0 {
            debug!(cutoff, dropped, "Pruned finality cache");
        }
    }

    /// Number of cached blocks
    pub fn len(&self) -> usize {
        self.blocks.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
