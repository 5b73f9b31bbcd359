//! Block representation within the fork tree.

use meridian_common::{Block, BlockHash};

/// Where a tree node came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOrigin {
    /// Part of the locally accepted chain.
    Canonical,
    /// Held in the finality cache; not connected to our chain yet.
    Cached,
}

/// A node in the fork tree: header facts plus parent/children links.
#[derive(Debug, Clone)]
pub struct TreeBlock {
    /// 32-byte block hash (identity key).
    pub hash: BlockHash,
    /// Block height.
    pub number: u64,
    /// Final timestamp, used to break ties between equal-height forks.
    pub timestamp: u64,
    /// Parent block hash; `None` for the root.
    pub parent: Option<BlockHash>,
    /// Child block hashes.
    pub children: Vec<BlockHash>,
    /// Subtree score: height of the highest descendant (or self).
    pub best_height: u64,
    pub origin: BlockOrigin,
}

impl TreeBlock {
    pub fn new(
        hash: BlockHash,
        number: u64,
        timestamp: u64,
        parent: Option<BlockHash>,
        origin: BlockOrigin,
    ) -> Self {
        Self {
            hash,
            number,
            timestamp,
            parent,
            children: Vec::new(),
            best_height: number,
            origin,
        }
    }

    pub fn from_block(block: &Block, origin: BlockOrigin) -> Self {
        Self::new(
            block.hash,
            block.index,
            block.timestamp,
            Some(block.prev_hash),
            origin,
        )
    }
}
